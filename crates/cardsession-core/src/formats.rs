//! Codecs for the dump and key artifacts the client reads and writes.
//!
//! Dumps come in two shapes: raw binary (16 bytes per block) and a text
//! form with one 32-hex line per block. Key files are binary only: the
//! KeyA of every sector followed by the KeyB of every sector.

use std::path::Path;

use crate::CoreError;
use crate::records::{BLOCK_LEN, Block, KEY_LEN, Key, KeyRecord};

/// Placeholder line for an unknown block in text dumps.
const UNKNOWN_LINE: &str = "--------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    /// `.bin` / `.dump`
    Binary,
    /// `.eml` / `.txt`
    Text,
}

impl DumpFormat {
    /// Pick the format from the file extension. Anything unrecognised is
    /// treated as binary, which is what the client writes by default.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("eml") | Some("txt") => DumpFormat::Text,
            _ => DumpFormat::Binary,
        }
    }
}

/// Decode a dump into block records. The result may be shorter or longer
/// than any particular topology; fitting it is the caller's job.
pub fn decode_dump(bytes: &[u8], format: DumpFormat) -> Result<Vec<Option<Block>>, CoreError> {
    match format {
        DumpFormat::Binary => {
            if bytes.is_empty() || bytes.len() % BLOCK_LEN != 0 {
                return Err(CoreError::Validation(format!(
                    "binary dump length {} is not a non-zero multiple of {BLOCK_LEN}",
                    bytes.len()
                )));
            }
            Ok(bytes
                .chunks_exact(BLOCK_LEN)
                .map(|chunk| {
                    let mut raw = [0u8; BLOCK_LEN];
                    raw.copy_from_slice(chunk);
                    Some(Block::from_bytes(raw))
                })
                .collect())
        }
        DumpFormat::Text => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| CoreError::Validation(format!("text dump is not UTF-8: {e}")))?;
            let mut blocks = Vec::new();
            for (lineno, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.chars().all(|c| c == '-') {
                    blocks.push(None);
                    continue;
                }
                let block = line.parse::<Block>().map_err(|e| {
                    CoreError::Validation(format!("text dump line {}: {e}", lineno + 1))
                })?;
                blocks.push(Some(block));
            }
            if blocks.is_empty() {
                return Err(CoreError::Validation("text dump holds no blocks".to_string()));
            }
            Ok(blocks)
        }
    }
}

/// Encode block records. Binary output needs every block to be known;
/// text output writes a dash line for unknown blocks.
pub fn encode_dump(blocks: &[Option<Block>], format: DumpFormat) -> Result<Vec<u8>, CoreError> {
    match format {
        DumpFormat::Binary => {
            let mut out = Vec::with_capacity(blocks.len() * BLOCK_LEN);
            for (i, block) in blocks.iter().enumerate() {
                let block = block.ok_or_else(|| {
                    CoreError::Validation(format!(
                        "block {i} is empty, binary dumps need every block"
                    ))
                })?;
                out.extend_from_slice(block.as_bytes());
            }
            Ok(out)
        }
        DumpFormat::Text => {
            let mut out = String::with_capacity(blocks.len() * 33);
            for block in blocks {
                match block {
                    Some(b) => out.push_str(&b.to_string()),
                    None => out.push_str(UNKNOWN_LINE),
                }
                out.push('\n');
            }
            Ok(out.into_bytes())
        }
    }
}

/// Decode a key file for `sectors` sectors.
pub fn decode_keys(bytes: &[u8], sectors: usize) -> Result<Vec<KeyRecord>, CoreError> {
    let expected = sectors * KEY_LEN * 2;
    if bytes.len() < expected {
        return Err(CoreError::Validation(format!(
            "key file holds {} bytes, {expected} needed for {sectors} sectors",
            bytes.len()
        )));
    }
    if bytes.len() > expected {
        tracing::warn!(
            len = bytes.len(),
            expected,
            "key file longer than card, ignoring the tail"
        );
    }
    let key_at = |offset: usize| {
        let mut raw = [0u8; KEY_LEN];
        raw.copy_from_slice(&bytes[offset..offset + KEY_LEN]);
        Key::from_bytes(raw)
    };
    let b_base = sectors * KEY_LEN;
    Ok((0..sectors)
        .map(|s| KeyRecord {
            key_a: Some(key_at(s * KEY_LEN)),
            key_b: Some(key_at(b_base + s * KEY_LEN)),
        })
        .collect())
}

/// Encode key records. Unknown keys are written as the transport key.
pub fn encode_keys(keys: &[KeyRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.len() * KEY_LEN * 2);
    for record in keys {
        out.extend_from_slice(record.key_a.unwrap_or(Key::DEFAULT).as_bytes());
    }
    for record in keys {
        out.extend_from_slice(record.key_b.unwrap_or(Key::DEFAULT).as_bytes());
    }
    out
}
