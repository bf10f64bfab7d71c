//! Finds earlier dump/key files for a card by its UID.
//!
//! Discovery only ever proposes. Nothing here writes to a card, and the
//! caller has to confirm a proposal before it is used for a restore.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::CoreError;
use crate::backend::{FileStore, StoreError};
use crate::extractor::ArtifactKind;

/// Whether `uid` identifies a real card. Empty, all-zero, all-one and
/// partially read (`?`) UIDs do not.
pub fn is_usable_uid(uid: &str) -> bool {
    let uid = uid.trim();
    !uid.is_empty()
        && !uid.contains('?')
        && !uid.eq_ignore_ascii_case("00000000")
        && !uid.eq_ignore_ascii_case("FFFFFFFF")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCandidate {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Newest dump for a UID plus the newest key file next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreProposal {
    pub uid: String,
    pub dir: PathBuf,
    pub dump: ArtifactCandidate,
    pub key: Option<ArtifactCandidate>,
}

fn token(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Keys => "key",
        ArtifactKind::Dump => "dump",
    }
}

/// `*<uid>*<token>*.bin`, case-insensitive.
fn name_matches(name: &str, uid: &str, kind: ArtifactKind) -> bool {
    let name = name.to_ascii_lowercase();
    let Some(stem) = name.strip_suffix(".bin") else {
        return false;
    };
    let uid = uid.to_ascii_lowercase();
    match stem.find(&uid) {
        Some(pos) => stem[pos + uid.len()..].contains(token(kind)),
        None => false,
    }
}

/// Newest file of `kind` for `uid` directly inside `dir`.
///
/// A directory that does not exist yields `None`. Several files sharing
/// the newest timestamp are reported as [`CoreError::AmbiguousMatch`]
/// rather than picked arbitrarily.
pub fn find_newest(
    fs: &dyn FileStore,
    dir: &Path,
    uid: &str,
    kind: ArtifactKind,
) -> Result<Option<ArtifactCandidate>, CoreError> {
    let files = match fs.list_files(dir) {
        Ok(files) => files,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let matching: Vec<_> = files
        .into_iter()
        .filter(|f| {
            f.path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| name_matches(n, uid, kind))
        })
        .collect();
    let Some(newest) = matching.iter().map(|f| f.modified).max() else {
        return Ok(None);
    };
    let mut top: Vec<_> = matching
        .into_iter()
        .filter(|f| f.modified == newest)
        .collect();
    if top.len() > 1 {
        return Err(CoreError::AmbiguousMatch {
            kind,
            candidates: top.into_iter().map(|f| f.path).collect(),
        });
    }
    Ok(top.pop().map(|f| ArtifactCandidate {
        path: f.path,
        modified: f.modified,
    }))
}

/// Search `dirs` in order and stop at the first one holding a dump for
/// `uid`. The key file is taken from that same directory.
pub fn discover_restore_pair(
    fs: &dyn FileStore,
    dirs: &[PathBuf],
    uid: &str,
) -> Result<Option<RestoreProposal>, CoreError> {
    if !is_usable_uid(uid) {
        return Err(CoreError::InvalidArgument(format!(
            "UID '{uid}' cannot be used for discovery"
        )));
    }
    for dir in dirs {
        let Some(dump) = find_newest(fs, dir, uid, ArtifactKind::Dump)? else {
            continue;
        };
        let key = find_newest(fs, dir, uid, ArtifactKind::Keys)?;
        tracing::info!(
            uid,
            dir = %dir.display(),
            dump = %dump.path.display(),
            has_key = key.is_some(),
            "restore pair proposed"
        );
        return Ok(Some(RestoreProposal {
            uid: uid.to_ascii_uppercase(),
            dir: dir.clone(),
            dump,
            key,
        }));
    }
    Ok(None)
}

/// `hf-mf-<UID>-key.bin` in `dir`, or the first free `-key-NNN.bin`.
pub fn next_free_key_name(fs: &dyn FileStore, dir: &Path, uid: Option<&str>) -> PathBuf {
    let base = match uid {
        Some(uid) if is_usable_uid(uid) => format!("hf-mf-{}", uid.to_ascii_uppercase()),
        _ => "hf-mf-unknown".to_string(),
    };
    let first = dir.join(format!("{base}-key.bin"));
    if !fs.exists(&first) {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{base}-key-{n:03}.bin")))
        .find(|p| !fs.exists(p))
        .unwrap_or(first)
}
