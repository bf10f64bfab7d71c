//! Guards that run before any write that can permanently damage a card.
//!
//! Every check here works on raw block data only. Rejections are returned
//! as typed errors; callers decide how to report them.

use crate::records::{Block, CardData, Key, normalize_hex};
use crate::topology::CardTopology;
use crate::{CoreError, IntegrityError};

/// Trailer of a blank card: transport keys, access bits `FF078069`.
pub const DEFAULT_TRAILER: Block = Block::from_bytes([
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x07, 0x80, 0x69, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
]);

/// XOR of the four UID bytes, stored at block 0 byte 4.
pub fn compute_bcc(uid: [u8; 4]) -> u8 {
    uid.iter().fold(0, |acc, b| acc ^ b)
}

/// Check a block 0 read before rewriting the UID it carries.
///
/// A checksum mismatch usually means a 7-byte-UID card or a truncated read;
/// either way the workflow must stop until the card is read again.
pub fn validate_block_zero(block0: &str) -> Result<Block, CoreError> {
    let block: Block = block0.parse()?;
    if block.is_zero() {
        return Err(IntegrityError::MissingRead("block 0 is all zero".to_string()).into());
    }
    let bytes = block.as_bytes();
    let expected = compute_bcc([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if bytes[4] != expected {
        tracing::warn!(
            found = bytes[4],
            expected,
            "block 0 BCC mismatch, refusing UID workflow"
        );
        return Err(IntegrityError::BccMismatch {
            expected,
            found: bytes[4],
        }
        .into());
    }
    Ok(block)
}

/// Require an authoritative block 0 before generating a blank template or
/// wiping. The checksum is deliberately not checked here.
pub fn require_real_block_zero(block0: Option<&str>) -> Result<Block, CoreError> {
    let Some(raw) = block0 else {
        return Err(IntegrityError::MissingRead("block 0 has not been read".to_string()).into());
    };
    let normalized = normalize_hex(raw);
    if normalized.len() != 32 {
        return Err(IntegrityError::MissingRead(format!(
            "block 0 holds {} hex symbols instead of 32",
            normalized.len()
        ))
        .into());
    }
    let block: Block = normalized.parse()?;
    if block.is_zero() {
        return Err(IntegrityError::MissingRead("block 0 is all zero".to_string()).into());
    }
    Ok(block)
}

/// Repair a trailer whose KeyB field was zeroed (or left at the transport
/// value) by an export, using the KeyB tracked for that sector.
pub fn merge_trailer_key_b(trailer: Block, tracked_key_b: Option<Key>) -> Block {
    match tracked_key_b {
        Some(key) if trailer.key_b().is_sentinel() && !key.is_sentinel() => {
            trailer.with_key_b(key)
        }
        _ => trailer,
    }
}

/// Apply [`merge_trailer_key_b`] to every known trailer of `data` using its
/// tracked keys. Returns how many trailers changed.
pub fn patch_trailers(data: &mut CardData) -> usize {
    let trailers: Vec<usize> = data.topology().trailer_blocks().collect();
    let mut patched = 0;
    for (sector, trailer) in trailers.into_iter().enumerate() {
        let Some(block) = data.blocks()[trailer] else {
            continue;
        };
        let merged = merge_trailer_key_b(block, data.keys()[sector].key_b);
        if merged != block && data.set_block(trailer, Some(merged)).is_ok() {
            patched += 1;
        }
    }
    patched
}

/// Build a new block 0 carrying `new_uid`, its recomputed BCC and the
/// original SAK/ATQA/manufacturer bytes.
pub fn rewrite_uid(block0: &str, new_uid: &str) -> Result<Block, CoreError> {
    let original = validate_block_zero(block0)?;
    let uid_hex = normalize_hex(new_uid);
    if uid_hex.len() != 8 {
        return Err(CoreError::Validation(format!(
            "UID must be exactly 8 hex symbols, got {}",
            uid_hex.len()
        )));
    }
    let mut uid = [0u8; 4];
    hex::decode_to_slice(&uid_hex, &mut uid)
        .map_err(|e| CoreError::Validation(format!("UID is not valid hex: {e}")))?;

    let mut bytes = *original.as_bytes();
    bytes[0..4].copy_from_slice(&uid);
    bytes[4] = compute_bcc(uid);
    Ok(Block::from_bytes(bytes))
}

/// Blank-card image for `topology` that keeps the real `block0`: trailers
/// get [`DEFAULT_TRAILER`], every other block is zeroed.
pub fn blank_template(topology: &CardTopology, block0: Block) -> Vec<Option<Block>> {
    (0..topology.block_count())
        .map(|i| {
            Some(if i == 0 {
                block0
            } else if topology.is_trailer(i) {
                DEFAULT_TRAILER
            } else {
                Block::ZERO
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CardKind;

    const GOOD_BLOCK0: &str = "11223344440804006263646566676869";

    #[test]
    fn bcc_is_xor_of_uid() {
        assert_eq!(compute_bcc([0x11, 0x22, 0x33, 0x44]), 0x44);
        assert_eq!(compute_bcc([0xDE, 0xAD, 0xBE, 0xEF]), 0x22);
    }

    #[test]
    fn validate_accepts_matching_bcc() {
        let block = validate_block_zero("11223344440000000000000000000000").unwrap();
        assert_eq!(block.as_bytes()[4], 0x44);
        assert!(validate_block_zero(GOOD_BLOCK0).is_ok());
    }

    #[test]
    fn validate_rejects_any_other_bcc() {
        for bcc in (0u8..=255).filter(|&b| b != 0x44) {
            let block0 = format!("11223344{bcc:02X}0000000000000000000000");
            match validate_block_zero(&block0) {
                Err(CoreError::Integrity(IntegrityError::BccMismatch { expected, found })) => {
                    assert_eq!(expected, 0x44);
                    assert_eq!(found, bcc);
                }
                other => panic!("bcc {bcc:02X}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn validate_rejects_malformed_and_empty() {
        assert!(matches!(
            validate_block_zero("1122334444"),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            validate_block_zero(&"0".repeat(32)),
            Err(CoreError::Integrity(IntegrityError::MissingRead(_)))
        ));
    }

    #[test]
    fn require_real_block_zero_cases() {
        assert!(matches!(
            require_real_block_zero(Some(&"0".repeat(32))),
            Err(CoreError::Integrity(IntegrityError::MissingRead(_)))
        ));
        assert!(matches!(
            require_real_block_zero(Some(&"1".repeat(30))),
            Err(CoreError::Integrity(IntegrityError::MissingRead(_)))
        ));
        assert!(matches!(
            require_real_block_zero(None),
            Err(CoreError::Integrity(IntegrityError::MissingRead(_)))
        ));
        // BCC is wrong here, but that is not this guard's concern.
        assert!(require_real_block_zero(Some("11223344FF0804006263646566676869")).is_ok());
    }

    #[test]
    fn merge_replaces_zeroed_key_b() {
        let trailer: Block = "FFFFFFFFFFFFFF078069000000000000".parse().unwrap();
        let tracked: Key = "AABBCCDDEEFF".parse().unwrap();
        let merged = merge_trailer_key_b(trailer, Some(tracked));
        assert_eq!(merged.to_string(), "FFFFFFFFFFFFFF078069AABBCCDDEEFF");
        assert_eq!(merge_trailer_key_b(trailer, None), trailer);
    }

    #[test]
    fn merge_keeps_real_key_b_and_ignores_sentinel_tracked_key() {
        let real: Block = "FFFFFFFFFFFFFF078069123456789ABC".parse().unwrap();
        let tracked: Key = "AABBCCDDEEFF".parse().unwrap();
        assert_eq!(merge_trailer_key_b(real, Some(tracked)), real);

        let zeroed: Block = "FFFFFFFFFFFFFF078069000000000000".parse().unwrap();
        assert_eq!(merge_trailer_key_b(zeroed, Some(Key::DEFAULT)), zeroed);
        assert_eq!(merge_trailer_key_b(zeroed, Some(Key::ZERO)), zeroed);
    }

    #[test]
    fn patch_trailers_only_touches_sectors_with_real_key_b() {
        use crate::records::KeyType;
        let mut data = CardData::new(CardTopology::new(CardKind::Mini));
        let zeroed: Block = "A0A1A2A3A4A5FF078069000000000000".parse().unwrap();
        data.set_block(3, Some(zeroed)).unwrap();
        data.set_block(7, Some(zeroed)).unwrap();
        data.set_key(0, KeyType::B, Some("AABBCCDDEEFF".parse().unwrap()))
            .unwrap();
        data.set_key(1, KeyType::B, Some(Key::DEFAULT)).unwrap();

        assert_eq!(patch_trailers(&mut data), 1);
        assert_eq!(
            data.block(3).unwrap().unwrap().to_string(),
            "A0A1A2A3A4A5FF078069AABBCCDDEEFF"
        );
        assert_eq!(data.block(7).unwrap(), Some(zeroed));
    }

    #[test]
    fn rewrite_uid_recomputes_bcc_and_keeps_tail() {
        let block = rewrite_uid(GOOD_BLOCK0, "deadbeef").unwrap();
        assert_eq!(block.to_string(), "DEADBEEF220804006263646566676869");
    }

    #[test]
    fn rewrite_uid_aborts_on_bad_source_block() {
        let bad = "11223344000804006263646566676869";
        assert!(matches!(
            rewrite_uid(bad, "DEADBEEF"),
            Err(CoreError::Integrity(IntegrityError::BccMismatch { .. }))
        ));
        assert!(matches!(
            rewrite_uid(GOOD_BLOCK0, "DEADBE"),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn blank_template_keeps_block_zero() {
        let topo = CardTopology::new(CardKind::Classic1K);
        let block0: Block = GOOD_BLOCK0.parse().unwrap();
        let template = blank_template(&topo, block0);
        assert_eq!(template.len(), 64);
        assert_eq!(template[0], Some(block0));
        assert_eq!(template[1], Some(Block::ZERO));
        assert_eq!(template[3], Some(DEFAULT_TRAILER));
        assert_eq!(template[63], Some(DEFAULT_TRAILER));
    }
}
