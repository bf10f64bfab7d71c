//! Card data held by a session: one optional 16-byte record per block and
//! one pair of optional keys per sector.

use std::fmt;
use std::str::FromStr;

use crate::CoreError;
use crate::topology::CardTopology;

pub const BLOCK_LEN: usize = 16;
pub const KEY_LEN: usize = 6;

/// Strip whitespace and uppercase, the form every hex field is stored in.
pub fn normalize_hex(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn decode_fixed<const N: usize>(input: &str, what: &str) -> Result<[u8; N], CoreError> {
    let hex_str = normalize_hex(input);
    if hex_str.len() != N * 2 {
        return Err(CoreError::Validation(format!(
            "{what} must consist of {} hex symbols, got {}",
            N * 2,
            hex_str.len()
        )));
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(&hex_str, &mut out)
        .map_err(|e| CoreError::Validation(format!("{what} is not valid hex: {e}")))?;
    Ok(out)
}

/// One 16-byte block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block([u8; BLOCK_LEN]);

impl Block {
    pub const ZERO: Block = Block([0; BLOCK_LEN]);

    pub const fn from_bytes(bytes: [u8; BLOCK_LEN]) -> Self {
        Block(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Trailer bytes 0..6.
    pub fn key_a(&self) -> Key {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&self.0[0..6]);
        Key(key)
    }

    /// Trailer bytes 6..10.
    pub fn access_bits(&self) -> [u8; 4] {
        let mut bits = [0u8; 4];
        bits.copy_from_slice(&self.0[6..10]);
        bits
    }

    /// Trailer bytes 10..16.
    pub fn key_b(&self) -> Key {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&self.0[10..16]);
        Key(key)
    }

    pub fn with_key_a(mut self, key: Key) -> Self {
        self.0[0..6].copy_from_slice(&key.0);
        self
    }

    pub fn with_key_b(mut self, key: Key) -> Self {
        self.0[10..16].copy_from_slice(&key.0);
        self
    }
}

impl FromStr for Block {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<BLOCK_LEN>(s, "Data").map(Block)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({self})")
    }
}

/// One 6-byte sector key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Transport key of a blank card.
    pub const DEFAULT: Key = Key([0xFF; KEY_LEN]);
    pub const ZERO: Key = Key([0; KEY_LEN]);

    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// All-zero or all-one: the placeholders an export writes when it does
    /// not actually know the key.
    pub fn is_sentinel(&self) -> bool {
        *self == Key::ZERO || *self == Key::DEFAULT
    }
}

impl FromStr for Key {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<KEY_LEN>(s, "Key").map(Key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    A,
    B,
}

/// Keys tracked for one sector, independent of the trailer contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyRecord {
    pub key_a: Option<Key>,
    pub key_b: Option<Key>,
}

impl KeyRecord {
    pub fn get(&self, key_type: KeyType) -> Option<Key> {
        match key_type {
            KeyType::A => self.key_a,
            KeyType::B => self.key_b,
        }
    }

    pub fn set(&mut self, key_type: KeyType, key: Option<Key>) {
        match key_type {
            KeyType::A => self.key_a = key,
            KeyType::B => self.key_b = key,
        }
    }

    /// Key to authenticate with: A first, then B.
    pub fn preferred(&self) -> Option<(KeyType, Key)> {
        self.key_a
            .map(|k| (KeyType::A, k))
            .or_else(|| self.key_b.map(|k| (KeyType::B, k)))
    }
}

/// Block and key records for the current card.
#[derive(Debug, Clone)]
pub struct CardData {
    topology: CardTopology,
    blocks: Vec<Option<Block>>,
    keys: Vec<KeyRecord>,
}

impl CardData {
    pub fn new(topology: CardTopology) -> Self {
        let blocks = vec![None; topology.block_count()];
        let keys = vec![KeyRecord::default(); topology.sector_count()];
        Self {
            topology,
            blocks,
            keys,
        }
    }

    pub fn topology(&self) -> &CardTopology {
        &self.topology
    }

    pub fn blocks(&self) -> &[Option<Block>] {
        &self.blocks
    }

    pub fn keys(&self) -> &[KeyRecord] {
        &self.keys
    }

    pub fn block(&self, index: usize) -> Result<Option<Block>, CoreError> {
        self.topology.sector_of(index)?;
        Ok(self.blocks[index])
    }

    pub fn set_block(&mut self, index: usize, block: Option<Block>) -> Result<(), CoreError> {
        self.topology.sector_of(index)?;
        self.blocks[index] = block;
        Ok(())
    }

    pub fn key(&self, sector: usize) -> Result<KeyRecord, CoreError> {
        self.topology.sector_start(sector)?;
        Ok(self.keys[sector])
    }

    pub fn set_key(
        &mut self,
        sector: usize,
        key_type: KeyType,
        key: Option<Key>,
    ) -> Result<(), CoreError> {
        self.topology.sector_start(sector)?;
        self.keys[sector].set(key_type, key);
        Ok(())
    }

    /// Replace every block record. `blocks` is fitted to the topology:
    /// extra entries are dropped, missing ones become empty.
    pub fn replace_blocks(&mut self, mut blocks: Vec<Option<Block>>) {
        blocks.resize(self.topology.block_count(), None);
        self.blocks = blocks;
    }

    /// Replace every key record, fitted to the sector count like
    /// [`replace_blocks`](Self::replace_blocks).
    pub fn replace_keys(&mut self, mut keys: Vec<KeyRecord>) {
        keys.resize(self.topology.sector_count(), KeyRecord::default());
        self.keys = keys;
    }

    /// UID from block 0 as 8 uppercase hex characters.
    pub fn uid(&self) -> Option<String> {
        self.blocks
            .first()
            .copied()
            .flatten()
            .map(|b| hex::encode_upper(&b.as_bytes()[0..4]))
    }

    /// Number of sectors with at least one known key.
    pub fn known_key_sectors(&self) -> usize {
        self.keys
            .iter()
            .filter(|k| k.key_a.is_some() || k.key_b.is_some())
            .count()
    }

    /// Copy KeyA/KeyB out of each known trailer into the key records.
    ///
    /// An all-zero KeyB in a trailer never replaces a tracked key: exports
    /// zero that field when the real key was not read back.
    pub fn data_to_key(&mut self) -> usize {
        let mut updated = 0;
        for (sector, trailer) in self.topology.trailer_blocks().enumerate() {
            let Some(block) = self.blocks[trailer] else {
                continue;
            };
            let record = &mut self.keys[sector];
            record.key_a = Some(block.key_a());
            let key_b = block.key_b();
            if key_b != Key::ZERO || record.key_b.is_none() {
                record.key_b = Some(key_b);
            }
            updated += 1;
        }
        updated
    }

    /// Write known keys into the key fields of each trailer. Trailers that
    /// are still empty are built from the default trailer template.
    pub fn key_to_data(&mut self) -> usize {
        let mut updated = 0;
        let trailers: Vec<usize> = self.topology.trailer_blocks().collect();
        for (sector, trailer) in trailers.into_iter().enumerate() {
            let record = self.keys[sector];
            if record.key_a.is_none() && record.key_b.is_none() {
                continue;
            }
            let mut block = self.blocks[trailer].unwrap_or(crate::integrity::DEFAULT_TRAILER);
            if let Some(key) = record.key_a {
                block = block.with_key_a(key);
            }
            if let Some(key) = record.key_b {
                block = block.with_key_b(key);
            }
            self.blocks[trailer] = Some(block);
            updated += 1;
        }
        updated
    }

    /// Indices whose contents differ from `other` (compared over this
    /// card's block range).
    pub fn diff(&self, other: &[Option<Block>]) -> Vec<usize> {
        (0..self.blocks.len())
            .filter(|&i| self.blocks[i] != other.get(i).copied().flatten())
            .collect()
    }

    /// Non-empty blocks or keys that would be lost moving to `target`.
    pub fn dropped_by(&self, target: &CardTopology) -> usize {
        let blocks = self
            .blocks
            .iter()
            .skip(target.block_count())
            .filter(|b| b.is_some())
            .count();
        let keys = self
            .keys
            .iter()
            .skip(target.sector_count())
            .filter(|k| k.key_a.is_some() || k.key_b.is_some())
            .count();
        blocks + keys
    }

    /// Rebuild for `target`, keeping everything that still fits.
    pub fn resized(&self, target: CardTopology) -> CardData {
        let mut data = CardData::new(target);
        data.replace_blocks(self.blocks.clone());
        data.replace_keys(self.keys.clone());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CardKind;

    fn block(hex_str: &str) -> Block {
        hex_str.parse().unwrap()
    }

    #[test]
    fn block_parses_spaced_lowercase_hex() {
        let b = block("11 22 33 44 44 08 04 00 62 63 64 65 66 67 68 69");
        assert_eq!(b.to_string(), "11223344440804006263646566676869");
    }

    #[test]
    fn block_rejects_wrong_length_and_non_hex() {
        assert!(matches!(
            "1122".parse::<Block>(),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            "ZZ223344440804006263646566676869".parse::<Block>(),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn trailer_fields_follow_layout() {
        let t = block("A0A1A2A3A4A5FF078069B0B1B2B3B4B5");
        assert_eq!(t.key_a().to_string(), "A0A1A2A3A4A5");
        assert_eq!(t.access_bits(), [0xFF, 0x07, 0x80, 0x69]);
        assert_eq!(t.key_b().to_string(), "B0B1B2B3B4B5");
    }

    #[test]
    fn key_sentinels() {
        assert!(Key::DEFAULT.is_sentinel());
        assert!(Key::ZERO.is_sentinel());
        assert!(!"AABBCCDDEEFF".parse::<Key>().unwrap().is_sentinel());
    }

    #[test]
    fn data_to_key_keeps_tracked_key_b_over_zeroed_field() {
        let mut data = CardData::new(CardTopology::new(CardKind::Mini));
        let tracked: Key = "AABBCCDDEEFF".parse().unwrap();
        data.set_key(0, KeyType::B, Some(tracked)).unwrap();
        data.set_block(3, Some(block("A0A1A2A3A4A5FF078069000000000000")))
            .unwrap();
        data.set_block(7, Some(block("FFFFFFFFFFFFFF078069B0B1B2B3B4B5")))
            .unwrap();

        assert_eq!(data.data_to_key(), 2);
        let s0 = data.key(0).unwrap();
        assert_eq!(s0.key_a.unwrap().to_string(), "A0A1A2A3A4A5");
        assert_eq!(s0.key_b, Some(tracked));
        let s1 = data.key(1).unwrap();
        assert_eq!(s1.key_b.unwrap().to_string(), "B0B1B2B3B4B5");
        assert_eq!(data.key(2).unwrap(), KeyRecord::default());
    }

    #[test]
    fn key_to_data_fills_trailers() {
        let mut data = CardData::new(CardTopology::new(CardKind::Mini));
        data.set_key(1, KeyType::A, Some("112233445566".parse().unwrap()))
            .unwrap();
        assert_eq!(data.key_to_data(), 1);
        assert_eq!(
            data.block(7).unwrap().unwrap().to_string(),
            "112233445566FF078069FFFFFFFFFFFF"
        );
        assert_eq!(data.block(3).unwrap(), None);
    }

    #[test]
    fn uid_reads_first_four_bytes() {
        let mut data = CardData::new(CardTopology::new(CardKind::Classic1K));
        assert_eq!(data.uid(), None);
        data.set_block(0, Some(block("DEADBEEF220804006263646566676869")))
            .unwrap();
        assert_eq!(data.uid().as_deref(), Some("DEADBEEF"));
    }

    #[test]
    fn shrinking_reports_dropped_records() {
        let mut data = CardData::new(CardTopology::new(CardKind::Classic4K));
        data.set_block(200, Some(Block::ZERO)).unwrap();
        data.set_key(39, KeyType::A, Some(Key::DEFAULT)).unwrap();
        data.set_block(10, Some(Block::ZERO)).unwrap();
        let target = CardTopology::new(CardKind::Classic1K);
        assert_eq!(data.dropped_by(&target), 2);
        let small = data.resized(target);
        assert_eq!(small.blocks().len(), 64);
        assert_eq!(small.block(10).unwrap(), Some(Block::ZERO));
    }

    #[test]
    fn diff_lists_changed_blocks() {
        let mut data = CardData::new(CardTopology::new(CardKind::Mini));
        data.set_block(1, Some(Block::ZERO)).unwrap();
        let mut other = vec![None; 20];
        other[2] = Some(Block::ZERO);
        assert_eq!(data.diff(&other), vec![1, 2]);
    }
}
