//! Static addressing tables for the supported card capacities.
//!
//! A card's blocks are partitioned into sectors, contiguously and in
//! increasing order. Small sectors hold 4 blocks; the upper region of a 4K
//! card uses 16-block sectors.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Capacity variant of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CardKind {
    #[serde(rename = "mini")]
    Mini,
    #[serde(rename = "1k")]
    Classic1K,
    #[serde(rename = "2k")]
    Classic2K,
    #[serde(rename = "4k")]
    Classic4K,
}

impl CardKind {
    pub const ALL: [CardKind; 4] = [
        CardKind::Mini,
        CardKind::Classic1K,
        CardKind::Classic2K,
        CardKind::Classic4K,
    ];

    /// Data capacity in bytes.
    pub fn data_bytes(self) -> usize {
        match self {
            CardKind::Mini => 320,
            CardKind::Classic1K => 1024,
            CardKind::Classic2K => 2048,
            CardKind::Classic4K => 4096,
        }
    }

    /// Size flag understood by the client's `hf mf` commands.
    pub fn size_flag(self) -> &'static str {
        match self {
            CardKind::Mini => "--mini",
            CardKind::Classic1K => "--1k",
            CardKind::Classic2K => "--2k",
            CardKind::Classic4K => "--4k",
        }
    }

    fn small_sectors(self) -> usize {
        match self {
            CardKind::Mini => 5,
            CardKind::Classic1K => 16,
            CardKind::Classic2K | CardKind::Classic4K => 32,
        }
    }

    fn large_sectors(self) -> usize {
        match self {
            CardKind::Classic4K => 8,
            _ => 0,
        }
    }
}

impl fmt::Display for CardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CardKind::Mini => "mini",
            CardKind::Classic1K => "1k",
            CardKind::Classic2K => "2k",
            CardKind::Classic4K => "4k",
        };
        f.write_str(name)
    }
}

impl FromStr for CardKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mini" | "320" => Ok(CardKind::Mini),
            "1k" | "1024" => Ok(CardKind::Classic1K),
            "2k" | "2048" => Ok(CardKind::Classic2K),
            "4k" | "4096" => Ok(CardKind::Classic4K),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown card type '{other}' (expected mini, 1k, 2k or 4k)"
            ))),
        }
    }
}

const SMALL_SECTOR_BLOCKS: usize = 4;
const LARGE_SECTOR_BLOCKS: usize = 16;

/// Block/sector layout of one card variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardTopology {
    kind: CardKind,
    block_count: usize,
    sector_start: Vec<usize>,
    sector_blocks: Vec<usize>,
}

impl CardTopology {
    pub fn new(kind: CardKind) -> Self {
        let sector_blocks: Vec<usize> = std::iter::repeat_n(SMALL_SECTOR_BLOCKS, kind.small_sectors())
            .chain(std::iter::repeat_n(LARGE_SECTOR_BLOCKS, kind.large_sectors()))
            .collect();

        let mut sector_start = Vec::with_capacity(sector_blocks.len());
        let mut next = 0;
        for &count in &sector_blocks {
            sector_start.push(next);
            next += count;
        }

        Self {
            kind,
            block_count: next,
            sector_start,
            sector_blocks,
        }
    }

    pub fn kind(&self) -> CardKind {
        self.kind
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn sector_count(&self) -> usize {
        self.sector_start.len()
    }

    pub fn sector_start(&self, sector: usize) -> Result<usize, CoreError> {
        self.check_sector(sector)?;
        Ok(self.sector_start[sector])
    }

    pub fn sector_block_count(&self, sector: usize) -> Result<usize, CoreError> {
        self.check_sector(sector)?;
        Ok(self.sector_blocks[sector])
    }

    /// Block indices belonging to `sector`.
    pub fn blocks_of(&self, sector: usize) -> Result<Range<usize>, CoreError> {
        self.check_sector(sector)?;
        let start = self.sector_start[sector];
        Ok(start..start + self.sector_blocks[sector])
    }

    /// Sector owning `block`: the largest `i` with `sector_start[i] <= block`.
    pub fn sector_of(&self, block: usize) -> Result<usize, CoreError> {
        self.check_block(block)?;
        Ok(self.sector_start.partition_point(|&start| start <= block) - 1)
    }

    /// Last block of `sector`, which holds its keys and access bits.
    pub fn trailer_block_of(&self, sector: usize) -> Result<usize, CoreError> {
        self.check_sector(sector)?;
        Ok(self.sector_start[sector] + self.sector_blocks[sector] - 1)
    }

    pub fn is_trailer(&self, block: usize) -> bool {
        self.sector_of(block)
            .and_then(|s| self.trailer_block_of(s))
            .is_ok_and(|t| t == block)
    }

    /// Trailer block of every sector, in sector order.
    pub fn trailer_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.sector_start
            .iter()
            .zip(&self.sector_blocks)
            .map(|(start, count)| start + count - 1)
    }

    fn check_block(&self, block: usize) -> Result<(), CoreError> {
        if block < self.block_count {
            Ok(())
        } else {
            Err(CoreError::OutOfRange {
                what: "block",
                index: block,
                len: self.block_count,
            })
        }
    }

    fn check_sector(&self, sector: usize) -> Result<(), CoreError> {
        if sector < self.sector_count() {
            Ok(())
        } else {
            Err(CoreError::OutOfRange {
                what: "sector",
                index: sector,
                len: self.sector_count(),
            })
        }
    }
}

impl From<CardKind> for CardTopology {
    fn from(kind: CardKind) -> Self {
        CardTopology::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_match_block_counts() {
        for kind in CardKind::ALL {
            let topo = CardTopology::new(kind);
            assert_eq!(topo.block_count() * 16, kind.data_bytes(), "{kind}");
        }
    }

    #[test]
    fn sectors_partition_blocks_contiguously() {
        for kind in CardKind::ALL {
            let topo = CardTopology::new(kind);
            let mut expected_start = 0;
            for s in 0..topo.sector_count() {
                assert_eq!(topo.sector_start(s).unwrap(), expected_start);
                expected_start += topo.sector_block_count(s).unwrap();
            }
            assert_eq!(expected_start, topo.block_count());
        }
    }

    #[test]
    fn sector_of_four_k_upper_region() {
        let topo = CardTopology::new(CardKind::Classic4K);
        assert_eq!(topo.sector_count(), 40);
        assert_eq!(topo.sector_of(127).unwrap(), 31);
        assert_eq!(topo.sector_of(128).unwrap(), 32);
        assert_eq!(topo.sector_of(143).unwrap(), 32);
        assert_eq!(topo.sector_of(144).unwrap(), 33);
        assert_eq!(topo.sector_of(255).unwrap(), 39);
    }

    #[test]
    fn trailer_blocks_are_last_of_sector() {
        let topo = CardTopology::new(CardKind::Classic4K);
        assert_eq!(topo.trailer_block_of(0).unwrap(), 3);
        assert_eq!(topo.trailer_block_of(31).unwrap(), 127);
        assert_eq!(topo.trailer_block_of(32).unwrap(), 143);
        assert_eq!(topo.trailer_block_of(39).unwrap(), 255);
        assert!(topo.is_trailer(143));
        assert!(!topo.is_trailer(142));
        assert_eq!(topo.trailer_blocks().count(), 40);
    }

    #[test]
    fn out_of_range_indices_fail() {
        let topo = CardTopology::new(CardKind::Classic1K);
        assert!(matches!(
            topo.sector_of(64),
            Err(CoreError::OutOfRange { what: "block", index: 64, len: 64 })
        ));
        assert!(matches!(
            topo.trailer_block_of(16),
            Err(CoreError::OutOfRange { what: "sector", .. })
        ));
    }

    #[test]
    fn card_kind_parses_names_and_sizes() {
        assert_eq!("4K".parse::<CardKind>().unwrap(), CardKind::Classic4K);
        assert_eq!("320".parse::<CardKind>().unwrap(), CardKind::Mini);
        assert!("8k".parse::<CardKind>().is_err());
    }
}
