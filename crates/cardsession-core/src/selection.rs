//! Hierarchical tri-state selection over blocks, sectors and the whole card.
//!
//! Only block states are stored. Sector, global and trailer aggregates are
//! recomputed explicitly after every mutation, so they can never drift from
//! the blocks they summarize.

use crate::CoreError;
use crate::topology::CardTopology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    Unchecked,
    Partial,
    Checked,
}

impl CheckState {
    /// Aggregate of `checked` selected members out of `total`.
    pub fn aggregate(checked: usize, total: usize) -> Self {
        if checked == 0 {
            CheckState::Unchecked
        } else if checked == total {
            CheckState::Checked
        } else {
            CheckState::Partial
        }
    }

    /// Bulk toggles never apply `Partial`: an ambiguous request escalates to
    /// `Checked` instead of collapsing to an empty selection.
    fn promote(self) -> Self {
        match self {
            CheckState::Partial => CheckState::Checked,
            other => other,
        }
    }

    fn is_checked(self) -> bool {
        self == CheckState::Checked
    }
}

#[derive(Debug, Clone)]
pub struct SelectionModel {
    topology: CardTopology,
    blocks: Vec<bool>,
    sectors: Vec<CheckState>,
    global: CheckState,
    trailers: CheckState,
}

impl SelectionModel {
    /// Fresh model with nothing selected.
    pub fn new(topology: CardTopology) -> Self {
        let blocks = vec![false; topology.block_count()];
        let sectors = vec![CheckState::Unchecked; topology.sector_count()];
        Self {
            topology,
            blocks,
            sectors,
            global: CheckState::Unchecked,
            trailers: CheckState::Unchecked,
        }
    }

    pub fn topology(&self) -> &CardTopology {
        &self.topology
    }

    pub fn toggle_block(&mut self, block: usize, state: CheckState) -> Result<(), CoreError> {
        let sector = self.topology.sector_of(block)?;
        self.blocks[block] = state.promote().is_checked();
        self.recompute_sector(sector);
        self.recompute_global();
        self.recompute_trailers();
        Ok(())
    }

    pub fn toggle_sector(&mut self, sector: usize, state: CheckState) -> Result<(), CoreError> {
        let range = self.topology.blocks_of(sector)?;
        let checked = state.promote().is_checked();
        self.blocks[range].fill(checked);
        self.recompute_sector(sector);
        self.recompute_global();
        self.recompute_trailers();
        Ok(())
    }

    pub fn toggle_global(&mut self, state: CheckState) {
        let checked = state.promote().is_checked();
        self.blocks.fill(checked);
        self.recompute_all();
    }

    /// Set only the trailer block of every sector. Non-trailer blocks keep
    /// their state.
    pub fn toggle_trailers(&mut self, state: CheckState) {
        let checked = state.promote().is_checked();
        let trailers: Vec<usize> = self.topology.trailer_blocks().collect();
        for block in trailers {
            self.blocks[block] = checked;
        }
        self.recompute_all();
    }

    pub fn block_state(&self, block: usize) -> Result<CheckState, CoreError> {
        self.topology.sector_of(block)?;
        Ok(if self.blocks[block] {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        })
    }

    pub fn sector_state(&self, sector: usize) -> Result<CheckState, CoreError> {
        self.topology.sector_start(sector)?;
        Ok(self.sectors[sector])
    }

    pub fn global_state(&self) -> CheckState {
        self.global
    }

    /// Aggregate over trailer blocks only, exposed independently of the
    /// full-card aggregate.
    pub fn trailer_state(&self) -> CheckState {
        self.trailers
    }

    /// Indices of selected blocks, ascending.
    pub fn selected_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, &checked)| checked.then_some(i))
            .collect()
    }

    fn recompute_sector(&mut self, sector: usize) {
        let Ok(range) = self.topology.blocks_of(sector) else {
            return;
        };
        let total = range.len();
        let checked = self.blocks[range].iter().filter(|&&b| b).count();
        self.sectors[sector] = CheckState::aggregate(checked, total);
    }

    fn recompute_global(&mut self) {
        self.global = if self.sectors.iter().all(|&s| s == CheckState::Checked) {
            CheckState::Checked
        } else if self.sectors.iter().all(|&s| s == CheckState::Unchecked) {
            CheckState::Unchecked
        } else {
            CheckState::Partial
        };
    }

    fn recompute_trailers(&mut self) {
        let total = self.topology.sector_count();
        let checked = self
            .topology
            .trailer_blocks()
            .filter(|&b| self.blocks[b])
            .count();
        self.trailers = CheckState::aggregate(checked, total);
    }

    fn recompute_all(&mut self) {
        for sector in 0..self.topology.sector_count() {
            self.recompute_sector(sector);
        }
        self.recompute_global();
        self.recompute_trailers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CardKind;

    fn model(kind: CardKind) -> SelectionModel {
        SelectionModel::new(CardTopology::new(kind))
    }

    #[test]
    fn sector_aggregate_follows_block_count() {
        // 4-block and 16-block sectors both
        let mut m = model(CardKind::Classic4K);
        for sector in [0usize, 35] {
            let range = m.topology().blocks_of(sector).unwrap();
            let n = range.len();
            for k in 0..=n {
                m.toggle_sector(sector, CheckState::Unchecked).unwrap();
                for b in range.clone().take(k) {
                    m.toggle_block(b, CheckState::Checked).unwrap();
                }
                let expected = if k == 0 {
                    CheckState::Unchecked
                } else if k == n {
                    CheckState::Checked
                } else {
                    CheckState::Partial
                };
                assert_eq!(m.sector_state(sector).unwrap(), expected, "k={k} n={n}");
            }
        }
    }

    #[test]
    fn global_partial_promotes_to_checked() {
        let mut a = model(CardKind::Classic1K);
        let mut b = model(CardKind::Classic1K);
        a.toggle_global(CheckState::Partial);
        b.toggle_global(CheckState::Checked);
        assert_eq!(a.selected_blocks(), b.selected_blocks());
        assert_eq!(a.global_state(), CheckState::Checked);
        assert_eq!(a.trailer_state(), CheckState::Checked);
    }

    #[test]
    fn sector_toggle_never_yields_partial() {
        let mut m = model(CardKind::Classic1K);
        m.toggle_block(1, CheckState::Checked).unwrap();
        assert_eq!(m.sector_state(0).unwrap(), CheckState::Partial);
        m.toggle_sector(0, CheckState::Partial).unwrap();
        assert_eq!(m.sector_state(0).unwrap(), CheckState::Checked);
        m.toggle_sector(0, CheckState::Unchecked).unwrap();
        assert_eq!(m.sector_state(0).unwrap(), CheckState::Unchecked);
    }

    #[test]
    fn global_tracks_sector_states() {
        let mut m = model(CardKind::Mini);
        assert_eq!(m.global_state(), CheckState::Unchecked);
        m.toggle_block(5, CheckState::Checked).unwrap();
        assert_eq!(m.global_state(), CheckState::Partial);
        m.toggle_block(5, CheckState::Unchecked).unwrap();
        assert_eq!(m.global_state(), CheckState::Unchecked);
        for s in 0..m.topology().sector_count() {
            m.toggle_sector(s, CheckState::Checked).unwrap();
        }
        assert_eq!(m.global_state(), CheckState::Checked);
    }

    #[test]
    fn trailer_toggle_leaves_data_blocks_alone() {
        let mut m = model(CardKind::Classic1K);
        m.toggle_sector(2, CheckState::Checked).unwrap();
        m.toggle_trailers(CheckState::Unchecked);
        assert_eq!(m.block_state(8).unwrap(), CheckState::Checked);
        assert_eq!(m.block_state(11).unwrap(), CheckState::Unchecked);
        assert_eq!(m.sector_state(2).unwrap(), CheckState::Partial);
        assert_eq!(m.trailer_state(), CheckState::Unchecked);

        m.toggle_trailers(CheckState::Checked);
        assert_eq!(m.sector_state(2).unwrap(), CheckState::Checked);
        assert_eq!(m.sector_state(0).unwrap(), CheckState::Partial);
        assert_eq!(m.trailer_state(), CheckState::Checked);
        assert_eq!(m.global_state(), CheckState::Partial);
    }

    #[test]
    fn trailer_partial_promotes_to_checked() {
        let mut a = model(CardKind::Mini);
        let mut b = model(CardKind::Mini);
        a.toggle_block(1, CheckState::Checked).unwrap();
        b.toggle_block(1, CheckState::Checked).unwrap();
        a.toggle_trailers(CheckState::Partial);
        b.toggle_trailers(CheckState::Checked);
        assert_eq!(a.selected_blocks(), b.selected_blocks());
        assert_eq!(a.selected_blocks(), vec![1, 3, 7, 11, 15, 19]);
        assert_eq!(a.trailer_state(), CheckState::Checked);
        assert_eq!(a.sector_state(0).unwrap(), CheckState::Partial);
    }

    #[test]
    fn trailer_aggregate_tracks_block_toggles() {
        let mut m = model(CardKind::Classic1K);
        m.toggle_block(3, CheckState::Checked).unwrap();
        assert_eq!(m.trailer_state(), CheckState::Partial);
        m.toggle_block(3, CheckState::Unchecked).unwrap();
        assert_eq!(m.trailer_state(), CheckState::Unchecked);
    }

    #[test]
    fn out_of_range_toggles_fail_without_change() {
        let mut m = model(CardKind::Mini);
        assert!(m.toggle_block(20, CheckState::Checked).is_err());
        assert!(m.toggle_sector(5, CheckState::Checked).is_err());
        assert!(m.selected_blocks().is_empty());
    }
}
