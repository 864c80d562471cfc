//! Selection (picking) passes.
//!
//! During hardware selection the ray caster writes identifiers instead of
//! colors: first the prop id, then the voxel id split into two 24-bit halves.

use crate::timestamp::TimeStamp;

/// Mask of one 24-bit id half.
const ID_MASK_24: u64 = 0x00FF_FFFF;

/// The identifier written by the current selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SelectionPass {
    /// Regular rendering.
    #[default]
    None,
    /// Prop identifier.
    ActorId,
    /// Low 24 bits of the voxel id.
    CellIdLow24,
    /// High 24 bits of the voxel id.
    CellIdHigh24,
}

/// Narrow view of an external selection manager.
pub trait Selector {
    /// The pass currently being rendered.
    fn current_pass(&self) -> SelectionPass;

    /// True when the selection targets cells; volumes can only be picked by cell.
    fn selects_cells(&self) -> bool;

    /// Identifier of the prop being rendered.
    fn prop_id(&self) -> u32;
}

/// Encodes a 24-bit index as RGB, most significant byte in red.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn index_to_color(index: u32) -> [u8; 3] {
    [(index >> 16) as u8, (index >> 8) as u8, index as u8]
}

/// Decodes a color produced by [`index_to_color`].
#[must_use]
pub fn color_to_index(rgb: [u8; 3]) -> u32 {
    (u32::from(rgb[0]) << 16) | (u32::from(rgb[1]) << 8) | u32::from(rgb[2])
}

/// Splits a voxel id into its low and high 24-bit halves.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn split_cell_id(id: u64) -> (u32, u32) {
    ((id & ID_MASK_24) as u32, ((id >> 24) & ID_MASK_24) as u32)
}

/// Joins the halves produced by [`split_cell_id`].
#[must_use]
pub fn join_cell_id(low: u32, high: u32) -> u64 {
    (u64::from(high) << 24) | u64::from(low)
}

/// Tracks the selection pass across frames.
#[derive(Debug, Clone, Default)]
pub struct PickingState {
    pass: SelectionPass,
    picking: bool,
    mtime: TimeStamp,
}

impl PickingState {
    /// Refreshes the state from the selector, if one is active.
    ///
    /// The stamp is bumped on every frame rendered while picking, and once when
    /// picking ends.
    pub fn update(&mut self, selector: Option<&dyn Selector>) {
        match selector.filter(|s| s.selects_cells()) {
            Some(selector) => {
                self.picking = true;
                self.pass = selector.current_pass();
                self.mtime.modified();
            }
            None => {
                self.picking = false;
                if self.pass != SelectionPass::None {
                    self.pass = SelectionPass::None;
                    self.mtime.modified();
                }
            }
        }
    }

    /// True while a selection is in progress.
    pub fn is_picking(&self) -> bool {
        self.picking
    }

    /// Current pass.
    pub fn pass(&self) -> SelectionPass {
        self.pass
    }

    /// Last change of the selection state.
    pub fn mtime(&self) -> TimeStamp {
        self.mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSelector(SelectionPass, bool);

    impl Selector for FixedSelector {
        fn current_pass(&self) -> SelectionPass {
            self.0
        }
        fn selects_cells(&self) -> bool {
            self.1
        }
        fn prop_id(&self) -> u32 {
            7
        }
    }

    #[test]
    fn test_color_index_roundtrip() {
        for index in [0_u32, 1, 255, 256, 65_535, 0x00AB_CDEF] {
            assert_eq!(color_to_index(index_to_color(index)), index);
        }
        assert_eq!(index_to_color(0x0001_0203), [1, 2, 3]);
    }

    #[test]
    fn test_cell_id_split() {
        let id = 0x0000_1234_5678_9ABC_u64;
        let (low, high) = split_cell_id(id);
        assert_eq!(low, 0x78_9ABC);
        assert_eq!(high, 0x12_3456);
        assert_eq!(join_cell_id(low, high), id);
    }

    #[test]
    fn test_picking_state_transitions() {
        let mut state = PickingState::default();
        state.update(None);
        assert!(state.mtime().is_unset());

        let selector = FixedSelector(SelectionPass::CellIdLow24, true);
        state.update(Some(&selector));
        let t_pick = state.mtime();
        assert!(state.is_picking());
        assert_eq!(state.pass(), SelectionPass::CellIdLow24);

        state.update(Some(&selector));
        assert!(state.mtime() > t_pick);

        state.update(None);
        let t_leave = state.mtime();
        assert_eq!(state.pass(), SelectionPass::None);
        state.update(None);
        assert_eq!(state.mtime(), t_leave);
    }

    #[test]
    fn test_point_selection_ignored() {
        let mut state = PickingState::default();
        state.update(Some(&FixedSelector(SelectionPass::ActorId, false)));
        assert!(!state.is_picking());
    }
}
