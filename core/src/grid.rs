//! The midplane grid and per-dimension switch model (spec.md §3, §4.2,
//! component C2).

use crate::bitmap::Bitmap;
use crate::geometry::{coord_to_index, encode_coord, index_to_coord};
use bitflags::bitflags;

bitflags! {
    /// Bits consumed on a midplane's per-dimension switch. The lattice and
    /// conflict rule are defined in spec.md §3: two allocations conflict on
    /// a switch iff their usage bits overlap, except that `IN`/`OUT` may
    /// coexist (two neighboring mesh segments meeting end-to-end) and
    /// likewise `IN_PASS`/`OUT_PASS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SwitchUsage: u16 {
        const IN           = 0b0000_0001;
        const IN_PASS      = 0b0000_0010;
        const OUT          = 0b0000_0100;
        const OUT_PASS     = 0b0000_1000;
        const TORUS        = 0b0001_0000;
        const WRAPPED      = 0b0010_0000;
        const PASS         = 0b0100_0000;
        const WRAPPED_PASS = 0b1000_0000;
    }
}

impl SwitchUsage {
    /// Whether adding `other` to a switch already carrying `self` is a
    /// conflict (spec.md §3's switch usage lattice, tested by B1/S1-S3 and
    /// invariant 4 in spec.md §8).
    pub fn conflicts_with(self, other: SwitchUsage) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let combined = self | other;
        let allowed =
            combined == (Self::IN | Self::OUT) || combined == (Self::IN_PASS | Self::OUT_PASS);
        !allowed
    }
}

bitflags! {
    /// Participation of a midplane in the allocation currently being built
    /// or already committed (spec.md §3 `used`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsedState: u8 {
        /// Committed to the block being built/owned.
        const TRUE    = 0b0001;
        /// Reserved only for the duration of a scoped allocator attempt
        /// (`set_removable`); invisible to concurrent feasibility checks.
        const TEMP    = 0b0010;
        /// Touched by the scratch `alter_switch` state of an in-progress
        /// attempt, not yet committed.
        const ALTERED = 0b0100;
        /// Used only as a passthrough for another block's wire.
        const PASS    = 0b1000;
    }
}

/// One port record on a 3-D-variant switch: the midplane index this port's
/// wire targets, and whether the wire is currently in use. Port ordering
/// follows the original plugin's convention, documented here since spec.md
/// §4.5 calls the mapping variant-specific: indices 0/1 are +X/-X internal
/// wires, 2/3 are +Y/-Y, 4/5 are +Z/-Z; "internal" ports (even indices)
/// connect towards increasing coordinate, "external" (odd) towards
/// decreasing.
pub const PORT_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Port {
    pub target_mp: Option<usize>,
    pub in_use: bool,
}

/// A per-dimension switch. The 3-D variant additionally tracks a 6-port
/// table of concrete wires; the 4-D variant only tracks the usage bitmask
/// (spec.md §9 Design Notes: "An implementation should parametrize the
/// switch type over a trait/interface that exposes only `set_usage`,
/// `get_usage`, `conflicts_with`").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Switch {
    pub usage: SwitchUsage,
    pub ports: Option<[Port; PORT_COUNT]>,
}

impl Switch {
    pub fn new_3d() -> Self {
        Self {
            usage: SwitchUsage::empty(),
            ports: Some([Port::default(); PORT_COUNT]),
        }
    }

    pub fn new_4d() -> Self {
        Self {
            usage: SwitchUsage::empty(),
            ports: None,
        }
    }
}

/// Exposed by a switch implementation regardless of topology variant
/// (spec.md §9 Design Notes).
pub trait SwitchModel {
    fn get_usage(&self) -> SwitchUsage;
    fn set_usage(&mut self, usage: SwitchUsage);
    fn conflicts_with(&self, usage: SwitchUsage) -> bool;
}

impl SwitchModel for Switch {
    fn get_usage(&self) -> SwitchUsage {
        self.usage
    }

    fn set_usage(&mut self, usage: SwitchUsage) {
        self.usage = usage;
    }

    fn conflicts_with(&self, usage: SwitchUsage) -> bool {
        self.usage.conflicts_with(usage)
    }
}

/// Base hardware state of a midplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MpBaseState {
    #[default]
    Up,
    Down,
    Drain,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MpFlags: u8 {
        const DRAIN = 0b001;
        const FAIL  = 0b010;
        const ERROR = 0b100;
    }
}

/// One rectangular unit of the machine (spec.md §3 `ba_mp`).
#[derive(Debug, Clone)]
pub struct Midplane {
    pub coord: Vec<u32>,
    pub index: usize,
    pub loc: String,
    pub base_state: MpBaseState,
    pub flags: MpFlags,
    pub used: UsedState,
    pub axis_switch: Vec<Switch>,
    pub alter_switch: Vec<Switch>,
    /// Present only for the 4-D variant and sub-midplane accounting.
    pub cnode_bitmap: Option<Bitmap>,
    pub cnode_usable_bitmap: Option<Bitmap>,
    pub cnode_err_bitmap: Option<Bitmap>,
    /// Weak back-reference to the neighboring midplane in each positive
    /// dimension; `None` at a non-wrapping boundary.
    pub next_mp: Vec<Option<usize>>,
}

impl Midplane {
    pub fn is_usable(&self) -> bool {
        self.base_state == MpBaseState::Up
            && !self.flags.intersects(MpFlags::DRAIN | MpFlags::FAIL)
    }
}

/// Topology variant, distinguishing the 3-D (explicit port/wire table) and
/// 4-D (bitmask-only switches, per-compute-node bitmaps) flavors named
/// throughout spec.md §3-§4 (resolved per SPEC_FULL.md §E as a runtime
/// choice rather than a compile-time generic, since one running plugin
/// targets one topology).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimensionality {
    ThreeD,
    FourD,
}

/// The persistent N-D array of midplanes plus per-dimension wraparound
/// configuration (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct Grid {
    pub dim_sizes: Vec<u32>,
    pub wraps: Vec<bool>,
    pub variant: Dimensionality,
    pub midplanes: Vec<Midplane>,
    pub cnodes_per_mp: u32,
}

/// Handle returned by [`Grid::set_removable`]. Allocation-attempt scopes
/// (spec.md §4.2) must nest strictly: the handle from the most recently
/// opened scope must be the next one passed to [`Grid::reset_all_removed`].
/// Nothing below enforces this at runtime beyond the `&mut Grid` borrow
/// already serializing callers within one thread; violating the nesting
/// rule is a caller bug, not a recoverable error.
pub struct RemovableScope {
    indices: Vec<usize>,
}

impl Grid {
    pub fn new(dim_sizes: Vec<u32>, wraps: Vec<bool>, variant: Dimensionality, cnodes_per_mp: u32) -> Self {
        let total: usize = dim_sizes.iter().map(|&d| d as usize).product();
        let dims = dim_sizes.len();
        let mut midplanes = Vec::with_capacity(total);
        for index in 0..total {
            let coord = index_to_coord(index, &dim_sizes);
            let loc = format!("R{}", encode_coord(&coord).unwrap_or_default());
            let axis_switch = (0..dims)
                .map(|_| match variant {
                    Dimensionality::ThreeD => Switch::new_3d(),
                    Dimensionality::FourD => Switch::new_4d(),
                })
                .collect::<Vec<_>>();
            let alter_switch = axis_switch.clone();
            let (cnode_bitmap, cnode_usable_bitmap, cnode_err_bitmap) = match variant {
                Dimensionality::FourD => (
                    Some(Bitmap::new(cnodes_per_mp as usize)),
                    Some({
                        let mut bm = Bitmap::new(cnodes_per_mp as usize);
                        bm.set_range(0, cnodes_per_mp as usize, true);
                        bm
                    }),
                    Some(Bitmap::new(cnodes_per_mp as usize)),
                ),
                Dimensionality::ThreeD => (None, None, None),
            };
            midplanes.push(Midplane {
                coord,
                index,
                loc,
                base_state: MpBaseState::Up,
                flags: MpFlags::empty(),
                used: UsedState::empty(),
                axis_switch,
                alter_switch,
                cnode_bitmap,
                cnode_usable_bitmap,
                cnode_err_bitmap,
                next_mp: vec![None; dims],
            });
        }
        let mut grid = Self {
            dim_sizes,
            wraps,
            variant,
            midplanes,
            cnodes_per_mp,
        };
        grid.link_neighbors();
        grid
    }

    fn link_neighbors(&mut self) {
        let dim_sizes = self.dim_sizes.clone();
        let wraps = self.wraps.clone();
        for index in 0..self.midplanes.len() {
            let coord = index_to_coord(index, &dim_sizes);
            for d in 0..dim_sizes.len() {
                let size = dim_sizes[d];
                let at_boundary = coord[d] + 1 == size;
                let next = if at_boundary {
                    if wraps[d] {
                        let mut c = coord.clone();
                        c[d] = 0;
                        Some(coord_to_index(&c, &dim_sizes))
                    } else {
                        None
                    }
                } else {
                    let mut c = coord.clone();
                    c[d] += 1;
                    Some(coord_to_index(&c, &dim_sizes))
                };
                self.midplanes[index].next_mp[d] = next;
            }
        }
    }

    pub fn index_of(&self, coord: &[u32]) -> usize {
        coord_to_index(coord, &self.dim_sizes)
    }

    /// Restores every switch to `NONE`. Preserves midplane error/drain
    /// state when `track_down` is true (spec.md §4.2).
    pub fn reset_all_switches(&mut self, track_down: bool) {
        for mp in &mut self.midplanes {
            for sw in mp.axis_switch.iter_mut().chain(mp.alter_switch.iter_mut()) {
                sw.usage = SwitchUsage::empty();
                if let Some(ports) = sw.ports.as_mut() {
                    for p in ports.iter_mut() {
                        *p = Port::default();
                    }
                }
            }
            mp.used = UsedState::empty();
            if !track_down {
                mp.flags = MpFlags::empty();
                mp.base_state = MpBaseState::Up;
            }
        }
    }

    /// Marks the given midplanes `TEMP`-used, opening a scoped allocation
    /// context (spec.md §4.2). Contexts must nest strictly: the returned
    /// guard must be released (via [`Grid::reset_all_removed`]) before any
    /// earlier-opened guard is released.
    pub fn set_removable(&mut self, coords: &[Vec<u32>]) -> RemovableScope {
        let mut indices = Vec::with_capacity(coords.len());
        for coord in coords {
            let idx = self.index_of(coord);
            self.midplanes[idx].used.insert(UsedState::TEMP);
            indices.push(idx);
        }
        RemovableScope { indices }
    }

    /// Clears the `TEMP` bit set by a matching [`Grid::set_removable`]
    /// call.
    pub fn reset_all_removed(&mut self, scope: RemovableScope) {
        for idx in scope.indices {
            self.midplanes[idx].used.remove(UsedState::TEMP);
        }
    }

    pub fn is_temp_or_used(&self, idx: usize) -> bool {
        self.midplanes[idx]
            .used
            .intersects(UsedState::TEMP | UsedState::TRUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_grid() -> Grid {
        Grid::new(vec![4, 4, 4], vec![true, true, true], Dimensionality::ThreeD, 512)
    }

    #[test]
    fn neighbors_wrap_at_boundary() {
        let g = small_grid();
        let last = g.index_of(&[3, 0, 0]);
        assert_eq!(g.midplanes[last].next_mp[0], Some(g.index_of(&[0, 0, 0])));
    }

    #[test]
    fn neighbors_are_null_without_wrap() {
        let g = Grid::new(vec![4, 4, 4], vec![false, true, true], Dimensionality::ThreeD, 512);
        let last = g.index_of(&[3, 0, 0]);
        assert_eq!(g.midplanes[last].next_mp[0], None);
    }

    #[test]
    fn set_removable_marks_temp_and_resets() {
        let mut g = small_grid();
        let scope = g.set_removable(&[vec![1, 1, 1]]);
        let idx = g.index_of(&[1, 1, 1]);
        assert!(g.midplanes[idx].used.contains(UsedState::TEMP));
        g.reset_all_removed(scope);
        assert!(!g.midplanes[idx].used.contains(UsedState::TEMP));
    }

    #[test]
    fn switch_usage_in_out_do_not_conflict() {
        assert!(!SwitchUsage::IN.conflicts_with(SwitchUsage::OUT));
        assert!(!SwitchUsage::IN_PASS.conflicts_with(SwitchUsage::OUT_PASS));
        assert!(SwitchUsage::TORUS.conflicts_with(SwitchUsage::IN));
        assert!(SwitchUsage::IN.conflicts_with(SwitchUsage::IN));
    }

    #[test]
    fn reset_all_switches_preserves_flags_when_tracking_down() {
        let mut g = small_grid();
        let idx = g.index_of(&[0, 0, 0]);
        g.midplanes[idx].flags.insert(MpFlags::FAIL);
        g.midplanes[idx].axis_switch[0].usage = SwitchUsage::TORUS;
        g.reset_all_switches(true);
        assert!(g.midplanes[idx].flags.contains(MpFlags::FAIL));
        assert_eq!(g.midplanes[idx].axis_switch[0].usage, SwitchUsage::empty());
    }

    #[test]
    fn reset_all_switches_clears_flags_when_not_tracking_down() {
        let mut g = small_grid();
        let idx = g.index_of(&[0, 0, 0]);
        g.midplanes[idx].flags.insert(MpFlags::FAIL);
        g.reset_all_switches(false);
        assert!(g.midplanes[idx].flags.is_empty());
    }
}
