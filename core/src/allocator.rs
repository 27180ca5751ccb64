//! The block allocator (spec.md §4.5, component C5): rectangular block
//! search across rotations/elongations/starting offsets, small-block
//! I/O-node partitioning, and 4-D sub-block placement.

use crate::bitmap::Bitmap;
use crate::block::ConnType;
use crate::config::DenyPassthrough;
use crate::error::{CoreError, Result};
use crate::geometry::{coord_to_index, enumerate_geometries, rotations};
use crate::grid::Grid;
use crate::wiring::{self, WiringResult};

/// Inputs to a single rectangular-block search (spec.md §4.5).
pub struct AllocRequest<'a> {
    pub geo: &'a [u32],
    pub conn_type: &'a [ConnType],
    pub rotate: bool,
    pub elongate: bool,
    /// If set, only this starting coordinate is tried.
    pub start_hint: Option<Vec<u32>>,
    pub deny_passthrough: &'a DenyPassthrough,
}

/// Searches for a rectangular block satisfying `req` among midplanes
/// marked available in `avail` (one bit per midplane index, `true` means
/// usable — not already owned by another block, not down or drained).
/// Tries the requested geometry first, then (per `req`) its rotations and
/// same-volume elongations, at every lexicographically-ordered starting
/// coordinate, releasing each failed attempt's scope before the next
/// (spec.md §4.5 steps 1-5).
pub fn find_rectangle(grid: &mut Grid, avail: &Bitmap, req: &AllocRequest) -> Result<WiringResult> {
    let dims = grid.dim_sizes.len();
    if req.geo.len() != dims || req.conn_type.len() != dims {
        return Err(CoreError::InvalidInput);
    }

    for geo in candidate_geometries(req.geo, &grid.dim_sizes, req.rotate, req.elongate) {
        for start in candidate_starts(&grid.dim_sizes, &geo, req.start_hint.as_deref()) {
            let rect = rectangle_coords(&grid.dim_sizes, &start, &geo);
            let rect_idx: Vec<usize> = rect.iter().map(|c| grid.index_of(c)).collect();
            if rect_idx.iter().any(|&i| !avail.get(i)) {
                continue;
            }

            let outside = outside_coords(grid, &rect_idx);
            let scope = grid.set_removable(&outside);
            let attempt = wiring::check_and_set(grid, &start, &geo, req.conn_type, req.deny_passthrough);
            grid.reset_all_removed(scope);

            if let Ok(result) = attempt {
                return Ok(result);
            }
        }
    }
    Err(CoreError::NoSpace)
}

fn candidate_geometries(requested: &[u32], dim_sizes: &[u32], rotate: bool, elongate: bool) -> Vec<Vec<u32>> {
    let mut out = vec![requested.to_vec()];
    if rotate {
        for r in rotations(requested) {
            if !out.contains(&r) {
                out.push(r);
            }
        }
    }
    if elongate {
        let volume: u32 = requested.iter().product();
        for cand in enumerate_geometries(volume, dim_sizes) {
            if !out.contains(&cand.geo) {
                out.push(cand.geo);
            }
        }
    }
    out
}

/// Every valid starting coordinate for `geo` on a machine of `dim_sizes`,
/// in lexicographic order (spec.md §4.5: "order of starting coordinates
/// is lexicographic from the origin; this determines tie-breaking"). A
/// dimension the geometry fills entirely only has one valid start (0).
fn candidate_starts(dim_sizes: &[u32], geo: &[u32], hint: Option<&[u32]>) -> Vec<Vec<u32>> {
    if let Some(h) = hint {
        return vec![h.to_vec()];
    }
    let dims = dim_sizes.len();
    let mut starts: Vec<Vec<u32>> = vec![vec![]];
    for d in 0..dims {
        let max_start = if geo[d] >= dim_sizes[d] { 0 } else { dim_sizes[d] - geo[d] };
        let mut next = Vec::with_capacity(starts.len() * (max_start as usize + 1));
        for base in &starts {
            for v in 0..=max_start {
                let mut c = base.clone();
                c.push(v);
                next.push(c);
            }
        }
        starts = next;
    }
    starts
}

/// Every coordinate covered by the rectangle of shape `geo` anchored at
/// `start`, wrapping per-dimension (valid since `find_rectangle` already
/// restricted `start` so the rectangle fits).
fn rectangle_coords(dim_sizes: &[u32], start: &[u32], geo: &[u32]) -> Vec<Vec<u32>> {
    let dims = dim_sizes.len();
    let mut coords: Vec<Vec<u32>> = vec![vec![]];
    for d in 0..dims {
        let size = dim_sizes[d];
        let mut next = Vec::with_capacity(coords.len() * geo[d] as usize);
        for base in &coords {
            for offset in 0..geo[d] {
                let mut c = base.clone();
                c.push((start[d] + offset) % size);
                next.push(c);
            }
        }
        coords = next;
    }
    coords
}

/// The complement of `rect_idx` over the whole grid, used to open the
/// scoped `TEMP` context `find_rectangle` holds for the duration of one
/// `check_and_set` attempt (spec.md §4.5 step 2).
fn outside_coords(grid: &Grid, rect_idx: &[usize]) -> Vec<Vec<u32>> {
    grid.midplanes
        .iter()
        .enumerate()
        .filter(|&(i, _)| !rect_idx.contains(&i))
        .map(|(_, mp)| mp.coord.clone())
        .collect()
}

/// Reserves a contiguous I/O-node range per requested small-block size,
/// in request order, such that every range is disjoint and none exceeds
/// the midplane's total I/O-node count (spec.md §4.5 "Small blocks"). The
/// nodecard-to-I/O-node ratio is `ionodes_per_mp / (midplane_node_cnt /
/// nodecard_node_cnt)`; a concrete deployment's port table is documented
/// by its `Config` rather than hardcoded here, since the mapping is
/// variant-specific (spec.md §4.5).
pub fn partition_small_blocks(
    requested_node_counts: &[u32],
    midplane_node_cnt: u32,
    ionodes_per_mp: u32,
) -> Result<Vec<(u32, u32)>> {
    if midplane_node_cnt == 0 || ionodes_per_mp == 0 {
        return Err(CoreError::InvalidInput);
    }
    let mut ranges = Vec::with_capacity(requested_node_counts.len());
    let mut cursor = 0u32;
    for &nodes in requested_node_counts {
        let io_len = (nodes as u64 * ionodes_per_mp as u64 / midplane_node_cnt as u64) as u32;
        if io_len == 0 {
            return Err(CoreError::InvalidInput);
        }
        if cursor + io_len > ionodes_per_mp {
            return Err(CoreError::InvalidInput);
        }
        ranges.push((cursor, io_len));
        cursor += io_len;
    }
    if cursor != ionodes_per_mp {
        return Err(CoreError::InvalidInput);
    }
    Ok(ranges)
}

/// `ba_sub_block_in_bitmap` (spec.md §4.5): finds a rectangular
/// sub-region of shape matching `cnode_count` within a midplane's
/// compute-node lattice (`lattice_dims`, e.g. `[4, 4, 4, 4]` for a 256-way
/// split of a 4-D midplane) whose every cell is set in `avail`. Ties
/// (multiple fits) go to the lexicographically-first starting corner.
pub fn sub_block_in_bitmap(
    cnode_count: u32,
    lattice_dims: &[u32],
    avail: &Bitmap,
) -> Option<(Vec<u32>, Vec<u32>)> {
    let total: u32 = lattice_dims.iter().product();
    if cnode_count == 0 || cnode_count > total {
        return None;
    }
    for cand in enumerate_geometries(cnode_count, lattice_dims) {
        for start in candidate_starts(lattice_dims, &cand.geo, None) {
            let coords = rectangle_coords(lattice_dims, &start, &cand.geo);
            if coords
                .iter()
                .all(|c| avail.get(coord_to_index(c, lattice_dims)))
            {
                return Some((start, cand.geo));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Dimensionality;

    fn grid_4x4x4() -> Grid {
        Grid::new(vec![4, 4, 4], vec![true, true, true], Dimensionality::ThreeD, 512)
    }

    fn all_avail(len: usize) -> Bitmap {
        let mut bm = Bitmap::new(len);
        bm.set_range(0, len, true);
        bm
    }

    #[test]
    fn finds_requested_geometry_at_origin_when_fully_free() {
        let mut grid = grid_4x4x4();
        let avail = all_avail(grid.midplanes.len());
        let req = AllocRequest {
            geo: &[2, 2, 2],
            conn_type: &[ConnType::Torus, ConnType::Torus, ConnType::Torus],
            rotate: false,
            elongate: false,
            start_hint: None,
            deny_passthrough: &DenyPassthrough::None,
        };
        let r = find_rectangle(&mut grid, &avail, &req).unwrap();
        assert_eq!(r.owned.len(), 8);
        assert!(r.owned.contains(&vec![0, 0, 0]));
    }

    #[test]
    fn skips_starts_overlapping_unavailable_midplanes() {
        let mut grid = grid_4x4x4();
        let mut avail = all_avail(grid.midplanes.len());
        let blocked = grid.index_of(&[0, 0, 0]);
        avail.set(blocked, false);

        let req = AllocRequest {
            geo: &[1, 1, 1],
            conn_type: &[ConnType::Mesh, ConnType::Mesh, ConnType::Mesh],
            rotate: false,
            elongate: false,
            start_hint: None,
            deny_passthrough: &DenyPassthrough::None,
        };
        let r = find_rectangle(&mut grid, &avail, &req).unwrap();
        assert_ne!(r.owned[0], vec![0, 0, 0]);
    }

    #[test]
    fn returns_no_space_when_exhausted() {
        let mut grid = grid_4x4x4();
        let avail = Bitmap::new(grid.midplanes.len());
        let req = AllocRequest {
            geo: &[1, 1, 1],
            conn_type: &[ConnType::Mesh, ConnType::Mesh, ConnType::Mesh],
            rotate: false,
            elongate: false,
            start_hint: None,
            deny_passthrough: &DenyPassthrough::None,
        };
        assert!(matches!(
            find_rectangle(&mut grid, &avail, &req),
            Err(CoreError::NoSpace)
        ));
    }

    #[test]
    fn partitions_small_blocks_disjointly() {
        let ranges = partition_small_blocks(&[128, 128, 256], 512, 16).unwrap();
        assert_eq!(ranges, vec![(0, 4), (4, 4), (8, 8)]);
    }

    #[test]
    fn partition_rejects_oversubscription() {
        assert!(matches!(
            partition_small_blocks(&[512, 512], 512, 16),
            Err(CoreError::InvalidInput)
        ));
    }

    #[test]
    fn partition_rejects_undersubscription() {
        assert!(matches!(
            partition_small_blocks(&[128, 128], 512, 16),
            Err(CoreError::InvalidInput)
        ));
    }

    #[test]
    fn sub_block_in_bitmap_picks_lexicographic_first_fit() {
        let lattice = vec![4u32, 4, 4, 4];
        let mut avail = Bitmap::new(256);
        avail.set_range(0, 256, true);
        let (start, geo) = sub_block_in_bitmap(16, &lattice, &avail).unwrap();
        assert_eq!(geo.iter().product::<u32>(), 16);
        assert_eq!(start, vec![0, 0, 0, 0]);
    }

    #[test]
    fn sub_block_in_bitmap_skips_unavailable_region() {
        let lattice = vec![4u32, 4, 1, 1];
        let mut avail = Bitmap::new(16);
        avail.set_range(0, 16, true);
        // Block out the origin corner so a 4-cell (2x2) fit must move.
        for c in [[0u32, 0, 0, 0], [0, 1, 0, 0], [1, 0, 0, 0], [1, 1, 0, 0]] {
            avail.set(coord_to_index(&c, &lattice), false);
        }
        let (start, _geo) = sub_block_in_bitmap(4, &lattice, &avail).unwrap();
        assert_ne!(start, vec![0, 0, 0, 0]);
    }
}
