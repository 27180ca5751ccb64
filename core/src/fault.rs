//! Hardware-fault propagation (spec.md §4.8, component C8).
//!
//! Per-compute-node error bits roll up to per-midplane, then per-block
//! error ratios; a block whose ratio crosses `max_block_err` is pushed to
//! `ERROR_FLAG` and its jobs are returned for requeue. Nodecard-down
//! synthesizes a small `ERROR`-state block so the scheduler sees exactly
//! the lost capacity rather than draining the whole midplane.

use crate::block::{BlockHandle, BlockLists, BlockRecord, BlockState, ConnType};
use crate::config::Config;
use crate::grid::Grid;
use std::sync::{Arc, Mutex};

/// A hardware-reported compute-node failure, scoped to one midplane
/// (spec.md §4.8 "Inputs"): a midplane coordinate plus an I/O-node/
/// compute-node range.
pub struct ComputeNodeFailure {
    pub mp_coord: Vec<u32>,
    pub cnode_start: usize,
    pub cnode_len: usize,
}

/// `fail_cnode` (SPEC_FULL.md §C.2): a step-level compute-node failure fed
/// directly against a specific block rather than discovered from a
/// midplane-wide hardware event.
pub struct BlockComputeNodeFailure<'a> {
    pub block: &'a BlockHandle,
    pub cnode_indices: &'a [usize],
}

/// Blocks whose error ratio just crossed `max_block_err` and must be
/// requeued and marked `ERROR` (spec.md §4.8 step 3).
pub type NewlyErrored = Vec<BlockHandle>;

/// Rolls a midplane-scoped compute-node failure up to every block
/// referencing that midplane (spec.md §4.8 steps 1-3).
pub fn report_compute_node_failure(
    grid: &mut Grid,
    lists: &BlockLists,
    config: &Config,
    failure: &ComputeNodeFailure,
) -> NewlyErrored {
    let mp_idx = grid.index_of(&failure.mp_coord);
    if let Some(bm) = grid.midplanes[mp_idx].cnode_err_bitmap.as_mut() {
        bm.set_range(failure.cnode_start, failure.cnode_len, true);
    }

    let mut newly_errored = Vec::new();
    for handle in lists.main.iter() {
        let mut g = handle.lock().unwrap();
        if !g.mp_bitmap.get(mp_idx) {
            continue;
        }
        recompute_error_ratio(&mut g, grid);
        if !g.error && g.err_ratio as u32 >= config.max_block_err as u32 {
            g.set_error("compute-node error ratio reached the configured threshold");
            newly_errored.push(handle.clone());
        }
    }
    newly_errored
}

/// `fail_cnode` entry point (SPEC_FULL.md §C.2): feeds a step failure into
/// the same error-ratio accounting, scoped to one block's already-known
/// compute nodes rather than a whole midplane.
pub fn fail_cnode(grid: &mut Grid, config: &Config, failure: &BlockComputeNodeFailure) -> bool {
    let mut g = failure.block.lock().unwrap();
    for &mp_coord_idx in &midplane_indices(&g, grid) {
        if let Some(bm) = grid.midplanes[mp_coord_idx].cnode_err_bitmap.as_mut() {
            for &i in failure.cnode_indices {
                if i < bm.len() {
                    bm.set(i, true);
                }
            }
        }
    }
    recompute_error_ratio(&mut g, grid);
    if !g.error && g.err_ratio as u32 >= config.max_block_err as u32 {
        g.set_error("compute-node error ratio reached the configured threshold");
        true
    } else {
        false
    }
}

fn midplane_indices(record: &BlockRecord, grid: &Grid) -> Vec<usize> {
    (0..grid.midplanes.len())
        .filter(|&i| record.mp_bitmap.get(i))
        .collect()
}

/// Sums `popcount(cnode_err_bitmap(m) ∩ usable_bitmap(m,b))` over the
/// block's midplanes (spec.md §8 invariant 5) and updates `cnode_err_cnt`/
/// `err_ratio` (0-100) in place.
fn recompute_error_ratio(record: &mut BlockRecord, grid: &Grid) {
    let mut err_cnt = 0u32;
    for i in 0..grid.midplanes.len() {
        if !record.mp_bitmap.get(i) {
            continue;
        }
        let mp = &grid.midplanes[i];
        if let (Some(err), Some(usable)) = (&mp.cnode_err_bitmap, &mp.cnode_usable_bitmap) {
            err_cnt += err.popcount_intersection(usable);
        }
    }
    record.cnode_err_cnt = err_cnt;
    record.err_ratio = if record.cnode_cnt == 0 {
        0
    } else {
        ((err_cnt as u64 * 100) / record.cnode_cnt as u64).min(100) as u8
    };
}

/// Nodecard index -> compute-node range, using the configured
/// `midplane_node_cnt`/`nodecard_node_cnt` ratio (spec.md §4.5's "variant-
/// specific" table, reused here since a nodecard is the granularity fault
/// events arrive at).
pub fn nodecard_cnode_range(config: &Config, nodecard_idx: u32) -> (usize, usize) {
    let len = config.nodecard_node_cnt as usize;
    (nodecard_idx as usize * len, len)
}

/// Nodecard-down path (spec.md §4.8 step 4): marks the nodecard's compute
/// nodes failed and synthesizes a small `ERROR`-state block covering just
/// that nodecard, so the scheduler sees precisely the lost capacity instead
/// of draining the entire midplane.
pub fn down_nodecard(grid: &mut Grid, config: &Config, mp_coord: &[u32], nodecard_idx: u32) -> BlockHandle {
    let (start, len) = nodecard_cnode_range(config, nodecard_idx);
    let mp_idx = grid.index_of(mp_coord);
    if let Some(bm) = grid.midplanes[mp_idx].cnode_err_bitmap.as_mut() {
        bm.set_range(start, len, true);
    }

    let mut record = BlockRecord::new(
        format!(
            "NC{}-{}",
            crate::geometry::encode_coord(mp_coord).unwrap_or_default(),
            nodecard_idx
        ),
        vec![mp_coord.to_vec()],
        grid.midplanes.len(),
    );
    record.mp_bitmap.set(mp_idx, true);
    record.conn_type = vec![ConnType::Small; grid.dim_sizes.len()];
    record.cnode_cnt = len as u32;
    record.cpu_cnt = len as u32;
    record.cnode_err_cnt = len as u32;
    record.err_ratio = 100;
    record.state = BlockState::Term;
    record.set_error("nodecard down");
    Arc::new(Mutex::new(record))
}

/// Nodecard-up path (spec.md §4.8 step 5): clears the nodecard's failed
/// bits and, if the synthesized error block from [`down_nodecard`] now
/// covers only clear bits, returns it to `FREE`. Returns whether the block
/// was cleared.
pub fn up_nodecard(
    grid: &mut Grid,
    synthesized: &BlockHandle,
    config: &Config,
    mp_coord: &[u32],
    nodecard_idx: u32,
) -> bool {
    let (start, len) = nodecard_cnode_range(config, nodecard_idx);
    let mp_idx = grid.index_of(mp_coord);
    if let Some(bm) = grid.midplanes[mp_idx].cnode_err_bitmap.as_mut() {
        bm.set_range(start, len, false);
    }

    let mut g = synthesized.lock().unwrap();
    recompute_error_ratio(&mut g, grid);
    let cleared = g.cnode_err_cnt == 0;
    if cleared {
        g.clear_error();
        g.state = BlockState::Free;
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockLists;
    use crate::grid::Dimensionality;

    fn grid_4x4x4() -> Grid {
        Grid::new(vec![4, 4, 4], vec![true, true, true], Dimensionality::FourD, 512)
    }

    fn block_covering(grid: &Grid, coord: &[u32], cnode_cnt: u32) -> BlockHandle {
        let mut record = BlockRecord::new("b0", vec![coord.to_vec()], grid.midplanes.len());
        record.mp_bitmap.set(grid.index_of(coord), true);
        record.cnode_cnt = cnode_cnt;
        Arc::new(Mutex::new(record))
    }

    #[test]
    fn compute_node_failure_raises_block_err_ratio() {
        let mut grid = grid_4x4x4();
        let mut lists = BlockLists::new();
        let block = block_covering(&grid, &[0, 0, 0], 512);
        lists.add_block(block.clone());

        let failure = ComputeNodeFailure {
            mp_coord: vec![0, 0, 0],
            cnode_start: 0,
            cnode_len: 64,
        };
        let config = Config {
            max_block_err: 5,
            ..Config::default()
        };
        let errored = report_compute_node_failure(&mut grid, &lists, &config, &failure);
        assert_eq!(errored.len(), 1);
        assert!(block.lock().unwrap().is_error());
        assert_eq!(block.lock().unwrap().err_ratio, 12);
    }

    #[test]
    fn unaffected_blocks_are_left_alone() {
        let mut grid = grid_4x4x4();
        let mut lists = BlockLists::new();
        let block = block_covering(&grid, &[1, 1, 1], 512);
        lists.add_block(block.clone());

        let failure = ComputeNodeFailure {
            mp_coord: vec![0, 0, 0],
            cnode_start: 0,
            cnode_len: 512,
        };
        let config = Config::default();
        let errored = report_compute_node_failure(&mut grid, &lists, &config, &failure);
        assert!(errored.is_empty());
        assert!(!block.lock().unwrap().is_error());
    }

    #[test]
    fn down_then_up_nodecard_round_trips_to_free() {
        let mut grid = grid_4x4x4();
        let config = Config::default();
        let synthesized = down_nodecard(&mut grid, &config, &[0, 0, 0], 2);
        assert!(synthesized.lock().unwrap().is_error());
        assert_eq!(synthesized.lock().unwrap().err_ratio, 100);

        let cleared = up_nodecard(&mut grid, &synthesized, &config, &[0, 0, 0], 2);
        assert!(cleared);
        assert!(!synthesized.lock().unwrap().is_error());
        assert_eq!(synthesized.lock().unwrap().state, BlockState::Free);
    }
}
