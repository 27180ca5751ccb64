//! Job placement policy (spec.md §4.6, component C6): `submit_job`.

use crate::allocator::{self, AllocRequest};
use crate::bitmap::Bitmap;
use crate::block::{Action, BlockHandle, BlockLists, BlockRecord, BlockState, ConnType, NO_JOB_RUNNING};
use crate::bridge::{BlockDesc, Bridge};
use crate::config::{Config, ImageKind};
use crate::error::{CoreError, Result};
use crate::geometry::rotations;
use crate::grid::Grid;
use bitflags::bitflags;
use std::collections::HashSet;
use std::sync::Arc;

/// Scheduling mode a request is evaluated under (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    RunNow,
    TestOnly,
    WillRun,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SelectFlags: u8 {
        const PREEMPT   = 0b001;
        const CHECK_FULL = 0b010;
        const IGN_ERR   = 0b100;
    }
}

/// Per-job immutable payload (spec.md §3 `select_jobinfo`).
#[derive(Debug, Clone)]
pub struct SelectJobInfo {
    pub geo: Vec<u32>,
    pub rotate: bool,
    pub reboot_required: bool,
    pub conn_type: Vec<ConnType>,
    pub images: Vec<(ImageKind, String)>,
    pub sub_block_cnode_cnt: Option<u32>,
    pub chosen_block: Option<BlockHandle>,
    pub cleaning: bool,
}

/// A job placement request (spec.md §4.6 "Input").
pub struct JobRequest {
    pub job_id: i64,
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub required_nodes: Option<Bitmap>,
    pub job_info: SelectJobInfo,
    pub groups: HashSet<String>,
    pub mode: SelectMode,
    pub flags: SelectFlags,
    pub exclusion_bitmap: Option<Bitmap>,
    pub earliest_begin: u64,
    /// Candidate jobs to virtually free, tried in order, when `flags`
    /// contains `PREEMPT` and no match exists otherwise.
    pub candidate_preemptees: Vec<i64>,
    pub elongate: bool,
}

/// Result of a successful placement.
pub struct PlacementResult {
    pub block: BlockHandle,
    pub start_time: u64,
    pub sub_region: Option<(Vec<u32>, Vec<u32>)>,
    /// Job ids that had to be virtually freed to make room, empty unless
    /// the preemption path (spec.md §4.6 step 4) was taken.
    pub preempted: Vec<i64>,
}

const START_TIME_EPSILON: u64 = 1;

/// Runs the full placement algorithm (spec.md §4.6 steps 1-5) against the
/// current block lists, synthesizing a new block via the allocator when
/// `layout_mode` allows it and no existing block matches.
pub fn submit_job(
    lists: &mut BlockLists,
    grid: &mut Grid,
    config: &Config,
    bridge: &dyn Bridge,
    req: &JobRequest,
    now: u64,
) -> Result<PlacementResult> {
    check_image_permissions(config, req)?;

    if let Some(found) = best_fit(lists, config, req, &[]) {
        return Ok(finish_placement(found, now, Vec::new()));
    }

    if matches!(config.layout_mode, crate::config::LayoutMode::Dynamic) {
        if let Ok(block) = synthesize(lists, grid, config, bridge, req) {
            let start_time = earliest_start(lists, &block, req, now);
            return Ok(PlacementResult {
                block,
                start_time,
                sub_region: None,
                preempted: Vec::new(),
            });
        }
    }

    if req.flags.contains(SelectFlags::PREEMPT) {
        for take in 1..=req.candidate_preemptees.len() {
            let preemptees = &req.candidate_preemptees[..take];
            if let Some(found) = best_fit(lists, config, req, preemptees) {
                return Ok(finish_placement(found, now, preemptees.to_vec()));
            }
        }
    }

    Err(CoreError::NoSpace)
}

fn check_image_permissions(config: &Config, req: &JobRequest) -> Result<()> {
    for (kind, name) in &req.job_info.images {
        if !config.images.check_permission(*kind, name, &req.groups) {
            return Err(CoreError::Permission(name.clone()));
        }
    }
    Ok(())
}

struct Candidate {
    block: BlockHandle,
    sub_region: Option<(Vec<u32>, Vec<u32>)>,
}

fn finish_placement(found: Candidate, now: u64, preempted: Vec<i64>) -> PlacementResult {
    PlacementResult {
        start_time: now,
        block: found.block,
        sub_region: found.sub_region,
        preempted,
    }
}

/// spec.md §4.6 step 2: iterate candidates sorted by availability then
/// size, applying every skip rule, returning the first that passes.
/// `ignore_job_ids` are treated as if their owning block were free — the
/// mechanism the preemption path (step 4) uses to "virtually free" a
/// candidate without mutating real state.
fn best_fit(lists: &BlockLists, config: &Config, req: &JobRequest, ignore_job_ids: &[i64]) -> Option<Candidate> {
    let mut candidates: Vec<BlockHandle> = lists.main.iter().cloned().collect();
    candidates.sort_by_key(|b| {
        let g = b.lock().unwrap();
        (availability_time(&g, ignore_job_ids), g.cnode_cnt)
    });

    for handle in candidates {
        let guard = handle.lock().unwrap();
        if !passes_filters(&guard, config, req, ignore_job_ids) {
            continue;
        }

        let sub_region = if let Some(cnode_count) = req.job_info.sub_block_cnode_cnt {
            match sub_block_region(&guard, cnode_count, req) {
                Some(r) => Some(r),
                None => continue,
            }
        } else {
            None
        };

        drop(guard);
        return Some(Candidate { block: handle, sub_region });
    }
    None
}

fn availability_time(block: &BlockRecord, ignore_job_ids: &[i64]) -> u64 {
    if block.job_running == NO_JOB_RUNNING || ignore_job_ids.contains(&block.job_running) {
        0
    } else {
        1
    }
}

fn passes_filters(block: &BlockRecord, config: &Config, req: &JobRequest, ignore_job_ids: &[i64]) -> bool {
    if block.is_destroying() || block.action == Action::Free || block.modifying {
        return false;
    }
    if block.error && !req.flags.contains(SelectFlags::IGN_ERR) {
        return false;
    }
    if block.err_ratio as u32 > config.max_block_err as u32 {
        return false;
    }

    let running_other_job = block.job_running != NO_JOB_RUNNING
        && block.job_running != req.job_id
        && !ignore_job_ids.contains(&block.job_running);
    if running_other_job && req.job_info.sub_block_cnode_cnt.is_none() {
        return false;
    }

    if req.job_info.sub_block_cnode_cnt.is_none() {
        if block.cpu_cnt < req.min_cpus || block.cpu_cnt > req.max_cpus {
            return false;
        }
    }

    if let Some(required) = &req.required_nodes {
        if !required.is_subset_of(&block.mp_bitmap) {
            return false;
        }
    }

    if req.job_info.sub_block_cnode_cnt.is_none() {
        if req.job_info.rotate {
            if !rotations(&req.job_info.geo).contains(&block.geo) {
                return false;
            }
        } else if block.geo != req.job_info.geo {
            return false;
        }
        if block.conn_type != req.job_info.conn_type {
            return false;
        }
    }

    true
}

/// Checks whether `cnode_count` compute nodes are free within `block`,
/// honoring the job's exclusion bitmap if present (spec.md §4.6: "If
/// exclusion-bitmap is non-empty, subtract excluded cores from
/// availability and re-test").
fn sub_block_region(block: &BlockRecord, cnode_count: u32, req: &JobRequest) -> Option<(Vec<u32>, Vec<u32>)> {
    let mut avail = block.mp_bitmap.clone();
    if let Some(exclusion) = &req.exclusion_bitmap {
        if !exclusion.is_all_clear() {
            avail.subtract(exclusion);
        }
    }
    let dims = guess_lattice_dims(avail.len());
    allocator::sub_block_in_bitmap(cnode_count, &dims, &avail)
}

/// Infers a 4-D lattice shape for a compute-node bitmap of the given
/// total size, assuming the common 4x4x4x4-style layout; a concrete
/// deployment's true lattice shape is owned by `Config`, not guessed —
/// this fallback only covers callers (tests, early bring-up) that have
/// not wired that through yet.
fn guess_lattice_dims(total: usize) -> Vec<u32> {
    let side = (total as f64).sqrt().sqrt().round() as u32;
    if (side as u64).pow(4) == total as u64 {
        vec![side, side, side, side]
    } else {
        vec![total as u32]
    }
}

/// spec.md §4.6 step 3: call the allocator against successively more
/// permissive midplane sets. A match is appended to `lists.main` whatever
/// the mode; `RUN_NOW` additionally materializes it on the bridge before the
/// block_id is fixed, since `TEST_ONLY`/`WILL_RUN` only ever speculate
/// (spec.md §4.6 step 3: "materialized (RUN_NOW) or appended as a
/// speculative entry (TEST_ONLY/WILL_RUN)").
fn synthesize(
    lists: &mut BlockLists,
    grid: &mut Grid,
    config: &Config,
    bridge: &dyn Bridge,
    req: &JobRequest,
) -> Result<BlockHandle> {
    let free_mask = free_midplane_mask(lists, grid, &[]);
    let alloc_req = AllocRequest {
        geo: &req.job_info.geo,
        conn_type: &req.job_info.conn_type,
        rotate: req.job_info.rotate,
        elongate: req.elongate,
        start_hint: None,
        deny_passthrough: &config.deny_passthrough,
    };

    let masks = [
        free_mask,
        free_midplane_mask(lists, grid, &running_job_ids(lists)),
    ];

    for mask in masks {
        if let Ok(result) = allocator::find_rectangle(grid, &mask, &alloc_req) {
            let block_id = if req.mode == SelectMode::RunNow {
                bridge.create(&BlockDesc {
                    mp_list: result.owned.clone(),
                    conn_type: req.job_info.conn_type.clone(),
                    geo: req.job_info.geo.clone(),
                    start: result.owned[0].clone(),
                    ionode_str: String::new(),
                })?
            } else {
                format!("RMP{}", req.job_id)
            };

            let mut record = BlockRecord::new(block_id, result.owned.clone(), grid.midplanes.len());
            for coord in &result.owned {
                record.mp_bitmap.set(grid.index_of(coord), true);
            }
            record.conn_type = req.job_info.conn_type.clone();
            record.geo = req.job_info.geo.clone();
            record.cnode_cnt = result.owned.len() as u32 * config.midplane_node_cnt;
            record.cpu_cnt = record.cnode_cnt;
            record.state = BlockState::Free;
            let handle: BlockHandle = Arc::new(std::sync::Mutex::new(record));
            lists.add_block(handle.clone());
            return Ok(handle);
        }
    }
    Err(CoreError::NoSpace)
}

fn free_midplane_mask(lists: &BlockLists, grid: &Grid, ignore_job_ids: &[i64]) -> Bitmap {
    let mut mask = Bitmap::new(grid.midplanes.len());
    mask.set_range(0, grid.midplanes.len(), true);
    for handle in lists.main.iter() {
        let g = handle.lock().unwrap();
        if g.job_running != NO_JOB_RUNNING && !ignore_job_ids.contains(&g.job_running) {
            mask.subtract(&g.mp_bitmap);
        } else if g.job_running == NO_JOB_RUNNING {
            mask.subtract(&g.mp_bitmap);
        }
    }
    for (idx, mp) in grid.midplanes.iter().enumerate() {
        if !mp.is_usable() {
            mask.set(idx, false);
        }
    }
    mask
}

fn running_job_ids(lists: &BlockLists) -> Vec<i64> {
    lists
        .main
        .iter()
        .filter_map(|b| {
            let g = b.lock().unwrap();
            (g.job_running != NO_JOB_RUNNING).then_some(g.job_running)
        })
        .collect()
}

/// spec.md §4.6 step 5: if the block (or an overlapping block) currently
/// holds a job, the new job cannot start before that job's end time plus
/// a safety epsilon, clamped to the job's earliest-begin-time.
fn earliest_start(lists: &BlockLists, block: &BlockHandle, req: &JobRequest, now: u64) -> u64 {
    let guard = block.lock().unwrap();
    let mut start = now.max(req.earliest_begin);
    for other in lists.main.iter() {
        if Arc::ptr_eq(other, block) {
            continue;
        }
        let og = other.lock().unwrap();
        if og.job_running != NO_JOB_RUNNING && crate::block::BlockList::overlaps(&guard, &og) {
            start = start.max(now + START_TIME_EPSILON);
        }
    }
    start
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockLists;
    use crate::bridge::LoopbackBridge;
    use crate::config::Config;
    use crate::grid::Dimensionality;
    use std::sync::Mutex;

    fn grid_4x4x4() -> Grid {
        Grid::new(vec![4, 4, 4], vec![true, true, true], Dimensionality::ThreeD, 512)
    }

    fn basic_job(job_id: i64) -> JobRequest {
        JobRequest {
            job_id,
            min_cpus: 0,
            max_cpus: u32::MAX,
            min_nodes: 1,
            max_nodes: 8,
            required_nodes: None,
            job_info: SelectJobInfo {
                geo: vec![1, 1, 1],
                rotate: false,
                reboot_required: false,
                conn_type: vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh],
                images: Vec::new(),
                sub_block_cnode_cnt: None,
                chosen_block: None,
                cleaning: false,
            },
            groups: HashSet::new(),
            mode: SelectMode::RunNow,
            flags: SelectFlags::empty(),
            exclusion_bitmap: None,
            earliest_begin: 0,
            candidate_preemptees: Vec::new(),
            elongate: false,
        }
    }

    #[test]
    fn rejects_restricted_image_for_unprivileged_group() {
        let mut lists = BlockLists::new();
        let mut grid = grid_4x4x4();
        let mut config = Config::default();
        config.images.mloader.push(crate::config::ImageEntry {
            name: "debug".to_string(),
            permitted_groups: ["admins".to_string()].into_iter().collect(),
        });
        let mut req = basic_job(1);
        req.job_info.images.push((ImageKind::Mloader, "debug".to_string()));
        req.groups.insert("users".to_string());

        let bridge = LoopbackBridge::new();
        let result = submit_job(&mut lists, &mut grid, &config, &bridge, &req, 0);
        assert!(matches!(result, Err(CoreError::Permission(_))));
    }

    #[test]
    fn finds_existing_free_matching_block() {
        let mut lists = BlockLists::new();
        let grid = grid_4x4x4();
        let mut record = BlockRecord::new("block0", vec![vec![0, 0, 0]], grid.midplanes.len());
        record.mp_bitmap.set(grid.index_of(&[0, 0, 0]), true);
        record.conn_type = vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh];
        record.geo = vec![1, 1, 1];
        record.cnode_cnt = 512;
        record.cpu_cnt = 512;
        lists.add_block(Arc::new(Mutex::new(record)));

        let mut grid = grid;
        let config = Config::default();
        let bridge = LoopbackBridge::new();
        let req = basic_job(7);
        let result = submit_job(&mut lists, &mut grid, &config, &bridge, &req, 100).unwrap();
        assert_eq!(result.block.lock().unwrap().block_id, "block0");
        assert_eq!(result.start_time, 100);
    }

    #[test]
    fn skips_blocks_in_error_unless_ignored() {
        let mut lists = BlockLists::new();
        let grid = grid_4x4x4();
        let mut record = BlockRecord::new("err-block", vec![vec![0, 0, 0]], grid.midplanes.len());
        record.mp_bitmap.set(grid.index_of(&[0, 0, 0]), true);
        record.conn_type = vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh];
        record.geo = vec![1, 1, 1];
        record.cnode_cnt = 512;
        record.cpu_cnt = 512;
        record.set_error("hardware fault");
        lists.add_block(Arc::new(Mutex::new(record)));

        let mut grid = grid;
        let config = Config::default();
        let bridge = LoopbackBridge::new();
        let req = basic_job(7);
        let result = submit_job(&mut lists, &mut grid, &config, &bridge, &req, 0);
        assert!(result.is_err());
    }

    #[test]
    fn synthesizes_a_block_when_none_matches_and_layout_is_dynamic() {
        let mut lists = BlockLists::new();
        let mut grid = grid_4x4x4();
        let config = Config::default();
        let bridge = LoopbackBridge::new();
        let req = basic_job(3);
        let result = submit_job(&mut lists, &mut grid, &config, &bridge, &req, 0).unwrap();
        assert_eq!(result.block.lock().unwrap().mp_bitmap.popcount(), 1);
        assert!(lists.main.contains_ptr(&result.block));
        assert!(bridge.get_blocks().unwrap().iter().any(|b| b.block_id == result.block.lock().unwrap().block_id));
    }
}
