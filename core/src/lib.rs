//! Block data model, allocator, placement policy and lifecycle manager for
//! a partitioned torus (spec.md §1-§9).
//!
//! This crate is the plugin's brain; it has no binary entry point of its
//! own. `bin/blockmgrd` owns a [`Core`] value and drives it from the
//! scheduler/agent/poll/listener threads described in spec.md §5;
//! `bin/trigger` talks to the surrounding controller, not to this crate
//! directly.

pub mod allocator;
pub mod bitmap;
pub mod block;
pub mod bridge;
pub mod config;
pub mod error;
pub mod fault;
pub mod geometry;
pub mod grid;
pub mod persistence;
pub mod placement;
pub mod state_machine;
pub mod wiring;

use block::{BlockHandle, BlockLists, JobBlockMap};
use bridge::Bridge;
use config::Config;
use error::Result;
use fault::{BlockComputeNodeFailure, ComputeNodeFailure, NewlyErrored};
use grid::Grid;
use persistence::{ReconcileOutcome, Snapshot};
use placement::{JobRequest, PlacementResult};
use state_machine::{Clock, SyncOutcome};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The grid and the three block lists are always mutated together (spec.md
/// §5: "the grid is mutated only under the block-state lock"), so one
/// mutex covers both rather than risking the two being locked out of
/// order by different call sites.
struct BlockState {
    grid: Grid,
    lists: BlockLists,
    job_block_map: JobBlockMap,
}

/// The process-wide aggregate named in spec.md §9 Design Notes
/// ("Model them as an explicit `core` value passed to every operation");
/// replaces the source's global singletons with one owned value whose
/// lifetime matches process init/fini.
///
/// Lock order, matching spec.md §5 exactly (`job_read_lock` is external,
/// owned by the enclosing controller, and is never acquired here):
/// `block_state_mutex` → `create_dynamic_mutex` → `bridge_api_mutex`.
/// No method below acquires them out of order.
pub struct Core {
    config: Config,
    bridge: Arc<dyn Bridge>,
    state: Mutex<BlockState>,
    /// Serializes allocator synthesis attempts (spec.md §4.6 step 3).
    create_dynamic_mutex: Mutex<()>,
    /// Serializes calls into the bridge (spec.md §5's `bridge_api_mutex`);
    /// the trait object is already `Send + Sync`, but a single in-flight
    /// call per `Core` matches the documented lock order rather than
    /// relying on the concrete bridge implementation to serialize itself.
    bridge_api_mutex: Mutex<()>,
}

impl Core {
    pub fn new(config: Config, grid: Grid, bridge: Arc<dyn Bridge>) -> Self {
        Self {
            config,
            bridge,
            state: Mutex::new(BlockState {
                grid,
                lists: BlockLists::new(),
                job_block_map: JobBlockMap::new(),
            }),
            create_dynamic_mutex: Mutex::new(()),
            bridge_api_mutex: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    /// Adds a block produced outside placement (e.g. from `block_init` or
    /// reconciliation) directly to `main`.
    pub fn add_block(&self, block: BlockHandle) {
        self.state.lock().unwrap().lists.add_block(block);
    }

    pub fn remember_job_block(&self, job_id: i64, block: BlockHandle) {
        self.state.lock().unwrap().job_block_map.insert(job_id, block);
    }

    /// spec.md §4.6: acquires `block_state_mutex` for the duration of the
    /// match-or-synthesize algorithm, `create_dynamic_mutex` around the
    /// synthesis step it may take, and `bridge_api_mutex` in case synthesis
    /// materializes the result on the bridge, matching the documented order.
    pub fn submit_job(&self, req: &JobRequest, now: u64) -> Result<PlacementResult> {
        let mut state = self.state.lock().unwrap();
        let _dynamic_guard = self.create_dynamic_mutex.lock().unwrap();
        let _bridge_guard = self.bridge_api_mutex.lock().unwrap();
        placement::submit_job(
            &mut state.lists,
            &mut state.grid,
            &self.config,
            self.bridge.as_ref(),
            req,
            now,
        )
    }

    /// spec.md §4.7: drives a block from `FREE` to `INITED` via the bridge,
    /// under `bridge_api_mutex`.
    pub fn boot_block(&self, block: &BlockHandle) -> Result<()> {
        let _guard = self.bridge_api_mutex.lock().unwrap();
        state_machine::boot_block(self.bridge.as_ref(), block)
    }

    pub fn attach_job(&self, block: &BlockHandle, job_id: i64) {
        let mut state = self.state.lock().unwrap();
        state_machine::attach_job(&mut state.lists, block, job_id);
        state.job_block_map.insert(job_id, block.clone());
    }

    /// spec.md §4.7 `bg_free_block`. Returns whether this call was the
    /// last concurrent freer; callers run [`Core::reclaim`] only when true.
    pub fn bg_free_block(&self, block: &BlockHandle, clock: &dyn Clock) -> bool {
        let _guard = self.bridge_api_mutex.lock().unwrap();
        state_machine::bg_free_block(self.bridge.as_ref(), block, clock)
    }

    pub fn reclaim(&self, block: &BlockHandle) {
        let mut state = self.state.lock().unwrap();
        let layout_mode = self.config.layout_mode;
        state_machine::reclaim(&mut state.lists, block, layout_mode);
    }

    /// spec.md §4.7 `track_freeing_blocks`: frees every entry, reclaiming
    /// each as soon as it becomes the last concurrent freer.
    pub fn track_freeing_blocks(&self, blocks: &[BlockHandle], clock: &dyn Clock) {
        for block in blocks {
            if self.bg_free_block(block, clock) {
                self.reclaim(block);
            }
        }
    }

    /// spec.md §4.7 `sync_jobs`: run exactly once at controller restart.
    pub fn sync_jobs(&self, running_job_ids: &[i64]) -> SyncOutcome {
        let mut state = self.state.lock().unwrap();
        let job_block_map = state.job_block_map.clone();
        state_machine::sync_jobs(&mut state.lists, &job_block_map, running_job_ids)
    }

    /// spec.md §4.8: rolls a midplane-scoped hardware fault up to every
    /// affected block's error ratio.
    pub fn report_compute_node_failure(&self, failure: &ComputeNodeFailure) -> NewlyErrored {
        let mut state = self.state.lock().unwrap();
        let BlockState { grid, lists, .. } = &mut *state;
        fault::report_compute_node_failure(grid, lists, &self.config, failure)
    }

    /// `fail_cnode` (SPEC_FULL.md §C.2): the step-level entry point.
    pub fn fail_cnode(&self, failure: &BlockComputeNodeFailure) -> bool {
        let mut state = self.state.lock().unwrap();
        fault::fail_cnode(&mut state.grid, &self.config, failure)
    }

    pub fn down_nodecard(&self, mp_coord: &[u32], nodecard_idx: u32) -> BlockHandle {
        let mut state = self.state.lock().unwrap();
        let handle = fault::down_nodecard(&mut state.grid, &self.config, mp_coord, nodecard_idx);
        state.lists.add_block(handle.clone());
        handle
    }

    pub fn up_nodecard(&self, synthesized: &BlockHandle, mp_coord: &[u32], nodecard_idx: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        fault::up_nodecard(&mut state.grid, synthesized, &self.config, mp_coord, nodecard_idx)
    }

    /// spec.md §4.9 / §6 "Snapshot file": writes `<dir>/block_state` via
    /// the canonical atomic rotation.
    pub fn save_snapshot(&self, dir: &Path) -> Result<()> {
        let state = self.state.lock().unwrap();
        let snapshot = persistence::to_snapshot(&state.lists);
        persistence::save_atomic(dir, &snapshot)
    }

    pub fn load_snapshot(&self, dir: &Path) -> Result<Snapshot> {
        persistence::load(dir)
    }

    /// spec.md §4.9 "Recovery": cross-checks a loaded snapshot against the
    /// bridge's hardware list and the static layout, then installs the
    /// reconciled blocks into `main`. Must run before any placement call.
    pub fn recover(
        &self,
        snapshot: &Snapshot,
        static_layout_ids: &HashSet<String>,
        recovery_mode: bool,
    ) -> Result<ReconcileOutcome> {
        let snapshot_blocks = persistence::from_snapshot(snapshot)?;
        let hardware_blocks = {
            let _guard = self.bridge_api_mutex.lock().unwrap();
            self.bridge.get_blocks()?
        };

        let mut state = self.state.lock().unwrap();
        let grid_size = state.grid.midplanes.len();
        let outcome = persistence::reconcile(
            snapshot_blocks,
            &hardware_blocks,
            static_layout_ids,
            recovery_mode,
            grid_size,
        );
        for record in outcome.restored.iter().chain(outcome.synthesized.iter()) {
            state
                .lists
                .add_block(Arc::new(std::sync::Mutex::new(record.clone())));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::{BlockRecord, ConnType};
    use bridge::{BlockDesc, LoopbackBridge};
    use grid::Dimensionality;
    use placement::{SelectFlags, SelectJobInfo, SelectMode};

    fn test_core() -> Core {
        let grid = Grid::new(vec![4, 4, 4], vec![true, true, true], Dimensionality::ThreeD, 512);
        Core::new(Config::default(), grid, Arc::new(LoopbackBridge::new()))
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
    fn submit_boot_attach_free_round_trips_through_core() {
        let core = test_core();
        let placed = core.submit_job(&basic_job(1), 0).unwrap();
        core.boot_block(&placed.block).unwrap();
        core.attach_job(&placed.block, 1);
        assert_eq!(placed.block.lock().unwrap().job_running, 1);

        let was_last = core.bg_free_block(&placed.block, &state_machine::NoopClock);
        assert!(was_last);
        core.reclaim(&placed.block);
    }

    #[test]
    fn save_and_reconcile_restores_a_hardware_matched_block() {
        let core = test_core();
        let block_id = core
            .bridge
            .create(&BlockDesc {
                mp_list: vec![vec![0, 0, 0]],
                conn_type: vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh],
                geo: vec![1, 1, 1],
                start: vec![0, 0, 0],
                ionode_str: String::new(),
            })
            .unwrap();

        let mut record = BlockRecord::new(block_id.clone(), vec![vec![0, 0, 0]], 64);
        record.mp_bitmap.set(0, true);
        record.conn_type = vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh];
        record.cnode_cnt = 512;
        core.add_block(Arc::new(std::sync::Mutex::new(record)));

        let dir = unique_lib_test_dir();
        std::fs::create_dir_all(&dir).unwrap();
        core.save_snapshot(&dir).unwrap();
        let snap = core.load_snapshot(&dir).unwrap();

        let outcome = core.recover(&snap, &HashSet::new(), false).unwrap();
        assert_eq!(outcome.restored.len(), 1);
        assert_eq!(outcome.restored[0].block_id, block_id);
        assert!(outcome.synthesized.is_empty());
        assert!(outcome.dropped.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    fn unique_lib_test_dir() -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("ba-core-lib-test-{}-{n}", std::process::id()))
    }
}
