//! Block records and block lists (spec.md §3, §4.3, component C3).

use crate::bitmap::Bitmap;
use crate::config::ImageKind;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Per-dimension connection mode (spec.md GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Torus,
    Mesh,
    Small,
    /// Unspecified; the allocator may choose.
    Nav,
}

/// Base block state. `ERROR_FLAG` (spec.md §3) is tracked orthogonally on
/// [`BlockRecord::error`] rather than folded into this enum, since any
/// base state may carry it simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    /// Transitional state while a placement decision is being committed
    /// but hardware has not yet been asked to act (spec.md §3's
    /// "ALLOCATED" transitional naming; `Busy` covers both meanings since
    /// the original source uses them near-interchangeably for this
    /// window).
    Allocated,
    Busy,
    Booting,
    Inited,
    Rebooting,
    Term,
    /// Speculative candidate produced for `WILL_RUN`/`TEST_ONLY` scheduling
    /// that was never materialized on hardware.
    Nav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Boot,
    Free,
}

/// `job_running` sentinels (spec.md §3).
pub const NO_JOB_RUNNING: i64 = -1;
pub const BLOCK_ERROR_STATE: i64 = -2;

/// A rectangular or sub-rectangular allocation (spec.md §3 `bg_record`).
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub block_id: String,
    /// Ordered lexicographically by coord.
    pub mp_list: Vec<Vec<u32>>,
    pub mp_bitmap: Bitmap,
    pub ionode_bitmap: Bitmap,
    pub ionode_str: String,
    /// The image currently loaded for each image kind (spec.md §3: "image
    /// names"). Absence of a kind means the block has never been booted
    /// with one.
    pub images: HashMap<ImageKind, String>,
    pub conn_type: Vec<ConnType>,
    pub geo: Vec<u32>,
    pub start: Vec<u32>,
    pub cnode_cnt: u32,
    pub cpu_cnt: u32,
    pub cnode_err_cnt: u32,
    pub err_ratio: u8,
    pub state: BlockState,
    pub error: bool,
    pub action: Action,
    pub job_running: i64,
    pub job_list: Vec<i64>,
    pub free_cnt: u32,
    pub modifying: bool,
    pub reason: Option<String>,
    /// On a copy produced by [`BlockList::copy_list`], points back to the
    /// authoritative record. `None` on originals.
    pub original: Option<Weak<BlockRecordCell>>,
}

/// Interior-mutable cell wrapping a [`BlockRecord`], the unit stored in
/// block lists so that `main`/`booted`/`job_running` can share ownership
/// of the same record (spec.md §3 invariant: membership in `booted` or
/// `job_running` implies membership in `main`).
pub type BlockRecordCell = std::sync::Mutex<BlockRecord>;
pub type BlockHandle = Arc<BlockRecordCell>;

impl BlockRecord {
    pub fn new(block_id: impl Into<String>, mp_list: Vec<Vec<u32>>, grid_size: usize) -> Self {
        Self {
            block_id: block_id.into(),
            mp_bitmap: Bitmap::new(grid_size),
            mp_list,
            ionode_bitmap: Bitmap::new(0),
            ionode_str: String::new(),
            images: HashMap::new(),
            conn_type: Vec::new(),
            geo: Vec::new(),
            start: Vec::new(),
            cnode_cnt: 0,
            cpu_cnt: 0,
            cnode_err_cnt: 0,
            err_ratio: 0,
            state: BlockState::Free,
            error: false,
            action: Action::None,
            job_running: NO_JOB_RUNNING,
            job_list: Vec::new(),
            free_cnt: 0,
            modifying: false,
            reason: None,
            original: None,
        }
    }

    pub fn is_small(&self) -> bool {
        self.conn_type.iter().any(|c| *c == ConnType::Small)
    }

    pub fn is_destroying(&self) -> bool {
        matches!(self.state, BlockState::Term) && self.action == Action::Free
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn set_error(&mut self, reason: impl Into<String>) {
        self.error = true;
        self.reason = Some(reason.into());
    }

    pub fn clear_error(&mut self) {
        self.error = false;
        self.reason = None;
    }
}

/// A named list of block handles (spec.md §4.3): `main`, `booted`, or
/// `job_running`. Provides order-preserving and size-ascending insertion,
/// id lookup, pointer removal, overlap testing and copy-on-read.
#[derive(Debug, Default)]
pub struct BlockList {
    entries: Vec<BlockHandle>,
}

impl BlockList {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockHandle> {
        self.entries.iter()
    }

    /// Appends at the end, preserving caller-determined order.
    pub fn push_back(&mut self, block: BlockHandle) {
        self.entries.push(block);
    }

    /// Inserts keeping the list sorted ascending by `cnode_cnt`, the order
    /// the placement policy (spec.md §4.6) scans candidates in.
    pub fn insert_sorted_by_size(&mut self, block: BlockHandle) {
        let size = block.lock().unwrap().cnode_cnt;
        let pos = self
            .entries
            .iter()
            .position(|b| b.lock().unwrap().cnode_cnt > size)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, block);
    }

    pub fn find_by_id(&self, id: &str) -> Option<BlockHandle> {
        self.entries
            .iter()
            .find(|b| b.lock().unwrap().block_id == id)
            .cloned()
    }

    /// Removes the entry that is the same underlying allocation as
    /// `target` (pointer identity, via [`Arc::ptr_eq`]), not merely one
    /// with a matching id — callers holding a `copy_list` clone must not
    /// be able to remove the original by accident.
    pub fn remove_by_ptr(&mut self, target: &BlockHandle) -> Option<BlockHandle> {
        let pos = self.entries.iter().position(|b| Arc::ptr_eq(b, target))?;
        Some(self.entries.remove(pos))
    }

    pub fn contains_ptr(&self, target: &BlockHandle) -> bool {
        self.entries.iter().any(|b| Arc::ptr_eq(b, target))
    }

    /// Two blocks overlap iff their `mp_bitmap`s intersect and either one
    /// exceeds a full midplane, or their `ionode_bitmap`s also intersect
    /// (spec.md §4.3).
    pub fn overlaps(a: &BlockRecord, b: &BlockRecord) -> bool {
        if !a.mp_bitmap.intersects(&b.mp_bitmap) {
            return false;
        }
        let a_whole = !a.is_small();
        let b_whole = !b.is_small();
        if a_whole || b_whole {
            return true;
        }
        a.ionode_bitmap.intersects(&b.ionode_bitmap)
    }

    pub fn find_overlap(&self, candidate: &BlockRecord) -> Option<BlockHandle> {
        self.entries
            .iter()
            .find(|b| {
                let guard = b.lock().unwrap();
                Self::overlaps(&guard, candidate)
            })
            .cloned()
    }

    /// Clones every non-destroying block into a shallow-copy list whose
    /// elements carry `original` back-references to the source list's
    /// records. Freeing an entry in the copy must never free the original
    /// (spec.md §4.3); callers must route any state change on a copy's
    /// elements back through `original`.
    pub fn copy_list(&self) -> BlockList {
        let mut out = BlockList::new();
        for handle in &self.entries {
            let guard = handle.lock().unwrap();
            if guard.is_destroying() {
                continue;
            }
            let mut clone = guard.clone();
            clone.original = Some(Arc::downgrade(handle));
            out.entries.push(Arc::new(std::sync::Mutex::new(clone)));
        }
        out
    }
}

/// The three canonical lists (spec.md §3 "Lists"): `main` is authoritative;
/// every entry of `booted` and `job_running` is also in `main`, and a
/// block is removed from `main` last.
#[derive(Debug, Default)]
pub struct BlockLists {
    pub main: BlockList,
    pub booted: BlockList,
    pub job_running: BlockList,
}

impl BlockLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a newly created block to `main` only; `booted`/`job_running`
    /// membership is granted later as the state machine (C7) drives the
    /// block through its lifecycle.
    pub fn add_block(&mut self, block: BlockHandle) {
        self.main.push_back(block);
    }

    /// Removes a block from all three lists, `main` last, per the ordering
    /// invariant in spec.md §3.
    pub fn remove_block(&mut self, block: &BlockHandle) {
        self.booted.remove_by_ptr(block);
        self.job_running.remove_by_ptr(block);
        self.main.remove_by_ptr(block);
    }
}

/// A registry mapping opaque job ids to the block handle they're attached
/// to, used by the state machine's `sync_jobs` (spec.md §4.7) to reconnect
/// a controller-restart job list to blocks recovered at startup.
pub type JobBlockMap = HashMap<i64, BlockHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(id: &str, cnode_cnt: u32, grid_size: usize, mp_indices: &[usize]) -> BlockHandle {
        let mut rec = BlockRecord::new(id, vec![], grid_size);
        for &i in mp_indices {
            rec.mp_bitmap.set(i, true);
        }
        rec.cnode_cnt = cnode_cnt;
        Arc::new(std::sync::Mutex::new(rec))
    }

    #[test]
    fn insert_sorted_by_size_keeps_ascending_order() {
        let mut list = BlockList::new();
        list.insert_sorted_by_size(make_block("b", 512, 64, &[1]));
        list.insert_sorted_by_size(make_block("a", 128, 64, &[2]));
        list.insert_sorted_by_size(make_block("c", 1024, 64, &[3]));
        let sizes: Vec<u32> = list.iter().map(|b| b.lock().unwrap().cnode_cnt).collect();
        assert_eq!(sizes, vec![128, 512, 1024]);
    }

    #[test]
    fn whole_midplane_blocks_overlap_on_bitmap_intersection_alone() {
        let a = make_block("a", 512, 64, &[0, 1]);
        let b = make_block("b", 512, 64, &[1, 2]);
        assert!(BlockList::overlaps(&a.lock().unwrap(), &b.lock().unwrap()));
    }

    #[test]
    fn small_blocks_need_ionode_overlap_too() {
        let mut a = BlockRecord::new("a", vec![], 64);
        a.mp_bitmap.set(0, true);
        a.conn_type.push(ConnType::Small);
        a.ionode_bitmap = Bitmap::new(16);
        a.ionode_bitmap.set_range(0, 4, true);

        let mut b = BlockRecord::new("b", vec![], 64);
        b.mp_bitmap.set(0, true);
        b.conn_type.push(ConnType::Small);
        b.ionode_bitmap = Bitmap::new(16);
        b.ionode_bitmap.set_range(8, 4, true);

        assert!(!BlockList::overlaps(&a, &b));

        b.ionode_bitmap.set_range(2, 2, true);
        assert!(BlockList::overlaps(&a, &b));
    }

    #[test]
    fn copy_list_elements_carry_original_back_reference() {
        let mut main = BlockList::new();
        let block = make_block("a", 512, 64, &[0]);
        main.push_back(block.clone());
        let copy = main.copy_list();
        let copy_handle = copy.iter().next().unwrap();
        let original = copy_handle
            .lock()
            .unwrap()
            .original
            .clone()
            .unwrap()
            .upgrade()
            .unwrap();
        assert!(Arc::ptr_eq(&original, &block));

        // Removing from the copy must not touch `main`.
        let mut copy_owned = copy;
        copy_owned.remove_by_ptr(copy_handle);
        assert_eq!(main.len(), 1);
    }

    #[test]
    fn remove_block_clears_all_three_lists_main_last() {
        let mut lists = BlockLists::new();
        let block = make_block("a", 512, 64, &[0]);
        lists.add_block(block.clone());
        lists.booted.push_back(block.clone());
        lists.job_running.push_back(block.clone());
        lists.remove_block(&block);
        assert!(!lists.main.contains_ptr(&block));
        assert!(!lists.booted.contains_ptr(&block));
        assert!(!lists.job_running.contains_ptr(&block));
    }
}
