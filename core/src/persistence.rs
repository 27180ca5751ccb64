//! State persistence and recovery (spec.md §4.9, component C9).
//!
//! Writes a versioned snapshot of the block list and, on startup, cross-
//! checks it against the bridge's authoritative view of hardware,
//! reconciling stale or orphaned entries (spec.md §4.9, scenario S5).

use crate::block::{Action, BlockLists, BlockRecord, BlockState, ConnType};
use crate::bitmap::Bitmap;
use crate::bridge::{HwBlockInfo, HwBlockState};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::Path;

pub const SNAPSHOT_MAGIC: &str = "TORUS_BLOCK_STATE";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: String,
    pub version: u32,
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self {
            magic: SNAPSHOT_MAGIC.to_string(),
            version: SNAPSHOT_VERSION,
        }
    }
}

/// A job running on a block at snapshot time (spec.md §4.9): job-id,
/// user-id, sub-block bitmap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotJob {
    pub job_id: i64,
    pub user_id: u32,
    pub sub_block_bitmap: Option<String>,
}

/// The "extended record" fields (spec.md §4.9): one midplane's switch state
/// as emitted for this block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMidplane {
    pub coord: Vec<u32>,
    /// One run per dimension: bitmask value of that dimension's committed
    /// switch usage.
    pub axis_switch_usage: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBlock {
    pub block_id: String,
    pub mp_bitmap_len: usize,
    pub mp_bitmap_rle: String,
    pub conn_type: Vec<String>,
    pub ionode_str: String,
    pub ionode_bitmap_len: usize,
    pub ionode_bitmap_rle: String,
    pub images: Vec<(String, String)>,
    pub cnode_cnt: u32,
    pub cpu_cnt: u32,
    pub state: String,
    pub error: bool,
    pub reason: Option<String>,
    pub jobs: Vec<SnapshotJob>,
    pub geo: Vec<u32>,
    pub start: Vec<u32>,
    pub mp_list: Vec<Vec<u32>>,
    pub full_block: bool,
    pub switches: Vec<SnapshotMidplane>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub record_count: u32,
    pub blocks: Vec<SnapshotBlock>,
}

fn conn_type_to_str(c: ConnType) -> &'static str {
    match c {
        ConnType::Torus => "TORUS",
        ConnType::Mesh => "MESH",
        ConnType::Small => "SMALL",
        ConnType::Nav => "NAV",
    }
}

fn conn_type_from_str(s: &str) -> Result<ConnType> {
    match s {
        "TORUS" => Ok(ConnType::Torus),
        "MESH" => Ok(ConnType::Mesh),
        "SMALL" => Ok(ConnType::Small),
        "NAV" => Ok(ConnType::Nav),
        other => Err(CoreError::IncompatibleSnapshot(format!("unknown conn_type {other:?}"))),
    }
}

fn state_to_str(s: BlockState) -> &'static str {
    match s {
        BlockState::Free => "FREE",
        BlockState::Allocated => "ALLOCATED",
        BlockState::Busy => "BUSY",
        BlockState::Booting => "BOOTING",
        BlockState::Inited => "INITED",
        BlockState::Rebooting => "REBOOTING",
        BlockState::Term => "TERM",
        BlockState::Nav => "NAV",
    }
}

fn state_from_str(s: &str) -> Result<BlockState> {
    match s {
        "FREE" => Ok(BlockState::Free),
        "ALLOCATED" => Ok(BlockState::Allocated),
        "BUSY" => Ok(BlockState::Busy),
        "BOOTING" => Ok(BlockState::Booting),
        "INITED" => Ok(BlockState::Inited),
        "REBOOTING" => Ok(BlockState::Rebooting),
        "TERM" => Ok(BlockState::Term),
        "NAV" => Ok(BlockState::Nav),
        other => Err(CoreError::IncompatibleSnapshot(format!("unknown state {other:?}"))),
    }
}

fn image_kind_from_str(s: &str) -> Result<crate::config::ImageKind> {
    use crate::config::ImageKind;
    match s {
        "Blrts" => Ok(ImageKind::Blrts),
        "Linux" => Ok(ImageKind::Linux),
        "Ramdisk" => Ok(ImageKind::Ramdisk),
        "Mloader" => Ok(ImageKind::Mloader),
        other => Err(CoreError::IncompatibleSnapshot(format!("unknown image kind {other:?}"))),
    }
}

/// Builds a [`Snapshot`] from the current `main` list (spec.md §4.9:
/// `booted`/`job_running` membership is regenerated on restore, not
/// persisted directly — R1's documented exception).
pub fn to_snapshot(lists: &BlockLists) -> Snapshot {
    let blocks: Vec<SnapshotBlock> = lists
        .main
        .iter()
        .map(|handle| {
            let g = handle.lock().unwrap();
            SnapshotBlock {
                block_id: g.block_id.clone(),
                mp_bitmap_len: g.mp_bitmap.len(),
                mp_bitmap_rle: g.mp_bitmap.to_run_length(),
                conn_type: g.conn_type.iter().map(|c| conn_type_to_str(*c).to_string()).collect(),
                ionode_str: g.ionode_str.clone(),
                ionode_bitmap_len: g.ionode_bitmap.len(),
                ionode_bitmap_rle: g.ionode_bitmap.to_run_length(),
                images: g
                    .images
                    .iter()
                    .map(|(k, v)| (format!("{k:?}"), v.clone()))
                    .collect(),
                cnode_cnt: g.cnode_cnt,
                cpu_cnt: g.cpu_cnt,
                state: state_to_str(g.state).to_string(),
                error: g.error,
                reason: g.reason.clone(),
                jobs: if g.job_running > 0 {
                    vec![SnapshotJob {
                        job_id: g.job_running,
                        user_id: 0,
                        sub_block_bitmap: None,
                    }]
                } else {
                    Vec::new()
                },
                geo: g.geo.clone(),
                start: g.start.clone(),
                mp_list: g.mp_list.clone(),
                full_block: !g.is_small(),
                switches: Vec::new(),
            }
        })
        .collect();

    Snapshot {
        header: SnapshotHeader::default(),
        record_count: blocks.len() as u32,
        blocks,
    }
}

/// Rebuilds the candidate block list from a parsed [`Snapshot`] (does not
/// touch `booted`/`job_running`; the caller repopulates those via
/// [`crate::state_machine::sync_jobs`]).
pub fn from_snapshot(snapshot: &Snapshot) -> Result<Vec<BlockRecord>> {
    if snapshot.header.magic != SNAPSHOT_MAGIC || snapshot.header.version != SNAPSHOT_VERSION {
        return Err(CoreError::IncompatibleSnapshot(format!(
            "{}:{}",
            snapshot.header.magic, snapshot.header.version
        )));
    }

    snapshot
        .blocks
        .iter()
        .map(|sb| {
            let mut record = BlockRecord::new(sb.block_id.clone(), sb.mp_list.clone(), sb.mp_bitmap_len);
            record.mp_bitmap = Bitmap::from_run_length(sb.mp_bitmap_len, &sb.mp_bitmap_rle)
                .map_err(CoreError::IncompatibleSnapshot)?;
            record.ionode_bitmap = Bitmap::from_run_length(sb.ionode_bitmap_len, &sb.ionode_bitmap_rle)
                .map_err(CoreError::IncompatibleSnapshot)?;
            record.ionode_str = sb.ionode_str.clone();
            record.conn_type = sb
                .conn_type
                .iter()
                .map(|s| conn_type_from_str(s))
                .collect::<Result<Vec<_>>>()?;
            record.cnode_cnt = sb.cnode_cnt;
            record.cpu_cnt = sb.cpu_cnt;
            record.state = state_from_str(&sb.state)?;
            record.error = sb.error;
            record.reason = sb.reason.clone();
            record.geo = sb.geo.clone();
            record.start = sb.start.clone();
            record.action = Action::None;
            if let Some(job) = sb.jobs.first() {
                record.job_running = job.job_id;
            }
            for (kind, name) in &sb.images {
                record.images.insert(image_kind_from_str(kind)?, name.clone());
            }
            Ok(record)
        })
        .collect()
}

/// Writes the snapshot to `<dir>/block_state` via the canonical
/// `.new`/rename/`.old` rotation (spec.md §6 "Snapshot file"): write
/// `block_state.new`, fsync, unlink `.old`, link current→old, unlink
/// current, link new→current, unlink new.
pub fn save_atomic(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let current = dir.join("block_state");
    let new = dir.join("block_state.new");
    let old = dir.join("block_state.old");

    let json = serde_json::to_vec_pretty(snapshot)?;
    {
        let mut f = fs::File::create(&new)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }

    let _ = fs::remove_file(&old);
    if current.exists() {
        fs::hard_link(&current, &old)?;
        fs::remove_file(&current)?;
    }
    fs::hard_link(&new, &current)?;
    fs::remove_file(&new)?;
    Ok(())
}

/// Reads `<dir>/block_state`.
pub fn load(dir: &Path) -> Result<Snapshot> {
    let bytes = fs::read(dir.join("block_state"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Outcome of [`reconcile`] (spec.md §4.9 "Recovery").
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Snapshot blocks whose `block_id` was confirmed present in hardware,
    /// with hardware-reported state overlaid.
    pub restored: Vec<BlockRecord>,
    /// Snapshot-only blocks dropped because strict mode is active and
    /// hardware no longer has them.
    pub dropped: Vec<String>,
    /// Hardware blocks with no snapshot counterpart, synthesized fresh
    /// (e.g. created by another tool between controller runs).
    pub synthesized: Vec<BlockRecord>,
    /// Block ids present in neither the snapshot nor the static layout,
    /// scheduled for destruction.
    pub scheduled_for_destruction: Vec<String>,
}

fn synthesize_from_hardware(hw: &HwBlockInfo, grid_size: usize) -> BlockRecord {
    let mut record = BlockRecord::new(hw.block_id.clone(), hw.desc.mp_list.clone(), grid_size);
    record.conn_type = hw.desc.conn_type.clone();
    record.geo = hw.desc.geo.clone();
    record.start = hw.desc.start.clone();
    record.ionode_str = hw.desc.ionode_str.clone();
    record.state = match hw.state {
        HwBlockState::Free => BlockState::Free,
        HwBlockState::Booting => BlockState::Booting,
        HwBlockState::Inited => BlockState::Inited,
        HwBlockState::Rebooting => BlockState::Rebooting,
        HwBlockState::Term => BlockState::Term,
        HwBlockState::Error => {
            record.set_error("recovered in error state from hardware");
            BlockState::Term
        }
    };
    record
}

/// `spec.md §4.9 "Recovery"`, scenario S5: matches snapshot blocks against
/// the bridge's authoritative hardware list, synthesizes records for
/// hardware blocks the snapshot never knew about, and reconciles the
/// survivors against the configured static layout (if any).
pub fn reconcile(
    snapshot_blocks: Vec<BlockRecord>,
    hardware_blocks: &[HwBlockInfo],
    static_layout_ids: &HashSet<String>,
    recovery_mode: bool,
    grid_size: usize,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    let mut matched: HashSet<String> = HashSet::new();

    for mut snap in snapshot_blocks {
        match hardware_blocks.iter().find(|hw| hw.block_id == snap.block_id) {
            Some(hw) => {
                matched.insert(snap.block_id.clone());
                snap.state = match hw.state {
                    HwBlockState::Free => BlockState::Free,
                    HwBlockState::Booting => BlockState::Booting,
                    HwBlockState::Inited => BlockState::Inited,
                    HwBlockState::Rebooting => BlockState::Rebooting,
                    HwBlockState::Term => BlockState::Term,
                    HwBlockState::Error => snap.state,
                };
                outcome.restored.push(snap);
            }
            None if recovery_mode => outcome.restored.push(snap),
            None => outcome.dropped.push(snap.block_id.clone()),
        }
    }

    for hw in hardware_blocks {
        if !matched.contains(&hw.block_id) {
            outcome.synthesized.push(synthesize_from_hardware(hw, grid_size));
        }
    }

    if !static_layout_ids.is_empty() {
        let known: HashSet<String> = outcome
            .restored
            .iter()
            .chain(outcome.synthesized.iter())
            .map(|r| r.block_id.clone())
            .collect();
        for id in &known {
            if !static_layout_ids.contains(id) {
                outcome.scheduled_for_destruction.push(id.clone());
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockLists;
    use crate::bridge::BlockDesc;
    use std::sync::{Arc, Mutex};

    fn make_record(id: &str) -> BlockRecord {
        let mut r = BlockRecord::new(id, vec![vec![0, 0, 0]], 64);
        r.mp_bitmap.set(0, true);
        r.conn_type = vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh];
        r.geo = vec![1, 1, 1];
        r.cnode_cnt = 512;
        r
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut lists = BlockLists::new();
        lists.add_block(Arc::new(Mutex::new(make_record("b0"))));
        let snap = to_snapshot(&lists);
        let json = serde_json::to_vec(&snap).unwrap();
        let back: Snapshot = serde_json::from_slice(&json).unwrap();
        let records = from_snapshot(&back).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_id, "b0");
        assert_eq!(records[0].mp_bitmap.to_run_length(), "0,1,63");
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut snap = to_snapshot(&BlockLists::new());
        snap.header.magic = "WRONG".to_string();
        assert!(matches!(from_snapshot(&snap), Err(CoreError::IncompatibleSnapshot(_))));
    }

    #[test]
    fn save_atomic_then_load_round_trips() {
        let dir = unique_test_dir("save-atomic");
        fs::create_dir_all(&dir).unwrap();
        let mut lists = BlockLists::new();
        lists.add_block(Arc::new(Mutex::new(make_record("b0"))));
        let snap = to_snapshot(&lists);

        save_atomic(&dir, &snap).unwrap();
        let loaded = load(&dir).unwrap();
        assert_eq!(loaded.blocks.len(), 1);

        // A second save must rotate the previous file to `.old` rather than
        // erroring because `block_state` already exists.
        save_atomic(&dir, &snap).unwrap();
        assert!(dir.join("block_state.old").exists());
        assert!(!dir.join("block_state.new").exists());

        fs::remove_dir_all(&dir).ok();
    }

    fn unique_test_dir(label: &str) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("ba-core-test-{label}-{}-{n}", std::process::id()))
    }

    #[test]
    fn s5_reconcile_restores_synthesizes_and_drops() {
        let snapshot_blocks = vec![make_record("B1"), make_record("B2")];
        let hw = vec![
            HwBlockInfo {
                block_id: "B1".to_string(),
                state: HwBlockState::Inited,
                desc: BlockDesc {
                    mp_list: vec![vec![0, 0, 0]],
                    conn_type: vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh],
                    geo: vec![1, 1, 1],
                    start: vec![0, 0, 0],
                    ionode_str: String::new(),
                },
            },
            HwBlockInfo {
                block_id: "B3".to_string(),
                state: HwBlockState::Free,
                desc: BlockDesc {
                    mp_list: vec![vec![1, 0, 0]],
                    conn_type: vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh],
                    geo: vec![1, 1, 1],
                    start: vec![1, 0, 0],
                    ionode_str: String::new(),
                },
            },
        ];

        let outcome = reconcile(snapshot_blocks, &hw, &HashSet::new(), false, 64);
        assert_eq!(outcome.restored.len(), 1);
        assert_eq!(outcome.restored[0].block_id, "B1");
        assert_eq!(outcome.restored[0].state, BlockState::Inited);
        assert_eq!(outcome.dropped, vec!["B2".to_string()]);
        assert_eq!(outcome.synthesized.len(), 1);
        assert_eq!(outcome.synthesized[0].block_id, "B3");
    }
}
