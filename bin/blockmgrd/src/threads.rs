//! Scheduler/agent/poll/listener thread split (spec.md §5).
//!
//! The real plugin drives these roles as callbacks invoked by a live job
//! scheduler and a live hardware control library; this daemon stands in
//! with plain channels so the four roles stay separated exactly the way
//! spec.md describes, without pretending to embed a real controller.

use anyhow::Result;
use ba_core::block::BlockHandle;
use ba_core::bridge::{BlockEvent, EventListener};
use ba_core::fault::ComputeNodeFailure;
use ba_core::placement::JobRequest;
use ba_core::state_machine::RealClock;
use ba_core::Core;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Forwards bridge events onto a channel, so the listener thread folds them
/// into core state on its own schedule rather than running caller code
/// underneath whatever lock the bridge holds while notifying (spec.md §5:
/// the event-listener thread owns that handoff).
struct ChannelListener {
    tx: Sender<BlockEvent>,
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: BlockEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct DaemonHandles {
    pub scheduler: JoinHandle<()>,
    pub agent: JoinHandle<()>,
    pub poll: JoinHandle<()>,
    pub listener: JoinHandle<()>,
}

/// Spawns the four threads named in spec.md §5 and wires them together:
/// the scheduler places jobs and hands the resulting block to the agent to
/// boot and attach; completed jobs hand their block to the poll thread,
/// which owns the bounded free/retry loop; hardware events flow to the
/// listener, which folds them into the fault-tracking state. `ready_tx`
/// lets the caller observe each job reaching `BUSY`, so a demo harness can
/// decide when to queue the matching free.
pub fn spawn(
    core: Arc<Core>,
    job_rx: Receiver<JobRequest>,
    free_rx: Receiver<BlockHandle>,
    ready_tx: Sender<(BlockHandle, i64)>,
    shutdown: Arc<AtomicBool>,
) -> Result<DaemonHandles> {
    let (boot_tx, boot_rx) = std::sync::mpsc::channel::<(BlockHandle, i64)>();

    let scheduler = {
        let core = core.clone();
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || scheduler_loop(&core, job_rx, boot_tx, &shutdown))?
    };

    let agent = {
        let core = core.clone();
        std::thread::Builder::new()
            .name("agent".into())
            .spawn(move || agent_loop(&core, boot_rx, ready_tx))?
    };

    let poll = {
        let core = core.clone();
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("poll".into())
            .spawn(move || poll_loop(&core, free_rx, &shutdown))?
    };

    let (event_tx, event_rx) = std::sync::mpsc::channel();
    core.bridge().subscribe(Arc::new(ChannelListener { tx: event_tx }))?;
    let listener = {
        let core = core.clone();
        std::thread::Builder::new()
            .name("listener".into())
            .spawn(move || listener_loop(&core, event_rx))?
    };

    Ok(DaemonHandles {
        scheduler,
        agent,
        poll,
        listener,
    })
}

fn scheduler_loop(
    core: &Core,
    job_rx: Receiver<JobRequest>,
    boot_tx: Sender<(BlockHandle, i64)>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let job = match job_rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let job_id = job.job_id;
        match core.submit_job(&job, now_secs()) {
            Ok(placed) => {
                let block_id = placed.block.lock().unwrap().block_id.clone();
                log::info!("job {job_id}: placed on block {block_id}");
                if boot_tx.send((placed.block, job_id)).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("job {job_id}: no placement ({e})"),
        }
    }
    log::info!("scheduler thread exiting");
}

fn agent_loop(core: &Core, boot_rx: Receiver<(BlockHandle, i64)>, ready_tx: Sender<(BlockHandle, i64)>) {
    for (block, job_id) in boot_rx {
        let block_id = block.lock().unwrap().block_id.clone();
        match core.boot_block(&block) {
            Ok(()) => {
                core.attach_job(&block, job_id);
                log::info!("job {job_id}: block {block_id} booted and attached");
                let _ = ready_tx.send((block, job_id));
            }
            Err(e) => log::error!("job {job_id}: boot of block {block_id} failed: {e}"),
        }
    }
    log::info!("agent thread exiting");
}

fn poll_loop(core: &Core, free_rx: Receiver<BlockHandle>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        let block = match free_rx.recv_timeout(POLL_INTERVAL) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let block_id = block.lock().unwrap().block_id.clone();
        core.track_freeing_blocks(&[block], &RealClock);
        log::info!("block {block_id}: free cycle complete");
    }
    log::info!("poll thread exiting");
}

fn listener_loop(core: &Core, rx: Receiver<BlockEvent>) {
    for event in rx {
        match event {
            BlockEvent::StateChanged { block_id, state } => {
                log::info!("hardware event: block {block_id} is now {state:?}");
            }
            BlockEvent::NodecardDown { mp_coord, nodecard } => {
                log::warn!("hardware event: nodecard {nodecard} down on midplane {mp_coord:?}");
                core.down_nodecard(&mp_coord, nodecard);
            }
            // Bringing the synthesized error block back to FREE needs the
            // handle down_nodecard returned; this demo listener doesn't keep
            // a nodecard->handle map, so it only logs the event here.
            BlockEvent::NodecardUp { mp_coord, nodecard } => {
                log::info!("hardware event: nodecard {nodecard} up on midplane {mp_coord:?}");
            }
            BlockEvent::ComputeNodeFailed {
                mp_coord,
                cnode_start,
                cnode_len,
            } => {
                log::warn!(
                    "hardware event: {cnode_len} compute node(s) failed at offset {cnode_start} on midplane {mp_coord:?}"
                );
                core.report_compute_node_failure(&ComputeNodeFailure {
                    mp_coord,
                    cnode_start,
                    cnode_len,
                });
            }
        }
    }
    log::info!("listener thread exiting");
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
