//! Demo daemon for the torus block manager core.
//!
//! Loads a configuration file, stands up an in-process bridge double, and
//! drives the scheduler/agent/poll/listener thread split (spec.md §5)
//! against a handful of synthetic jobs so the whole submit -> boot ->
//! attach -> free lifecycle runs end to end. A real deployment replaces
//! the loopback bridge with the concrete hardware control library and
//! feeds `job_tx` from an actual scheduler instead of this file's demo
//! loop (spec.md §1: both are external collaborators).

mod threads;

use anyhow::{Context, Result};
use ba_core::block::BlockHandle;
use ba_core::bridge::LoopbackBridge;
use ba_core::config::Config;
use ba_core::grid::{Dimensionality, Grid};
use ba_core::placement::{JobRequest, SelectFlags, SelectJobInfo, SelectMode};
use ba_core::Core;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "blockmgrd", about = "Torus block manager daemon")]
struct Cli {
    /// Path to a `key = value` configuration file (spec.md §6
    /// "Configuration"). Falls back to built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the `block_state` snapshot (spec.md §6 "Snapshot
    /// file"). When given, a snapshot present at startup is reconciled
    /// before any job is accepted, and a fresh snapshot is written on exit.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Treat startup as post-failure recovery rather than a clean restart
    /// (spec.md §4.9 "Recovery"): synthesized replacements for missing
    /// static-layout blocks are permitted.
    #[arg(long)]
    recovery_mode: bool,

    /// Number of synthetic jobs the demo harness submits at startup.
    #[arg(long, default_value_t = 3)]
    demo_jobs: u32,

    /// How long to let the thread split run before shutting down, in
    /// seconds.
    #[arg(long, default_value_t = 2)]
    run_secs: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            Config::parse(&text).map_err(|e| anyhow::anyhow!("{} : {e}", path.display()))?
        }
        None => Config::default(),
    };

    let dimensionality = match config.dim_sizes.len() {
        3 => Dimensionality::ThreeD,
        4 => Dimensionality::FourD,
        n => anyhow::bail!("unsupported dimensionality: {n} dim sizes configured"),
    };
    let grid = Grid::new(
        config.dim_sizes.clone(),
        config.wraps.clone(),
        dimensionality,
        config.midplane_node_cnt,
    );

    let bridge = Arc::new(LoopbackBridge::new());
    let core = Arc::new(Core::new(config, grid, bridge));

    if let Some(dir) = &cli.state_dir {
        if dir.join("block_state").exists() {
            let snapshot = core
                .load_snapshot(dir)
                .with_context(|| format!("loading snapshot from {}", dir.display()))?;
            let outcome = core.recover(&snapshot, &HashSet::new(), cli.recovery_mode)?;
            log::info!(
                "recovery: {} restored, {} synthesized, {} dropped",
                outcome.restored.len(),
                outcome.synthesized.len(),
                outcome.dropped.len()
            );
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let (job_tx, job_rx) = std::sync::mpsc::channel::<JobRequest>();
    let (free_tx, free_rx) = std::sync::mpsc::channel::<BlockHandle>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<(BlockHandle, i64)>();

    let handles = threads::spawn(core.clone(), job_rx, free_rx, ready_tx, shutdown.clone())?;

    for job_id in 1..=i64::from(cli.demo_jobs) {
        job_tx
            .send(demo_job(job_id))
            .context("scheduler thread hung up before the demo jobs were submitted")?;
    }
    drop(job_tx);

    let deadline = std::time::Instant::now() + Duration::from_secs(cli.run_secs);
    while std::time::Instant::now() < deadline {
        match ready_rx.recv_timeout(Duration::from_millis(100)) {
            Ok((block, job_id)) => {
                log::info!("job {job_id}: demo workload complete, queuing for free");
                if free_tx.send(block).is_err() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    drop(free_tx);
    drop(ready_rx);

    handles.scheduler.join().ok();
    handles.agent.join().ok();
    handles.poll.join().ok();
    // The listener thread blocks on the bridge's event channel, which has
    // no shutdown signal of its own in this demo; detach it rather than
    // join so exit isn't held up waiting on an event that will never come.
    drop(handles.listener);

    if let Some(dir) = &cli.state_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        core.save_snapshot(dir)
            .with_context(|| format!("saving snapshot to {}", dir.display()))?;
        log::info!("snapshot written to {}", dir.display());
    }

    Ok(())
}

fn demo_job(job_id: i64) -> JobRequest {
    JobRequest {
        job_id,
        min_cpus: 0,
        max_cpus: u32::MAX,
        min_nodes: 1,
        max_nodes: 1,
        required_nodes: None,
        job_info: SelectJobInfo {
            geo: vec![1, 1, 1],
            rotate: false,
            reboot_required: false,
            conn_type: vec![
                ba_core::block::ConnType::Mesh,
                ba_core::block::ConnType::Mesh,
                ba_core::block::ConnType::Mesh,
            ],
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
