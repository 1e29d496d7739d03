// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod dagman;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod grid;
pub mod logging;
pub mod submit_dag;
pub mod types;
pub mod userlog;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::{DagmanArgs, GridmanagerArgs, SubmitDagArgs};
use crate::config::load_effective;
use crate::engine::{CoreRuntime, Runtime, RuntimeEvent};
use crate::exec::CondorSubmitBackend;
use crate::fs::{FileSystem, RealFileSystem};
use crate::grid::{FileJobQueue, GridCore, GridEvent, GridManagerDispatcher, GridRuntime, HelperBackend};

/// Entry point of `condor_dagman`. Returns the process exit code.
///
/// This wires together:
/// - config loading and command-line overrides
/// - lock file, rescue DAG selection and recovery (see [`dagman::prepare`])
/// - the submit backend
/// - event-log watcher and poller
/// - Ctrl-C handling
pub async fn run_dagman(args: DagmanArgs) -> Result<i32> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let mut cfg = load_effective(fs.as_ref(), args.config.as_deref())?;
    dagman::apply_overrides(&mut cfg.dagman, &args);

    let run = dagman::prepare(Arc::clone(&fs), &args, &cfg.dagman)?;
    let lock = run.paths.lock.clone();

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(256);
    let backend = CondorSubmitBackend::new(rt_tx.clone(), &cfg.dagman, run.paths.event_log.clone());

    let _watcher = if cfg.dagman.watch_event_log {
        match watch::spawn_log_watcher(run.paths.event_log.clone(), rt_tx.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "event log watcher unavailable; polling only");
                None
            }
        }
    } else {
        None
    };
    let poller = watch::spawn_log_poller(
        Duration::from_millis(cfg.dagman.log_poll_interval_ms),
        rt_tx.clone(),
    );

    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    // After a crash the event log is read before anything new is submitted.
    if run.recovery_mode {
        rt_tx
            .send(RuntimeEvent::LogChanged)
            .await
            .context("queueing initial event-log read")?;
    }
    rt_tx
        .send(RuntimeEvent::Start)
        .await
        .context("queueing start event")?;

    let core = CoreRuntime::new(run.engine);
    let runtime = Runtime::new(
        core,
        rt_rx,
        rt_tx,
        backend,
        Arc::clone(&fs),
        run.recovery,
        run.reader,
        run.rescue,
    );
    let exit_code = runtime.run().await?;

    poller.abort();
    dagman::release_lock(fs.as_ref(), &lock);
    info!(exit_code, "condor_dagman finished");
    Ok(exit_code)
}

/// Entry point of `condor_submit_dag`. Returns the process exit code.
pub async fn run_submit_dag(args: SubmitDagArgs) -> Result<i32> {
    let fs = RealFileSystem;
    let cfg = load_effective(&fs, args.config.as_deref())?;

    let dagman = dagman_executable();
    let files = submit_dag::prepare(&fs, &args, &dagman)?;
    println!("File for submitting this DAG: {}", files.submit_file.display());
    println!("Log of DAGMan debugging messages: {}", files.debug_log.display());
    println!("Log of the life of condor_dagman itself: {}", files.dagman_log.display());

    if args.no_submit {
        println!("-no_submit given, not submitting DAG");
        return Ok(0);
    }

    let id = submit_dag::submit(&cfg.dagman.submit_command, &files.submit_file).await?;
    println!("1 job(s) submitted to cluster {}.", id.cluster);
    Ok(0)
}

/// `condor_dagman` next to the running binary, else whatever is on `PATH`.
fn dagman_executable() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("condor_dagman")))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from("condor_dagman"))
}

/// Entry point of `condor_gridmanager`. Returns the process exit code.
pub async fn run_gridmanager(args: GridmanagerArgs) -> Result<i32> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let cfg = load_effective(fs.as_ref(), args.config.as_deref())?;
    let grid_cfg = cfg.gridmanager;

    let queue = FileJobQueue::new(Arc::clone(&fs), args.queue.clone());
    let backend = Arc::new(HelperBackend::new(
        grid_cfg.helper_command.clone(),
        Duration::from_secs(grid_cfg.rpc_timeout_secs),
    ));

    let (tx, rx) = mpsc::channel::<GridEvent>(1024);
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(GridEvent::ShutdownRequested).await;
        });
    }

    info!(queue = ?args.queue, helper = %grid_cfg.helper_command, "gridmanager starting");
    let core = GridCore::new(GridManagerDispatcher::new(grid_cfg));
    let runtime = GridRuntime::new(core, rx, tx, queue, backend, fs);
    let exit_code = runtime.run().await?;
    info!(exit_code, "condor_gridmanager finished");
    Ok(exit_code)
}
