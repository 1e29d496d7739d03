// src/grid/runtime.rs

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::userlog::UserLogWriter;

use super::backend::{RemoteBackend, RemoteOp, RpcReply};
use super::core::GridCore;
use super::queue::JobQueue;
use super::{FlushBatch, GridCommand, GridEvent, RpcRequest, EXIT_SHUTDOWN};

/// Interval of the `Tick` event that drives timers in the core.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Async shell around [`GridCore`].
///
/// Feeds the core with ticks and with events from RPC tasks, callback
/// listeners and signal handlers, and executes the commands it returns:
/// RPCs and pings run in spawned tasks, queue queries and flushes run
/// inline so that at most one queue transaction is ever in progress.
pub struct GridRuntime<Q: JobQueue, B: RemoteBackend + 'static> {
    core: GridCore,
    event_rx: mpsc::Receiver<GridEvent>,
    event_tx: mpsc::Sender<GridEvent>,
    queue: Q,
    backend: Arc<B>,
    fs: Arc<dyn FileSystem>,
    /// Events produced by the shell itself, handled before the channel.
    internal: VecDeque<GridEvent>,
}

impl<Q: JobQueue, B: RemoteBackend + 'static> fmt::Debug for GridRuntime<Q, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridRuntime")
            .field("core", &self.core)
            .field("internal", &self.internal.len())
            .finish_non_exhaustive()
    }
}

impl<Q: JobQueue, B: RemoteBackend + 'static> GridRuntime<Q, B> {
    pub fn new(
        core: GridCore,
        event_rx: mpsc::Receiver<GridEvent>,
        event_tx: mpsc::Sender<GridEvent>,
        queue: Q,
        backend: Arc<B>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            core,
            event_rx,
            event_tx,
            queue,
            backend,
            fs,
            internal: VecDeque::new(),
        }
    }

    /// Sender for callback listeners and signal handlers.
    pub fn sender(&self) -> mpsc::Sender<GridEvent> {
        self.event_tx.clone()
    }

    pub fn core(&self) -> &GridCore {
        &self.core
    }

    /// Main event loop. Returns the process exit code.
    pub async fn run(mut self) -> Result<i32> {
        info!("gridmanager runtime started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.internal.push_back(GridEvent::Start);
        let mut exit_code = EXIT_SHUTDOWN;

        loop {
            let event = match self.internal.pop_front() {
                Some(e) => e,
                None => tokio::select! {
                    received = self.event_rx.recv() => match received {
                        Some(e) => e,
                        None => {
                            info!("grid event channel closed; exiting");
                            break;
                        }
                    },
                    _ = ticker.tick() => GridEvent::Tick,
                },
            };

            if !matches!(event, GridEvent::Tick) {
                debug!(?event, "grid runtime received event");
            }
            let step = self.core.step(event, Utc::now().timestamp());

            for command in step.commands {
                if let Some(code) = self.execute_command(command).await {
                    exit_code = code;
                }
            }

            if !step.keep_running {
                info!(exit_code, "grid core requested exit");
                break;
            }
        }

        info!(
            jobs = self.core.dispatcher().job_count(),
            "gridmanager runtime exiting"
        );
        Ok(exit_code)
    }

    async fn execute_command(&mut self, command: GridCommand) -> Option<i32> {
        match command {
            GridCommand::Rpc(req) => self.spawn_rpc(req),
            GridCommand::Ping { key } => {
                let backend = Arc::clone(&self.backend);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let reply = backend.call(key.kind, &key.endpoint, RemoteOp::Ping).await;
                    let up = !matches!(reply, RpcReply::Unreachable(_));
                    let _ = tx.send(GridEvent::PingResult { key, up }).await;
                });
            }
            GridCommand::QueryQueue { first_contact } => {
                let event = match self.queue.query(first_contact).await {
                    Ok(snapshot) => GridEvent::QueueSnapshot(snapshot),
                    Err(e) => GridEvent::QueueQueryFailed(e.to_string()),
                };
                self.internal.push_back(event);
            }
            GridCommand::Flush(batch) => {
                let event = match self.flush(batch).await {
                    Ok(()) => GridEvent::QueueCommitted,
                    Err(e) => GridEvent::QueueCommitFailed(e.to_string()),
                };
                self.internal.push_back(event);
            }
            GridCommand::RestartHelpers(kinds) => {
                for kind in kinds {
                    if let Err(e) = self.backend.restart_helper(kind).await {
                        error!(backend = %kind, error = %e, "failed to restart helper");
                    }
                }
            }
            GridCommand::Shutdown { exit_code } => return Some(exit_code),
        }
        None
    }

    fn spawn_rpc(&self, req: RpcRequest) {
        let backend = Arc::clone(&self.backend);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let RpcRequest {
                proc,
                seq,
                kind,
                endpoint,
                op,
            } = req;
            let name = op.name();
            let reply = backend.call(kind, &endpoint, op).await;
            debug!(job = %proc, seq, op = name, ?reply, "rpc finished");
            let _ = tx.send(GridEvent::RpcReply { proc, seq, reply }).await;
        });
    }

    /// Event-log records first, then the queue transaction. A failure in
    /// either leaves the whole batch to be retried.
    async fn flush(&mut self, batch: FlushBatch) -> Result<()> {
        for (path, event) in &batch.events {
            UserLogWriter::new(Arc::clone(&self.fs), path.clone())
                .write(event)
                .inspect_err(|e| warn!(path = ?path, error = %e, "failed to write job event"))?;
        }
        self.queue.commit(batch.updates).await
    }
}
