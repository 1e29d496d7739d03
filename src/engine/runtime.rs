// src/engine/runtime.rs

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dag::rescue::write_rescue;
use crate::dag::RecoveryLog;
use crate::errors::Result;
use crate::exec::{spawn_script, SubmitBackend};
use crate::fs::FileSystem;
use crate::userlog::EventLogReader;

use super::core::CoreRuntime;
use super::{CoreCommand, RuntimeEvent, EXIT_ABORTED};

/// Where a rescue DAG is written and which DAG files it stands in for.
#[derive(Debug, Clone)]
pub struct RescueTarget {
    pub path: PathBuf,
    pub sources: Vec<PathBuf>,
}

/// Drives the DAG engine in response to `RuntimeEvent`s, and delegates
/// submissions to a `SubmitBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. This struct handles async IO: reading events from
/// channels and the event log, syncing recovery records, and dispatching
/// work.
pub struct Runtime<B: SubmitBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    event_tx: mpsc::Sender<RuntimeEvent>,
    backend: B,
    fs: Arc<dyn FileSystem>,
    recovery: RecoveryLog,
    reader: EventLogReader,
    rescue: RescueTarget,
    /// Events produced by the shell itself, handled before the channel.
    internal: VecDeque<RuntimeEvent>,
}

impl<B: SubmitBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("recovery", &self.recovery.path())
            .field("event_log", &self.reader.path())
            .finish_non_exhaustive()
    }
}

impl<B: SubmitBackend> Runtime<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        event_tx: mpsc::Sender<RuntimeEvent>,
        backend: B,
        fs: Arc<dyn FileSystem>,
        recovery: RecoveryLog,
        reader: EventLogReader,
        rescue: RescueTarget,
    ) -> Self {
        Self {
            core,
            event_rx,
            event_tx,
            backend,
            fs,
            recovery,
            reader,
            rescue,
            internal: VecDeque::new(),
        }
    }

    /// Main event loop. Returns the process exit code.
    ///
    /// - Consumes `RuntimeEvent`s from `event_rx`.
    /// - Turns `LogChanged` into parsed `LogEvents`.
    /// - Feeds events into the core runtime.
    /// - Executes commands returned by the core, in order.
    pub async fn run(mut self) -> Result<i32> {
        info!("DAG runtime started");

        let mut exit_code = EXIT_ABORTED;
        loop {
            let event = match self.internal.pop_front() {
                Some(e) => e,
                None => match self.event_rx.recv().await {
                    Some(e) => e,
                    None => {
                        info!("runtime event channel closed; exiting");
                        break;
                    }
                },
            };

            let event = match event {
                RuntimeEvent::LogChanged => match self.read_event_log() {
                    Some(e) => e,
                    None => continue,
                },
                other => other,
            };

            debug!(?event, "runtime received event");
            let step = self.core.step(event);

            for command in step.commands {
                if let Some(code) = self.execute_command(command).await? {
                    exit_code = code;
                }
            }

            if !step.keep_running {
                info!(exit_code, "core requested exit; stopping runtime");
                break;
            }
        }

        let summary = self.core.dag().summary();
        info!(
            total = summary.total,
            done = summary.done,
            failed = summary.failed,
            "runtime exiting"
        );
        Ok(exit_code)
    }

    fn read_event_log(&mut self) -> Option<RuntimeEvent> {
        match self.reader.read_new() {
            Ok(batch) => {
                for w in &batch.warnings {
                    warn!(path = ?self.reader.path(), "{w}");
                }
                if batch.events.is_empty() {
                    None
                } else {
                    Some(RuntimeEvent::LogEvents(batch.events))
                }
            }
            Err(e) => {
                // The next change notification or poll tick tries again.
                error!(error = %e, "failed to read event log");
                None
            }
        }
    }

    /// Execute a single command from the core. Returns the exit code for
    /// `Finish`.
    async fn execute_command(&mut self, command: CoreCommand) -> Result<Option<i32>> {
        match command {
            CoreCommand::AppendRecord(record) => {
                // Nothing after this may run unless the record is durable.
                self.recovery.append(&record)?;
            }
            CoreCommand::Submit(req) => {
                let node = req.node;
                debug!(node = %req.name, "dispatching submission");
                if let Err(e) = self.backend.submit_nodes(vec![req]).await {
                    self.internal.push_back(RuntimeEvent::SubmitFinished {
                        node,
                        result: Err(e.to_string()),
                    });
                }
            }
            CoreCommand::RunScript(req) => {
                spawn_script(req, self.event_tx.clone());
            }
            CoreCommand::WriteRescue => {
                if let Err(e) = write_rescue(
                    self.fs.as_ref(),
                    self.core.dag(),
                    &self.rescue.sources,
                    &self.rescue.path,
                ) {
                    error!(path = ?self.rescue.path, error = %e, "failed to write rescue DAG");
                }
            }
            CoreCommand::RemoveJobs(ids) => {
                if let Err(e) = self.backend.remove_jobs(ids).await {
                    error!(error = %e, "failed to remove in-flight jobs");
                }
            }
            CoreCommand::Finish { exit_code } => return Ok(Some(exit_code)),
        }
        Ok(None)
    }
}
