// src/exec/backend.rs

//! Pluggable submission backend.
//!
//! The runtime talks to a `SubmitBackend` instead of spawning
//! `condor_submit` itself, so tests can swap in a fake that writes the
//! event log directly.
//!
//! Backends never block the runtime: `submit_nodes` starts the work and
//! returns; the outcome arrives later as `RuntimeEvent::SubmitFinished`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::DagmanSection;
use crate::dag::SubmitRequest;
use crate::engine::RuntimeEvent;
use crate::errors::Result;
use crate::exec::submit::{run_remove, run_submit};
use crate::types::CondorId;

/// Trait abstracting how node jobs are put into (and taken out of) the queue.
pub trait SubmitBackend: Send {
    /// Start the given submissions. Each one reports back with a
    /// `RuntimeEvent::SubmitFinished`.
    fn submit_nodes(
        &mut self,
        requests: Vec<SubmitRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Remove the given jobs from the queue (abnormal shutdown).
    fn remove_jobs(
        &mut self,
        ids: Vec<CondorId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production backend running `condor_submit` / `condor_rm`.
#[derive(Debug, Clone)]
pub struct CondorSubmitBackend {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    submit_command: String,
    remove_command: String,
    /// Node event log every submitted job is pointed at.
    event_log: PathBuf,
}

impl CondorSubmitBackend {
    pub fn new(
        runtime_tx: mpsc::Sender<RuntimeEvent>,
        cfg: &DagmanSection,
        event_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime_tx,
            submit_command: cfg.submit_command.clone(),
            remove_command: cfg.remove_command.clone(),
            event_log: event_log.into(),
        }
    }
}

impl SubmitBackend for CondorSubmitBackend {
    fn submit_nodes(
        &mut self,
        requests: Vec<SubmitRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.runtime_tx.clone();
        let command = self.submit_command.clone();
        let event_log = self.event_log.clone();

        Box::pin(async move {
            for req in requests {
                let tx = tx.clone();
                let command = command.clone();
                let event_log = event_log.clone();
                tokio::spawn(async move {
                    let node = req.node;
                    let result = run_submit(&command, &req, &event_log)
                        .await
                        .map_err(|e| format!("{e:#}"));
                    if let Err(e) = tx.send(RuntimeEvent::SubmitFinished { node, result }).await {
                        warn!(node = %req.name, error = %e, "runtime gone before submit result was delivered");
                    }
                });
            }
            Ok(())
        })
    }

    fn remove_jobs(
        &mut self,
        ids: Vec<CondorId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let command = self.remove_command.clone();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            info!(count = ids.len(), "removing in-flight node jobs");
            run_remove(&command, &ids).await?;
            Ok(())
        })
    }
}
