use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use gridflow::dag::SubmitRequest;
use gridflow::engine::RuntimeEvent;
use gridflow::errors::Result;
use gridflow::exec::SubmitBackend;
use gridflow::fs::FileSystem;
use gridflow::types::CondorId;
use gridflow::userlog::{LogEvent, LogEventKind, Termination, UserLogWriter};

/// How a fake node job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOutcome {
    /// Submit, execute and terminate with this return value.
    Exit(i32),
    /// The submission itself fails; nothing is logged.
    SubmitFails,
    /// Submitted and left running until removed.
    Hang,
}

/// Shared record of what a [`FakeSubmitter`] was asked to do.
#[derive(Debug, Default)]
pub struct FakeLedger {
    pub submitted: Vec<String>,
    pub removed: Vec<CondorId>,
}

/// A `SubmitBackend` that:
/// - assigns cluster ids from a counter
/// - writes submit/execute/terminate events for each job to the event log
/// - reports `SubmitFinished` and `LogChanged` back to the runtime.
///
/// Outcomes are scripted per node name and attempt; unscripted attempts
/// exit 0.
pub struct FakeSubmitter {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    writer: UserLogWriter,
    next_cluster: i64,
    outcomes: HashMap<String, VecDeque<FakeOutcome>>,
    ledger: Arc<Mutex<FakeLedger>>,
}

impl FakeSubmitter {
    pub fn new(
        runtime_tx: mpsc::Sender<RuntimeEvent>,
        fs: Arc<dyn FileSystem>,
        event_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime_tx,
            writer: UserLogWriter::new(fs, event_log),
            next_cluster: 100,
            outcomes: HashMap::new(),
            ledger: Arc::new(Mutex::new(FakeLedger::default())),
        }
    }

    /// Queue outcomes for successive submissions of `node`.
    pub fn script(mut self, node: &str, outcomes: &[FakeOutcome]) -> Self {
        self.outcomes
            .entry(node.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
        self
    }

    /// First cluster id handed out.
    pub fn starting_at(mut self, cluster: i64) -> Self {
        self.next_cluster = cluster;
        self
    }

    pub fn ledger(&self) -> Arc<Mutex<FakeLedger>> {
        Arc::clone(&self.ledger)
    }

    fn write(&self, id: CondorId, kind: LogEventKind) -> Result<()> {
        Ok(self.writer.write(&LogEvent::at(id, kind, 0))?)
    }
}

impl SubmitBackend for FakeSubmitter {
    fn submit_nodes(
        &mut self,
        requests: Vec<SubmitRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            for req in requests {
                self.ledger.lock().unwrap().submitted.push(req.name.clone());
                let outcome = self
                    .outcomes
                    .get_mut(&req.name)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(FakeOutcome::Exit(0));

                if outcome == FakeOutcome::SubmitFails {
                    self.runtime_tx
                        .send(RuntimeEvent::SubmitFinished {
                            node: req.node,
                            result: Err(format!("fake submit failure for {}", req.name)),
                        })
                        .await
                        .map_err(anyhow::Error::from)?;
                    continue;
                }

                let id = CondorId::new(self.next_cluster, 0, 0);
                self.next_cluster += 1;
                self.write(id, LogEventKind::Submit { node: Some(req.name.clone()) })?;
                self.runtime_tx
                    .send(RuntimeEvent::SubmitFinished {
                        node: req.node,
                        result: Ok(id),
                    })
                    .await
                    .map_err(anyhow::Error::from)?;

                if let FakeOutcome::Exit(code) = outcome {
                    self.write(id, LogEventKind::Execute { host: None })?;
                    self.write(id, LogEventKind::Terminated(Termination::Normal(code)))?;
                }
                self.runtime_tx
                    .send(RuntimeEvent::LogChanged)
                    .await
                    .map_err(anyhow::Error::from)?;
            }
            Ok(())
        })
    }

    fn remove_jobs(
        &mut self,
        ids: Vec<CondorId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            for id in ids {
                self.write(id, LogEventKind::Aborted { reason: Some("removed".into()) })?;
                self.ledger.lock().unwrap().removed.push(id);
            }
            Ok(())
        })
    }
}
