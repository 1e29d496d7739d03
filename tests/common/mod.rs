// tests/common/mod.rs

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::sync::mpsc;

use gridflow::cli::{normalize_legacy_args, DagmanArgs};
use gridflow::config::{DagmanSection, GridmanagerSection};
use gridflow::dagman::{self, RunPaths};
use gridflow::engine::{CoreRuntime, Runtime, RuntimeEvent};
use gridflow::fs::mock::MockFileSystem;
use gridflow::fs::FileSystem;
use gridflow::grid::{
    FlushBatch, GridCommand, GridCore, GridEvent, GridManagerDispatcher, InMemoryJobQueue,
    JobAd, JobPhase, JobQueue, JobStateMachine, RemoteBackend, RemoteOp, RpcReply, RpcRequest,
};
use gridflow::types::ProcId;
use gridflow::userlog::reader::parse_events;
use gridflow::userlog::{LogEvent, UserLogWriter};
use gridflow_test_utils::fake_submitter::FakeLedger;
use gridflow_test_utils::{FakeSubmitter, ScriptedBackend};

pub use gridflow_test_utils::{init_tracing, with_timeout};

/// Unix time the grid harness clock starts at.
pub const START_TIME: i64 = 1_700_000_000;

/// Order in which the harness saw RPCs and queue flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    Rpc(&'static str),
    /// Index into [`GridHarness::flushes`].
    Flush(usize),
}

/// Drives a [`GridCore`] by hand with a simulated clock.
///
/// Commands are executed inline: RPCs and pings go to a
/// [`ScriptedBackend`], queue queries and flushes go to an
/// [`InMemoryJobQueue`], and event-log records land in a
/// [`MockFileSystem`]. RPCs can be held back to model replies that have
/// not arrived yet.
pub struct GridHarness {
    pub core: GridCore,
    pub queue: InMemoryJobQueue,
    pub backend: Arc<ScriptedBackend>,
    pub fs: Arc<MockFileSystem>,
    pub now: i64,
    pub exit_code: Option<i32>,
    pub flushes: Vec<FlushBatch>,
    pub trace: Vec<Trace>,
    pub hold_rpcs: bool,
    held: Vec<RpcRequest>,
    events: VecDeque<GridEvent>,
}

impl GridHarness {
    pub fn new(cfg: GridmanagerSection, jobs: Vec<JobAd>, backend: ScriptedBackend) -> Self {
        let queue = InMemoryJobQueue::new();
        for ad in jobs {
            queue.insert(ad);
        }
        Self {
            core: GridCore::new(GridManagerDispatcher::new(cfg)),
            queue,
            backend: Arc::new(backend),
            fs: Arc::new(MockFileSystem::new()),
            now: START_TIME,
            exit_code: None,
            flushes: Vec::new(),
            trace: Vec::new(),
            hold_rpcs: false,
            held: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub async fn start(&mut self) {
        self.feed(GridEvent::Start).await;
    }

    /// Deliver `event` and everything it causes, until the core is quiet.
    pub async fn feed(&mut self, event: GridEvent) {
        self.events.push_back(event);
        while let Some(event) = self.events.pop_front() {
            let step = self.core.step(event, self.now);
            for command in step.commands {
                self.execute(command).await;
            }
        }
    }

    async fn execute(&mut self, command: GridCommand) {
        match command {
            GridCommand::Rpc(req) => {
                self.trace.push(Trace::Rpc(req.op.name()));
                if self.hold_rpcs {
                    self.held.push(req);
                } else {
                    self.answer(req).await;
                }
            }
            GridCommand::Ping { key } => {
                let reply = self
                    .backend
                    .call(key.kind, &key.endpoint, RemoteOp::Ping)
                    .await;
                let up = !matches!(reply, RpcReply::Unreachable(_));
                self.events.push_back(GridEvent::PingResult { key, up });
            }
            GridCommand::QueryQueue { first_contact } => {
                let event = match self.queue.query(first_contact).await {
                    Ok(snapshot) => GridEvent::QueueSnapshot(snapshot),
                    Err(e) => GridEvent::QueueQueryFailed(e.to_string()),
                };
                self.events.push_back(event);
            }
            GridCommand::Flush(batch) => {
                let fs: Arc<dyn FileSystem> = self.fs.clone();
                for (path, event) in &batch.events {
                    UserLogWriter::new(Arc::clone(&fs), path.clone())
                        .write(event)
                        .expect("event-log write");
                }
                self.queue
                    .commit(batch.updates.clone())
                    .await
                    .expect("queue commit");
                self.trace.push(Trace::Flush(self.flushes.len()));
                self.flushes.push(batch);
                self.events.push_back(GridEvent::QueueCommitted);
            }
            GridCommand::RestartHelpers(kinds) => {
                for kind in kinds {
                    self.backend
                        .restart_helper(kind)
                        .await
                        .expect("restart helper");
                }
            }
            GridCommand::Shutdown { exit_code } => self.exit_code = Some(exit_code),
        }
    }

    async fn answer(&mut self, req: RpcRequest) {
        let RpcRequest {
            proc,
            seq,
            kind,
            endpoint,
            op,
        } = req;
        let reply = self.backend.call(kind, &endpoint, op).await;
        self.events
            .push_back(GridEvent::RpcReply { proc, seq, reply });
    }

    /// Answer every RPC held back so far and stop holding new ones.
    pub async fn release_rpcs(&mut self) {
        self.hold_rpcs = false;
        for req in std::mem::take(&mut self.held) {
            self.answer(req).await;
        }
        let pending: Vec<GridEvent> = self.events.drain(..).collect();
        for event in pending {
            self.feed(event).await;
        }
    }

    pub fn held_rpcs(&self) -> usize {
        self.held.len()
    }

    /// Tick once per simulated second, stopping early once the core exits.
    pub async fn advance(&mut self, secs: i64) {
        for _ in 0..secs {
            if self.finished() {
                return;
            }
            self.now += 1;
            self.feed(GridEvent::Tick).await;
        }
    }

    /// Tick until `pred` holds or `max_secs` have passed. Returns whether
    /// `pred` was met.
    pub async fn run_until(&mut self, max_secs: i64, pred: impl Fn(&GridHarness) -> bool) -> bool {
        for _ in 0..max_secs {
            if pred(self) {
                return true;
            }
            if self.finished() {
                return false;
            }
            self.now += 1;
            self.feed(GridEvent::Tick).await;
        }
        pred(self)
    }

    pub fn finished(&self) -> bool {
        self.core.is_finished()
    }

    pub fn job(&self, proc: ProcId) -> Option<&JobStateMachine> {
        self.core.dispatcher().job(proc)
    }

    pub fn phase(&self, proc: ProcId) -> Option<JobPhase> {
        self.job(proc).map(JobStateMachine::phase)
    }

    pub fn log_events(&self, path: impl AsRef<Path>) -> Vec<LogEvent> {
        let text = self.fs.contents(path).unwrap_or_default();
        parse_events(&text).0.events
    }
}

// ---- DAG runs -------------------------------------------------------------

/// `condor_dagman -Dag <dag> <extra...>`.
pub fn dagman_args(dag: &str, extra: &[&str]) -> DagmanArgs {
    let mut argv = vec!["condor_dagman", "-Dag", dag];
    argv.extend_from_slice(extra);
    DagmanArgs::try_parse_from(normalize_legacy_args(argv)).expect("valid dagman arguments")
}

/// A prepared DAG run on a [`FakeSubmitter`], with `Start` already queued.
pub struct DagRun {
    pub runtime: Runtime<FakeSubmitter>,
    pub tx: mpsc::Sender<RuntimeEvent>,
    pub ledger: Arc<Mutex<FakeLedger>>,
    pub paths: RunPaths,
    pub recovery_mode: bool,
}

pub async fn prepare_dag(
    fs: &Arc<MockFileSystem>,
    args: &DagmanArgs,
    configure: impl FnOnce(FakeSubmitter) -> FakeSubmitter,
) -> DagRun {
    let fs_dyn: Arc<dyn FileSystem> = fs.clone();
    let run = dagman::prepare(Arc::clone(&fs_dyn), args, &DagmanSection::default())
        .expect("prepare DAG run");

    let (tx, rx) = mpsc::channel::<RuntimeEvent>(256);
    let submitter = configure(FakeSubmitter::new(
        tx.clone(),
        Arc::clone(&fs_dyn),
        run.paths.event_log.clone(),
    ));
    let ledger = submitter.ledger();

    if run.recovery_mode {
        tx.send(RuntimeEvent::LogChanged).await.expect("queue log read");
    }
    tx.send(RuntimeEvent::Start).await.expect("queue start");

    let runtime = Runtime::new(
        CoreRuntime::new(run.engine),
        rx,
        tx.clone(),
        submitter,
        fs_dyn,
        run.recovery,
        run.reader,
        run.rescue,
    );
    DagRun {
        runtime,
        tx,
        ledger,
        paths: run.paths,
        recovery_mode: run.recovery_mode,
    }
}

/// Run to completion and release the lock. Returns the exit code.
pub async fn run_dag(fs: &Arc<MockFileSystem>, run: DagRun) -> (i32, Arc<Mutex<FakeLedger>>, RunPaths) {
    let DagRun {
        runtime,
        ledger,
        paths,
        ..
    } = run;
    let code = with_timeout(runtime.run()).await.expect("runtime error");
    dagman::release_lock(fs.as_ref(), &paths.lock);
    (code, ledger, paths)
}
