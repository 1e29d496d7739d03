// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use tracing::{info, warn};

use crate::dag::{
    DagAction, DagEngine, DagStep, NodeId, RecoveryRecord, ScriptKind, ScriptRequest,
    SubmitRequest,
};
use crate::engine::{EXIT_ABORTED, EXIT_FAILED, EXIT_SUCCESS};
use crate::types::CondorId;
use crate::userlog::LogEvent;

/// Command produced by the pure core, to be executed by the outer IO shell
/// in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Append and sync a recovery record. Must complete before any later
    /// command runs.
    AppendRecord(RecoveryRecord),
    /// Hand a submission to the backend.
    Submit(SubmitRequest),
    /// Start a PRE/POST script.
    RunScript(ScriptRequest),
    /// Write the rescue DAG for the current node states.
    WriteRescue,
    /// Remove these jobs from the queue.
    RemoveJobs(Vec<CondorId>),
    /// The run is over.
    Finish { exit_code: i32 },
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStep {
    /// Commands the IO shell should execute.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub(crate) fn running(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }

    /// Exit code carried by a `Finish` command, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.commands.iter().find_map(|c| match c {
            CoreCommand::Finish { exit_code } => Some(*exit_code),
            _ => None,
        })
    }
}

/// Translate engine actions into shell commands, preserving order.
pub fn commands_from_step(step: DagStep) -> Vec<CoreCommand> {
    step.actions
        .into_iter()
        .map(|action| match action {
            DagAction::Record(r) => CoreCommand::AppendRecord(r),
            DagAction::Submit(s) => CoreCommand::Submit(s),
            DagAction::RunScript(s) => CoreCommand::RunScript(s),
        })
        .collect()
}

pub fn handle_start(dag: &mut DagEngine) -> DagStep {
    let mut step = dag.resume_after_replay();
    step.merge(dag.run_ready_jobs());
    step
}

pub fn handle_submit_finished(
    dag: &mut DagEngine,
    node: NodeId,
    result: std::result::Result<CondorId, String>,
) -> DagStep {
    match result {
        Ok(id) => dag.submit_succeeded(node, id),
        Err(message) => dag.submit_failed(node, &message),
    }
}

pub fn handle_script_finished(
    dag: &mut DagEngine,
    node: NodeId,
    kind: ScriptKind,
    exit_code: i32,
) -> DagStep {
    dag.script_finished(node, kind, exit_code)
}

pub fn handle_log_events(dag: &mut DagEngine, events: &[LogEvent]) -> DagStep {
    let mut step = DagStep::default();
    for event in events {
        step.merge(dag.process_log_event(event));
    }
    step
}

/// Commands that end the run if nothing is left to do.
pub fn finish_if_done(dag: &DagEngine) -> Option<Vec<CoreCommand>> {
    if !dag.is_finished() {
        return None;
    }
    let summary = dag.summary();
    if dag.all_done() {
        info!(total = summary.total, "all nodes done");
        return Some(vec![CoreCommand::Finish {
            exit_code: EXIT_SUCCESS,
        }]);
    }
    let failed: Vec<&str> = dag.failed_nodes().iter().map(|n| n.name()).collect();
    warn!(
        total = summary.total,
        done = summary.done,
        failed = summary.failed,
        ?failed,
        "DAG finished with failed nodes"
    );
    Some(vec![
        CoreCommand::WriteRescue,
        CoreCommand::Finish {
            exit_code: EXIT_FAILED,
        },
    ])
}

/// Rescue DAG first, then pull whatever is still queued.
pub fn handle_shutdown(dag: &DagEngine) -> Vec<CoreCommand> {
    let in_flight = dag.in_flight_condor_ids();
    info!(in_flight = in_flight.len(), "shutdown requested");
    let mut commands = vec![CoreCommand::WriteRescue];
    if !in_flight.is_empty() {
        commands.push(CoreCommand::RemoveJobs(in_flight));
    }
    commands.push(CoreCommand::Finish {
        exit_code: EXIT_ABORTED,
    });
    commands
}
