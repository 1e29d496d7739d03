// src/engine/mod.rs

//! Orchestration engine for a DAG run.
//!
//! This module ties together:
//! - the DAG engine (`dag::DagEngine`)
//! - the recovery log every state change is written to before it happens
//! - the main runtime event loop that reacts to:
//!   - submission results
//!   - PRE/POST script exits
//!   - new events in the node event log
//!   - shutdown signals
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use crate::dag::{NodeId, ScriptKind};
use crate::types::CondorId;
use crate::userlog::LogEvent;

/// Events flowing into the runtime from submitters, scripts, the event-log
/// watcher and signal handlers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Kick off the run (after recovery, if any).
    Start,
    /// A submission attempt for `node` finished.
    SubmitFinished {
        node: NodeId,
        result: std::result::Result<CondorId, String>,
    },
    /// A PRE or POST script exited.
    ScriptFinished {
        node: NodeId,
        kind: ScriptKind,
        exit_code: i32,
    },
    /// The event log may have grown; the shell reads it.
    LogChanged,
    /// Parsed events from the event log.
    LogEvents(Vec<LogEvent>),
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Exit code of a run that finished with every node done.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code of a run that finished with failed nodes.
pub const EXIT_FAILED: i32 = 1;
/// Exit code of a run stopped by a shutdown request.
pub const EXIT_ABORTED: i32 = 2;

pub mod core;
pub mod event_handlers;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::{RescueTarget, Runtime};
