// src/grid/mod.rs

//! Grid job management.
//!
//! Jobs handed to the gridmanager by the local queue are each driven by a
//! [`job::JobStateMachine`] against a remote resource. The
//! [`dispatcher::GridManagerDispatcher`] owns every job and resource,
//! batches queue synchronisation and discovers new work. Like the DAG
//! engine, the logic lives in a pure core ([`core::GridCore`]) fed with
//! [`GridEvent`]s, and an async shell ([`runtime::GridRuntime`]) executes
//! the [`GridCommand`]s it returns.

use std::path::PathBuf;

use crate::types::ProcId;
use crate::userlog::LogEvent;

pub mod ad;
pub mod backend;
pub mod callbacks;
pub mod core;
pub mod credential;
pub mod dispatcher;
pub mod expr;
pub mod helper_backend;
pub mod job;
pub mod phase;
pub mod policy;
pub mod queue;
pub mod resource;
pub mod runtime;
pub mod schedd;

pub use ad::{AdValue, JobAd, LocalStatus};
pub use backend::{BackendKind, RemoteBackend, RemoteOp, RemoteStatus, RpcReply};
pub use core::GridCore;
pub use dispatcher::GridManagerDispatcher;
pub use helper_backend::HelperBackend;
pub use job::JobStateMachine;
pub use phase::{JobPhase, RemoteState};
pub use queue::{FileJobQueue, InMemoryJobQueue, JobQueue, QueueSnapshot, QueueUpdate};
pub use resource::ResourceKey;
pub use runtime::GridRuntime;

/// Events flowing into the grid core from RPC tasks, the queue, callback
/// listeners, the ticker and signal handlers.
#[derive(Debug, Clone)]
pub enum GridEvent {
    /// First event after startup.
    Start,
    /// Timer tick; the shell sends one per second.
    Tick,
    RpcReply {
        proc: ProcId,
        seq: u64,
        reply: RpcReply,
    },
    PingResult {
        key: ResourceKey,
        up: bool,
    },
    /// Status pushed by a remote resource.
    Callback {
        remote_id: String,
        status: RemoteStatus,
    },
    QueueSnapshot(QueueSnapshot),
    QueueQueryFailed(String),
    QueueCommitted,
    QueueCommitFailed(String),
    ShutdownRequested,
}

/// One RPC for the shell to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub proc: ProcId,
    pub seq: u64,
    pub kind: BackendKind,
    pub endpoint: String,
    pub op: RemoteOp,
}

/// Queue updates plus the event-log records that go with them. Events are
/// written before the updates are committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushBatch {
    pub updates: Vec<QueueUpdate>,
    pub events: Vec<(PathBuf, LogEvent)>,
}

/// Commands the grid core asks the shell to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum GridCommand {
    Rpc(RpcRequest),
    Ping { key: ResourceKey },
    QueryQueue { first_contact: bool },
    Flush(FlushBatch),
    RestartHelpers(Vec<BackendKind>),
    Shutdown { exit_code: i32 },
}

/// Result of one core step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridStep {
    pub commands: Vec<GridCommand>,
    pub keep_running: bool,
}

impl GridStep {
    pub fn running(commands: Vec<GridCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }
}

/// Exit code once no managed jobs are left.
pub const EXIT_NO_JOBS: i32 = 0;
/// Exit code after a shutdown request.
pub const EXIT_SHUTDOWN: i32 = 0;
