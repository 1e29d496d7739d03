// src/dag/node.rs

//! DAG vertex type and its status enumeration.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::types::CondorId;

/// Node identifier, assigned sequentially at insertion.
pub type NodeId = usize;

/// Status of one DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeStatus {
    /// All parents are done; eligible for submission.
    Ready,
    /// Waiting on at least one parent.
    NotReady,
    /// PRE script running.
    PreRun,
    /// Submission issued, no job id known yet.
    Submitted,
    /// Job id known, job in the queue.
    Running,
    /// POST script running (or queued behind the POST throttle).
    PostRun,
    Done,
    Error,
}

impl NodeStatus {
    /// Node has work outstanding somewhere (script or job).
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            NodeStatus::PreRun | NodeStatus::Submitted | NodeStatus::Running | NodeStatus::PostRun
        )
    }

    /// Node counts against the `max_jobs` throttle.
    pub fn is_in_queue(self) -> bool {
        matches!(self, NodeStatus::Submitted | NodeStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Ready => "READY",
            NodeStatus::NotReady => "NOT_READY",
            NodeStatus::PreRun => "PRERUN",
            NodeStatus::Submitted => "SUBMITTED",
            NodeStatus::Running => "RUNNING",
            NodeStatus::PostRun => "POSTRUN",
            NodeStatus::Done => "DONE",
            NodeStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the job a script runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    Pre,
    Post,
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptKind::Pre => f.write_str("PRE"),
            ScriptKind::Post => f.write_str("POST"),
        }
    }
}

/// Input to [`crate::dag::DagEngine::add_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub submit_file: PathBuf,
    /// Working directory for submission and scripts; empty means the
    /// current directory.
    pub dir: PathBuf,
    /// Pre-satisfied node (`JOB ... DONE`).
    pub done: bool,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, submit_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            submit_file: submit_file.into(),
            dir: PathBuf::new(),
            done: false,
        }
    }

    pub fn done(mut self, done: bool) -> Self {
        self.done = done;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }
}

/// One DAG vertex.
///
/// Fields are only mutated by [`crate::dag::DagEngine`]; everything outside
/// the engine gets read access through the accessors.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) submit_file: PathBuf,
    pub(crate) dir: PathBuf,
    pub(crate) status: NodeStatus,
    pub(crate) incoming: BTreeSet<NodeId>,
    pub(crate) outgoing: BTreeSet<NodeId>,
    pub(crate) waiting: BTreeSet<NodeId>,
    pub(crate) condor_id: Option<CondorId>,
    pub(crate) pre_script: Option<String>,
    pub(crate) post_script: Option<String>,
    pub(crate) retry_max: u32,
    pub(crate) retries: u32,
    pub(crate) retry_unless_exit: Option<i32>,
    pub(crate) return_value: Option<i32>,
    pub(crate) pre_done: bool,
    pub(crate) submit_failures: u32,
}

impl DagNode {
    pub(crate) fn new(id: NodeId, spec: NodeSpec) -> Self {
        Self {
            id,
            name: spec.name,
            submit_file: spec.submit_file,
            dir: spec.dir,
            status: if spec.done {
                NodeStatus::Done
            } else {
                NodeStatus::Ready
            },
            incoming: BTreeSet::new(),
            outgoing: BTreeSet::new(),
            waiting: BTreeSet::new(),
            condor_id: None,
            pre_script: None,
            post_script: None,
            retry_max: 0,
            retries: 0,
            retry_unless_exit: None,
            return_value: None,
            pre_done: false,
            submit_failures: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit_file(&self) -> &Path {
        &self.submit_file
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn incoming(&self) -> &BTreeSet<NodeId> {
        &self.incoming
    }

    pub fn outgoing(&self) -> &BTreeSet<NodeId> {
        &self.outgoing
    }

    pub fn waiting(&self) -> &BTreeSet<NodeId> {
        &self.waiting
    }

    pub fn condor_id(&self) -> Option<CondorId> {
        self.condor_id
    }

    pub fn script(&self, kind: ScriptKind) -> Option<&str> {
        match kind {
            ScriptKind::Pre => self.pre_script.as_deref(),
            ScriptKind::Post => self.post_script.as_deref(),
        }
    }

    pub fn retry_max(&self) -> u32 {
        self.retry_max
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_unless_exit(&self) -> Option<i32> {
        self.retry_unless_exit
    }

    pub fn return_value(&self) -> Option<i32> {
        self.return_value
    }

    /// Eligible for `run_ready_jobs`.
    pub fn is_runnable(&self) -> bool {
        self.status == NodeStatus::Ready && self.waiting.is_empty()
    }

    /// Script command with `$JOB` and (for POST) `$RETURN` substituted.
    pub(crate) fn script_command(&self, kind: ScriptKind) -> Option<String> {
        let raw = self.script(kind)?;
        let mut cmd = raw.replace("$JOB", &self.name);
        if kind == ScriptKind::Post {
            let rv = self.return_value.unwrap_or(-1);
            cmd = cmd.replace("$RETURN", &rv.to_string());
        }
        Some(cmd)
    }
}
