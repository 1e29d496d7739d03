// src/dag/step.rs

//! Step-by-step result types for the DAG engine.

use std::path::PathBuf;

use crate::dag::node::{NodeId, ScriptKind};
use crate::dag::recovery::RecoveryRecord;

/// Submission the IO layer should perform for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub node: NodeId,
    pub name: String,
    pub submit_file: PathBuf,
    pub dir: PathBuf,
}

/// Script the IO layer should run for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub node: NodeId,
    pub name: String,
    pub kind: ScriptKind,
    pub command: String,
    pub dir: PathBuf,
}

/// Side effect requested by the engine, in the order it must happen.
///
/// A `Record` always precedes the `Submit` it protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagAction {
    Record(RecoveryRecord),
    Submit(SubmitRequest),
    RunScript(ScriptRequest),
}

/// Structured result of a single engine step.
///
/// Useful for tests that want to drive the DAG by hand and make assertions
/// about what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagStep {
    pub actions: Vec<DagAction>,
    /// Nodes whose last outstanding parent finished in this step.
    pub newly_ready: Vec<NodeId>,
    pub newly_done: Vec<NodeId>,
    pub newly_failed: Vec<NodeId>,
}

impl DagStep {
    pub fn merge(&mut self, other: DagStep) {
        self.actions.extend(other.actions);
        self.newly_ready.extend(other.newly_ready);
        self.newly_done.extend(other.newly_done);
        self.newly_failed.extend(other.newly_failed);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.newly_ready.is_empty()
            && self.newly_done.is_empty()
            && self.newly_failed.is_empty()
    }

    /// Submissions in this step, in order.
    pub fn submits(&self) -> impl Iterator<Item = &SubmitRequest> {
        self.actions.iter().filter_map(|a| match a {
            DagAction::Submit(req) => Some(req),
            _ => None,
        })
    }

    pub fn scripts(&self) -> impl Iterator<Item = &ScriptRequest> {
        self.actions.iter().filter_map(|a| match a {
            DagAction::RunScript(req) => Some(req),
            _ => None,
        })
    }

    pub fn records(&self) -> impl Iterator<Item = &RecoveryRecord> {
        self.actions.iter().filter_map(|a| match a {
            DagAction::Record(r) => Some(r),
            _ => None,
        })
    }
}
