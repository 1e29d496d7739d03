// src/dag/engine.rs

//! The DAG engine: node table, readiness bookkeeping, throttles and the
//! replay of the recovery log.
//!
//! The engine is pure. Every operation returns a [`DagStep`] describing the
//! side effects (recovery records, submissions, scripts) the caller must
//! perform, in order. Replay drives the very same operations and discards
//! the returned records, so a recovered DAG ends up in the state a
//! continuously running one would have reached.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use crate::config::DagmanSection;
use crate::dag::graph;
use crate::dag::node::{DagNode, NodeId, NodeSpec, NodeStatus, ScriptKind};
use crate::dag::recovery::RecoveryRecord;
use crate::dag::step::{DagAction, DagStep, ScriptRequest, SubmitRequest};
use crate::errors::{GridflowError, Result};
use crate::types::CondorId;
use crate::userlog::{LogEvent, LogEventKind};

/// Throttles and failure policy of one DAG run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagOptions {
    /// 0 means unlimited.
    pub max_jobs: usize,
    pub max_pre: usize,
    pub max_post: usize,
    pub no_post_fail: bool,
    pub max_submit_attempts: u32,
}

impl Default for DagOptions {
    fn default() -> Self {
        Self::from_config(&DagmanSection::default())
    }
}

impl DagOptions {
    pub fn from_config(cfg: &DagmanSection) -> Self {
        Self {
            max_jobs: cfg.max_jobs,
            max_pre: cfg.max_pre,
            max_post: cfg.max_post,
            no_post_fail: cfg.no_post_fail,
            max_submit_attempts: cfg.max_submit_attempts.max(1),
        }
    }
}

/// Node counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DagSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub ready: usize,
    pub not_ready: usize,
    pub pre_run: usize,
    pub queued: usize,
    pub post_run: usize,
}

/// Outcome of replaying a recovery log.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub applied: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DagEngine {
    nodes: Vec<DagNode>,
    by_name: HashMap<String, NodeId>,
    by_condor_id: HashMap<CondorId, NodeId>,
    /// Job ids of failed attempts. Their events may be read again after a
    /// restart and must not touch the node's current attempt.
    retired: HashSet<CondorId>,
    options: DagOptions,
    pre_running: usize,
    post_running: usize,
    post_queue: VecDeque<NodeId>,
    /// Set once submission activity (or replay) has begun; the graph shape
    /// is frozen from then on.
    started: bool,
}

impl DagEngine {
    pub fn new(options: DagOptions) -> Self {
        Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
            by_condor_id: HashMap::new(),
            retired: HashSet::new(),
            options,
            pre_running: 0,
            post_running: 0,
            post_queue: VecDeque::new(),
            started: false,
        }
    }

    pub fn options(&self) -> &DagOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&DagNode> {
        self.node_id(name).and_then(|id| self.nodes.get(id))
    }

    pub fn node_for_condor_id(&self, id: CondorId) -> Option<NodeId> {
        self.by_condor_id.get(&id).copied()
    }

    pub fn status_of(&self, name: &str) -> Option<NodeStatus> {
        self.node_by_name(name).map(|n| n.status)
    }

    fn lookup(&self, id: NodeId) -> Result<()> {
        if id < self.nodes.len() {
            Ok(())
        } else {
            Err(GridflowError::NodeNotFound(format!("#{id}")))
        }
    }

    fn ensure_not_started(&self, what: &str) -> Result<()> {
        if self.started {
            return Err(GridflowError::Other(anyhow::anyhow!(
                "cannot {what} after the DAG has started running"
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    /// Insert a node and return its id. Ids are assigned sequentially.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        self.ensure_not_started("add a node")?;
        if self.by_name.contains_key(&spec.name) {
            return Err(GridflowError::DuplicateNode(spec.name));
        }
        let id = self.nodes.len();
        self.by_name.insert(spec.name.clone(), id);
        self.nodes.push(DagNode::new(id, spec));
        Ok(id)
    }

    /// Add the edge `parent -> child`.
    ///
    /// Only parents that are not already done are put into the child's
    /// waiting set; a child with anything to wait for is `NotReady`.
    pub fn add_dependency(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.ensure_not_started("add a dependency")?;
        self.lookup(parent)?;
        self.lookup(child)?;
        if parent == child {
            return Err(GridflowError::DagCycle(format!(
                "node '{}' cannot depend on itself",
                self.nodes[parent].name
            )));
        }

        let parent_done = self.nodes[parent].status == NodeStatus::Done;
        self.nodes[parent].outgoing.insert(child);

        let c = &mut self.nodes[child];
        c.incoming.insert(parent);
        if !parent_done {
            c.waiting.insert(parent);
            if c.status == NodeStatus::Ready {
                c.status = NodeStatus::NotReady;
            }
        }
        Ok(())
    }

    pub fn set_script(&mut self, node: NodeId, kind: ScriptKind, command: String) -> Result<()> {
        self.ensure_not_started("set a script")?;
        self.lookup(node)?;
        let n = &mut self.nodes[node];
        match kind {
            ScriptKind::Pre => n.pre_script = Some(command),
            ScriptKind::Post => n.post_script = Some(command),
        }
        Ok(())
    }

    pub fn set_retry(&mut self, node: NodeId, max: u32, unless_exit: Option<i32>) -> Result<()> {
        self.ensure_not_started("set a retry policy")?;
        self.lookup(node)?;
        let n = &mut self.nodes[node];
        n.retry_max = max;
        n.retry_unless_exit = unless_exit;
        Ok(())
    }

    pub fn is_cycle(&self) -> bool {
        graph::is_cycle(&self.nodes)
    }

    pub fn check_acyclic(&self) -> Result<()> {
        graph::check_acyclic(&self.nodes)
    }

    /// Records written at the head of a fresh recovery log.
    pub fn initial_records(&self, digest: &str) -> Vec<RecoveryRecord> {
        vec![
            RecoveryRecord::Initialize {
                node_count: self.nodes.len(),
                digest: digest.to_string(),
            },
            RecoveryRecord::DoneInitialize,
        ]
    }

    // ---------------------------------------------------------------------
    // Running
    // ---------------------------------------------------------------------

    fn in_queue_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status.is_in_queue()).count()
    }

    /// Start PRE scripts and submissions for every runnable node, in node
    /// order, within the `max_pre` / `max_jobs` throttles.
    ///
    /// Each submission is preceded by its `SubmitJob` record.
    pub fn run_ready_jobs(&mut self) -> DagStep {
        self.started = true;
        let mut step = DagStep::default();
        let mut in_queue = self.in_queue_count();

        for id in 0..self.nodes.len() {
            if !self.nodes[id].is_runnable() {
                continue;
            }

            if self.nodes[id].pre_script.is_some() && !self.nodes[id].pre_done {
                if self.options.max_pre > 0 && self.pre_running >= self.options.max_pre {
                    continue;
                }
                self.pre_running += 1;
                self.nodes[id].status = NodeStatus::PreRun;
                if let Some(req) = self.script_request(id, ScriptKind::Pre) {
                    debug!(node = %self.nodes[id].name, "starting PRE script");
                    step.actions.push(DagAction::RunScript(req));
                }
                continue;
            }

            if self.options.max_jobs > 0 && in_queue >= self.options.max_jobs {
                debug!(
                    node = %self.nodes[id].name,
                    max_jobs = self.options.max_jobs,
                    "max_jobs reached; deferring submission"
                );
                continue;
            }
            in_queue += 1;

            let node = &mut self.nodes[id];
            node.status = NodeStatus::Submitted;
            info!(node = %node.name, submit_file = ?node.submit_file, "submitting node job");
            step.actions
                .push(DagAction::Record(RecoveryRecord::SubmitJob { node: id }));
            step.actions.push(DagAction::Submit(SubmitRequest {
                node: id,
                name: node.name.clone(),
                submit_file: node.submit_file.clone(),
                dir: node.dir.clone(),
            }));
        }

        step
    }

    fn script_request(&self, id: NodeId, kind: ScriptKind) -> Option<ScriptRequest> {
        let node = &self.nodes[id];
        node.script_command(kind).map(|command| ScriptRequest {
            node: id,
            name: node.name.clone(),
            kind,
            command,
            dir: node.dir.clone(),
        })
    }

    /// The submission RPC returned a job id.
    pub fn submit_succeeded(&mut self, node: NodeId, id: CondorId) -> DagStep {
        self.assign_condor_id(node, id)
    }

    /// The submission RPC failed; the node was never queued.
    ///
    /// Records `UndoJob`, then either returns the node to `Ready` for another
    /// attempt or fails it once `max_submit_attempts` is used up.
    pub fn submit_failed(&mut self, node: NodeId, message: &str) -> DagStep {
        let mut step = DagStep::default();
        let Some(n) = self.nodes.get_mut(node) else {
            warn!(node, "submit failure for unknown node");
            return step;
        };
        if n.status != NodeStatus::Submitted {
            warn!(node = %n.name, status = %n.status, "submit failure for node that is not submitted; ignoring");
            return step;
        }

        step.actions
            .push(DagAction::Record(RecoveryRecord::UndoJob { node }));
        n.submit_failures += 1;
        if n.submit_failures >= self.options.max_submit_attempts {
            warn!(
                node = %n.name,
                attempts = n.submit_failures,
                error = %message,
                "node submission failed too many times"
            );
            n.status = NodeStatus::Error;
            step.newly_failed.push(node);
        } else {
            warn!(
                node = %n.name,
                attempt = n.submit_failures,
                error = %message,
                "node submission failed; will retry"
            );
            n.status = NodeStatus::Ready;
        }
        step
    }

    /// Attach a job id to a submitted node (idempotent).
    ///
    /// Called from the submission reply, from a tagged SUBMIT event and
    /// from replay; whichever comes first writes the `SetCondorID` record.
    pub fn assign_condor_id(&mut self, node: NodeId, id: CondorId) -> DagStep {
        let mut step = DagStep::default();
        let Some(n) = self.nodes.get_mut(node) else {
            warn!(node, %id, "job id for unknown node");
            return step;
        };

        if n.condor_id == Some(id) {
            return step;
        }
        if self.retired.contains(&id) {
            debug!(node = %n.name, %id, "job id belongs to an earlier attempt; ignoring");
            return step;
        }
        if n.status != NodeStatus::Submitted {
            warn!(
                node = %n.name,
                status = %n.status,
                %id,
                previous = ?n.condor_id,
                "job id for node that is not awaiting one; ignoring"
            );
            return step;
        }

        debug!(node = %n.name, %id, "node job id assigned");
        n.condor_id = Some(id);
        n.status = NodeStatus::Running;
        self.by_condor_id.insert(id, node);
        step.actions
            .push(DagAction::Record(RecoveryRecord::SetCondorId { node, id }));
        step
    }

    /// Apply one event-log record.
    pub fn process_log_event(&mut self, event: &LogEvent) -> DagStep {
        match &event.kind {
            LogEventKind::Submit { node: Some(name) } => match self.node_id(name) {
                Some(node) => self.assign_condor_id(node, event.id),
                None => {
                    warn!(node = %name, id = %event.id, "submit event for unknown DAG node");
                    DagStep::default()
                }
            },
            LogEventKind::Submit { node: None } => {
                if self.node_for_condor_id(event.id).is_none() {
                    warn!(id = %event.id, "untagged submit event for unknown job; ignoring");
                }
                DagStep::default()
            }
            _ if self.retired.contains(&event.id) => {
                debug!(id = %event.id, event = event.kind.code(), "event for an earlier attempt; ignoring");
                DagStep::default()
            }
            LogEventKind::Terminated(term) => match self.node_for_condor_id(event.id) {
                Some(node) => self.job_terminated(node, term.return_value()),
                None => {
                    warn!(id = %event.id, "terminate event for unknown job; ignoring");
                    DagStep::default()
                }
            },
            LogEventKind::Aborted { reason } => match self.node_for_condor_id(event.id) {
                Some(node) => {
                    warn!(
                        node = %self.nodes[node].name,
                        id = %event.id,
                        reason = reason.as_deref().unwrap_or(""),
                        "node job aborted"
                    );
                    self.job_terminated(node, -1)
                }
                None => {
                    warn!(id = %event.id, "abort event for unknown job; ignoring");
                    DagStep::default()
                }
            },
            LogEventKind::Execute { host } => {
                if let Some(node) = self.node_for_condor_id(event.id) {
                    info!(node = %self.nodes[node].name, id = %event.id, host = host.as_deref().unwrap_or(""), "node job executing");
                }
                DagStep::default()
            }
            LogEventKind::Held { reason } => {
                if let Some(node) = self.node_for_condor_id(event.id) {
                    warn!(node = %self.nodes[node].name, id = %event.id, reason = reason.as_deref().unwrap_or(""), "node job held");
                }
                DagStep::default()
            }
            LogEventKind::Evicted | LogEventKind::Released => {
                if let Some(node) = self.node_for_condor_id(event.id) {
                    info!(node = %self.nodes[node].name, id = %event.id, event = event.kind.code(), "node job event");
                }
                DagStep::default()
            }
            LogEventKind::GridResourceUp { .. }
            | LogEventKind::GridResourceDown { .. }
            | LogEventKind::GridSubmit { .. }
            | LogEventKind::Other(_) => DagStep::default(),
        }
    }

    /// The node's job left the queue with `return_value`.
    ///
    /// Records `TerminateJob`, then either starts the POST script or
    /// finishes the node directly.
    pub fn job_terminated(&mut self, node: NodeId, return_value: i32) -> DagStep {
        let mut step = DagStep::default();
        let Some(n) = self.nodes.get_mut(node) else {
            warn!(node, "termination for unknown node");
            return step;
        };
        if !n.status.is_in_queue() {
            warn!(node = %n.name, status = %n.status, "termination for node that is not in the queue; ignoring");
            return step;
        }

        info!(node = %n.name, return_value, "node job terminated");
        step.actions.push(DagAction::Record(RecoveryRecord::TerminateJob {
            node,
            return_value,
        }));
        n.return_value = Some(return_value);

        let skip_post = return_value != 0 && self.options.no_post_fail;
        if n.post_script.is_some() && !skip_post {
            n.status = NodeStatus::PostRun;
            if self.options.max_post == 0 || self.post_running < self.options.max_post {
                self.post_running += 1;
                if let Some(req) = self.script_request(node, ScriptKind::Post) {
                    step.actions.push(DagAction::RunScript(req));
                }
            } else {
                debug!(node = %self.nodes[node].name, "max_post reached; deferring POST script");
                self.post_queue.push_back(node);
            }
        } else {
            let finished = self.finish_node(node, return_value == 0, return_value);
            step.merge(finished);
        }
        step
    }

    /// A PRE or POST script exited.
    pub fn script_finished(&mut self, node: NodeId, kind: ScriptKind, exit_code: i32) -> DagStep {
        let mut step = DagStep::default();
        let Some(n) = self.nodes.get_mut(node) else {
            warn!(node, "script result for unknown node");
            return step;
        };

        match kind {
            ScriptKind::Pre => {
                if n.status != NodeStatus::PreRun {
                    warn!(node = %n.name, status = %n.status, "PRE script result for node not in PRERUN; ignoring");
                    return step;
                }
                self.pre_running = self.pre_running.saturating_sub(1);
                if exit_code == 0 {
                    n.pre_done = true;
                    n.status = NodeStatus::Ready;
                } else {
                    warn!(node = %n.name, exit_code, "PRE script failed");
                    n.return_value = Some(exit_code);
                    step.merge(self.finish_node(node, false, exit_code));
                }
            }
            ScriptKind::Post => {
                if n.status != NodeStatus::PostRun {
                    warn!(node = %n.name, status = %n.status, "POST script result for node not in POSTRUN; ignoring");
                    return step;
                }
                self.post_running = self.post_running.saturating_sub(1);
                if exit_code != 0 {
                    warn!(node = %n.name, exit_code, "POST script failed");
                }
                step.merge(self.finish_node(node, exit_code == 0, exit_code));
                step.merge(self.launch_deferred_posts());
            }
        }
        step
    }

    fn launch_deferred_posts(&mut self) -> DagStep {
        let mut step = DagStep::default();
        while self.options.max_post == 0 || self.post_running < self.options.max_post {
            let Some(node) = self.post_queue.pop_front() else {
                break;
            };
            self.post_running += 1;
            if let Some(req) = self.script_request(node, ScriptKind::Post) {
                step.actions.push(DagAction::RunScript(req));
            }
        }
        step
    }

    /// Terminal bookkeeping for one node attempt.
    ///
    /// Success marks the node done and releases its children. Failure
    /// retries (back to `Ready`) while retries remain and the return value
    /// is not the `UNLESS-EXIT` value; otherwise the node is in error.
    fn finish_node(&mut self, node: NodeId, success: bool, return_value: i32) -> DagStep {
        let mut step = DagStep::default();

        if success {
            self.nodes[node].status = NodeStatus::Done;
            step.newly_done.push(node);
            let children: Vec<NodeId> = self.nodes[node].outgoing.iter().copied().collect();
            for child in children {
                let c = &mut self.nodes[child];
                c.waiting.remove(&node);
                if c.waiting.is_empty() && c.status == NodeStatus::NotReady {
                    c.status = NodeStatus::Ready;
                    step.newly_ready.push(child);
                }
            }
            return step;
        }

        let n = &mut self.nodes[node];
        if let Some(id) = n.condor_id.take() {
            self.by_condor_id.remove(&id);
            self.retired.insert(id);
        }
        let retry_allowed = n.retries < n.retry_max && n.retry_unless_exit != Some(return_value);
        if retry_allowed {
            n.retries += 1;
            n.pre_done = false;
            n.status = NodeStatus::Ready;
            info!(
                node = %n.name,
                retry = n.retries,
                of = n.retry_max,
                "retrying failed node"
            );
        } else {
            n.status = NodeStatus::Error;
            warn!(node = %n.name, return_value, "node failed");
            step.newly_failed.push(node);
        }
        step
    }

    // ---------------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------------

    /// Replay a recovery log in file order.
    ///
    /// `SubmitJob` marks the node submitted without any RPC; every other
    /// record goes through the live code path, and the records that path
    /// would append are discarded.
    pub fn replay(&mut self, records: &[RecoveryRecord], digest: &str) -> ReplayReport {
        self.started = true;
        let mut report = ReplayReport::default();

        for record in records {
            let node = match record {
                RecoveryRecord::SubmitJob { node }
                | RecoveryRecord::SetCondorId { node, .. }
                | RecoveryRecord::TerminateJob { node, .. }
                | RecoveryRecord::UndoJob { node } => Some(*node),
                _ => None,
            };
            if let Some(node) = node {
                if node >= self.nodes.len() {
                    let msg = format!("recovery record '{record}' names unknown node {node}");
                    warn!("{msg}");
                    report.warnings.push(msg);
                    continue;
                }
            }

            match record {
                RecoveryRecord::Initialize {
                    node_count,
                    digest: logged,
                } => {
                    if *node_count != self.nodes.len() || logged != digest {
                        let msg = format!(
                            "DAG changed since the recovery log was written \
                             (logged {node_count} nodes / {logged}, now {} nodes / {digest})",
                            self.nodes.len()
                        );
                        warn!("{msg}");
                        report.warnings.push(msg);
                    }
                }
                RecoveryRecord::DoneInitialize => {}
                RecoveryRecord::SubmitJob { node } => {
                    let n = &mut self.nodes[*node];
                    if n.status == NodeStatus::Ready || n.status == NodeStatus::NotReady {
                        n.status = NodeStatus::Submitted;
                        // A node is only submitted once its PRE script passed.
                        if n.pre_script.is_some() {
                            n.pre_done = true;
                        }
                    } else {
                        let msg = format!(
                            "replayed SubmitJob for node '{}' in status {}",
                            n.name, n.status
                        );
                        warn!("{msg}");
                        report.warnings.push(msg);
                    }
                }
                RecoveryRecord::SetCondorId { node, id } => {
                    self.assign_condor_id(*node, *id);
                }
                RecoveryRecord::TerminateJob { node, return_value } => {
                    self.job_terminated(*node, *return_value);
                }
                RecoveryRecord::UndoJob { node } => {
                    self.submit_failed(*node, "submission undone before restart");
                }
            }
            report.applied += 1;
        }

        info!(
            applied = report.applied,
            warnings = report.warnings.len(),
            "recovery log replayed"
        );
        report
    }

    /// Relaunch the POST scripts a replay left running.
    ///
    /// Script outcomes are not logged, so a node whose POST was underway at
    /// the crash runs it again.
    pub fn resume_after_replay(&mut self) -> DagStep {
        let mut step = DagStep::default();
        for id in 0..self.nodes.len() {
            if self.nodes[id].status == NodeStatus::PostRun && !self.post_queue.contains(&id) {
                if let Some(req) = self.script_request(id, ScriptKind::Post) {
                    step.actions.push(DagAction::RunScript(req));
                }
            }
        }
        step
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Ids of every job currently in the queue.
    pub fn in_flight_condor_ids(&self) -> Vec<CondorId> {
        self.nodes
            .iter()
            .filter(|n| n.status.is_in_queue())
            .filter_map(|n| n.condor_id)
            .collect()
    }

    /// Nothing is in flight and nothing can be started.
    pub fn is_finished(&self) -> bool {
        !self
            .nodes
            .iter()
            .any(|n| n.status.is_in_flight() || n.is_runnable())
    }

    pub fn all_done(&self) -> bool {
        self.nodes.iter().all(|n| n.status == NodeStatus::Done)
    }

    pub fn failed_nodes(&self) -> Vec<&DagNode> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Error)
            .collect()
    }

    pub fn summary(&self) -> DagSummary {
        let mut s = DagSummary {
            total: self.nodes.len(),
            ..DagSummary::default()
        };
        for n in &self.nodes {
            match n.status {
                NodeStatus::Ready => s.ready += 1,
                NodeStatus::NotReady => s.not_ready += 1,
                NodeStatus::PreRun => s.pre_run += 1,
                NodeStatus::Submitted | NodeStatus::Running => s.queued += 1,
                NodeStatus::PostRun => s.post_run += 1,
                NodeStatus::Done => s.done += 1,
                NodeStatus::Error => s.failed += 1,
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::userlog::Termination;

    fn engine_with(names: &[&str], edges: &[(&str, &str)]) -> DagEngine {
        let mut dag = DagEngine::new(DagOptions::default());
        for name in names {
            dag.add_node(NodeSpec::new(*name, format!("{name}.sub")))
                .unwrap();
        }
        for (p, c) in edges {
            let p = dag.node_id(p).unwrap();
            let c = dag.node_id(c).unwrap();
            dag.add_dependency(p, c).unwrap();
        }
        dag
    }

    fn submitted_names(step: &DagStep) -> Vec<String> {
        step.submits().map(|r| r.name.clone()).collect()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut dag = engine_with(&["A"], &[]);
        let err = dag.add_node(NodeSpec::new("A", "x.sub")).unwrap_err();
        assert!(matches!(err, GridflowError::DuplicateNode(_)));
    }

    #[test]
    fn unknown_dependency_ids_fail() {
        let mut dag = engine_with(&["A"], &[]);
        assert!(matches!(
            dag.add_dependency(0, 7),
            Err(GridflowError::NodeNotFound(_))
        ));
    }

    #[test]
    fn dependencies_freeze_once_running() {
        let mut dag = engine_with(&["A", "B"], &[]);
        dag.run_ready_jobs();
        assert!(dag.add_dependency(0, 1).is_err());
    }

    #[test]
    fn record_precedes_each_submit() {
        let mut dag = engine_with(&["A", "B"], &[]);
        let step = dag.run_ready_jobs();
        assert_eq!(
            step.actions,
            vec![
                DagAction::Record(RecoveryRecord::SubmitJob { node: 0 }),
                DagAction::Submit(SubmitRequest {
                    node: 0,
                    name: "A".into(),
                    submit_file: "A.sub".into(),
                    dir: "".into(),
                }),
                DagAction::Record(RecoveryRecord::SubmitJob { node: 1 }),
                DagAction::Submit(SubmitRequest {
                    node: 1,
                    name: "B".into(),
                    submit_file: "B.sub".into(),
                    dir: "".into(),
                }),
            ]
        );
    }

    #[test]
    fn max_jobs_throttles_submission() {
        let mut dag = engine_with(&["A", "B", "C"], &[]);
        dag.options.max_jobs = 2;
        assert_eq!(submitted_names(&dag.run_ready_jobs()), vec!["A", "B"]);
        assert!(dag.run_ready_jobs().submits().next().is_none());

        dag.assign_condor_id(0, CondorId::new(1, 0, 0));
        dag.job_terminated(0, 0);
        assert_eq!(submitted_names(&dag.run_ready_jobs()), vec!["C"]);
    }

    #[test]
    fn done_parent_does_not_block_child() {
        let mut dag = DagEngine::new(DagOptions::default());
        let a = dag.add_node(NodeSpec::new("A", "a.sub").done(true)).unwrap();
        let b = dag.add_node(NodeSpec::new("B", "b.sub")).unwrap();
        dag.add_dependency(a, b).unwrap();
        assert_eq!(dag.node(b).unwrap().status(), NodeStatus::Ready);
        assert_eq!(submitted_names(&dag.run_ready_jobs()), vec!["B"]);
    }

    #[test]
    fn assign_condor_id_is_idempotent() {
        let mut dag = engine_with(&["A"], &[]);
        dag.run_ready_jobs();
        let id = CondorId::new(17, 0, 0);
        assert_eq!(dag.assign_condor_id(0, id).records().count(), 1);
        assert!(dag.assign_condor_id(0, id).is_empty());
        assert_eq!(dag.node(0).unwrap().status(), NodeStatus::Running);
        assert_eq!(dag.node_for_condor_id(id), Some(0));
    }

    #[test]
    fn terminate_for_unknown_or_idle_job_is_ignored() {
        let mut dag = engine_with(&["A"], &[]);
        let ev = LogEvent::at(
            CondorId::new(99, 0, 0),
            LogEventKind::Terminated(Termination::Normal(0)),
            0,
        );
        assert!(dag.process_log_event(&ev).is_empty());
        assert!(dag.job_terminated(0, 0).is_empty());
        assert_eq!(dag.node(0).unwrap().status(), NodeStatus::Ready);
    }

    #[test]
    fn retry_then_unless_exit() {
        let mut dag = engine_with(&["A"], &[]);
        dag.set_retry(0, 2, Some(42)).unwrap();

        dag.run_ready_jobs();
        dag.assign_condor_id(0, CondorId::new(1, 0, 0));
        let step = dag.job_terminated(0, 1);
        assert!(step.newly_failed.is_empty());
        assert_eq!(dag.node(0).unwrap().status(), NodeStatus::Ready);
        assert_eq!(dag.node(0).unwrap().condor_id(), None);
        assert_eq!(dag.node(0).unwrap().retries(), 1);

        dag.run_ready_jobs();
        dag.assign_condor_id(0, CondorId::new(2, 0, 0));
        let step = dag.job_terminated(0, 42);
        assert_eq!(step.newly_failed, vec![0]);
        assert_eq!(dag.node(0).unwrap().status(), NodeStatus::Error);
        assert!(dag.is_finished());
        assert!(!dag.all_done());
    }

    #[test]
    fn submit_failures_retry_then_fail() {
        let mut dag = engine_with(&["A"], &[]);
        dag.options.max_submit_attempts = 2;

        dag.run_ready_jobs();
        let step = dag.submit_failed(0, "no schedd");
        assert_eq!(
            step.records().cloned().collect::<Vec<_>>(),
            vec![RecoveryRecord::UndoJob { node: 0 }]
        );
        assert_eq!(dag.node(0).unwrap().status(), NodeStatus::Ready);

        dag.run_ready_jobs();
        let step = dag.submit_failed(0, "no schedd");
        assert_eq!(step.newly_failed, vec![0]);
        assert_eq!(dag.node(0).unwrap().status(), NodeStatus::Error);
    }

    #[test]
    fn pre_script_runs_once_then_submits() {
        let mut dag = engine_with(&["A"], &[]);
        dag.set_script(0, ScriptKind::Pre, "prep $JOB".into()).unwrap();

        let step = dag.run_ready_jobs();
        let scripts: Vec<_> = step.scripts().collect();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].command, "prep A");
        assert!(step.submits().next().is_none());
        assert_eq!(dag.node(0).unwrap().status(), NodeStatus::PreRun);

        dag.script_finished(0, ScriptKind::Pre, 0);
        let step = dag.run_ready_jobs();
        assert_eq!(submitted_names(&step), vec!["A"]);
        assert_eq!(step.scripts().count(), 0);
    }

    #[test]
    fn failing_pre_script_fails_node() {
        let mut dag = engine_with(&["A", "B"], &[("A", "B")]);
        dag.set_script(0, ScriptKind::Pre, "false".into()).unwrap();
        dag.run_ready_jobs();
        let step = dag.script_finished(0, ScriptKind::Pre, 3);
        assert_eq!(step.newly_failed, vec![0]);
        assert!(dag.is_finished());
        assert_eq!(dag.status_of("B"), Some(NodeStatus::NotReady));
    }

    #[test]
    fn post_script_decides_and_is_throttled() {
        let mut dag = engine_with(&["A", "B"], &[]);
        dag.options.max_post = 1;
        dag.set_script(0, ScriptKind::Post, "post $JOB $RETURN".into()).unwrap();
        dag.set_script(1, ScriptKind::Post, "post $JOB $RETURN".into()).unwrap();
        dag.run_ready_jobs();
        dag.assign_condor_id(0, CondorId::new(1, 0, 0));
        dag.assign_condor_id(1, CondorId::new(2, 0, 0));

        let step = dag.job_terminated(0, 5);
        let cmds: Vec<_> = step.scripts().map(|s| s.command.clone()).collect();
        assert_eq!(cmds, vec!["post A 5"]);

        let step = dag.job_terminated(1, 0);
        assert_eq!(step.scripts().count(), 0);
        assert_eq!(dag.status_of("B"), Some(NodeStatus::PostRun));

        // POST succeeds although the job failed; the deferred POST starts.
        let step = dag.script_finished(0, ScriptKind::Post, 0);
        assert_eq!(step.newly_done, vec![0]);
        let cmds: Vec<_> = step.scripts().map(|s| s.command.clone()).collect();
        assert_eq!(cmds, vec!["post B 0"]);
    }

    #[test]
    fn no_post_fail_skips_post_for_failed_job() {
        let mut dag = engine_with(&["A"], &[]);
        dag.options.no_post_fail = true;
        dag.set_script(0, ScriptKind::Post, "post".into()).unwrap();
        dag.run_ready_jobs();
        dag.assign_condor_id(0, CondorId::new(1, 0, 0));
        let step = dag.job_terminated(0, 2);
        assert_eq!(step.scripts().count(), 0);
        assert_eq!(step.newly_failed, vec![0]);
    }

    #[test]
    fn replay_matches_live_run() {
        let mut live = engine_with(&["A", "B", "C"], &[("A", "B"), ("A", "C")]);
        let mut log = live.initial_records("d");
        let collect = |step: DagStep, log: &mut Vec<RecoveryRecord>| {
            log.extend(step.records().cloned());
        };
        collect(live.run_ready_jobs(), &mut log);
        collect(live.assign_condor_id(0, CondorId::new(5, 0, 0)), &mut log);
        collect(live.job_terminated(0, 0), &mut log);
        collect(live.run_ready_jobs(), &mut log);
        collect(live.submit_failed(1, "x"), &mut log);
        collect(live.assign_condor_id(2, CondorId::new(6, 0, 0)), &mut log);

        let mut recovered = engine_with(&["A", "B", "C"], &[("A", "B"), ("A", "C")]);
        let report = recovered.replay(&log, "d");
        assert!(report.warnings.is_empty());

        let statuses = |d: &DagEngine| -> Vec<(NodeStatus, Option<CondorId>)> {
            d.nodes().iter().map(|n| (n.status(), n.condor_id())).collect()
        };
        assert_eq!(statuses(&live), statuses(&recovered));
    }

    #[test]
    fn replay_warns_on_changed_dag() {
        let mut dag = engine_with(&["A"], &[]);
        let report = dag.replay(
            &[RecoveryRecord::Initialize {
                node_count: 2,
                digest: "old".into(),
            }],
            "new",
        );
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn replay_relaunches_running_post_scripts() {
        let mut dag = engine_with(&["A"], &[]);
        dag.set_script(0, ScriptKind::Post, "post".into()).unwrap();
        dag.replay(
            &[
                RecoveryRecord::SubmitJob { node: 0 },
                RecoveryRecord::SetCondorId {
                    node: 0,
                    id: CondorId::new(3, 0, 0),
                },
                RecoveryRecord::TerminateJob {
                    node: 0,
                    return_value: 0,
                },
            ],
            "",
        );
        assert_eq!(dag.status_of("A"), Some(NodeStatus::PostRun));
        assert_eq!(dag.resume_after_replay().scripts().count(), 1);
    }
    #[test]
    fn events_of_a_retried_attempt_do_not_touch_the_retry() {
        let first = CondorId::new(1, 0, 0);
        let mut dag = engine_with(&["A"], &[]);
        dag.set_retry(0, 2, None).unwrap();
        dag.replay(
            &[
                RecoveryRecord::SubmitJob { node: 0 },
                RecoveryRecord::SetCondorId { node: 0, id: first },
                RecoveryRecord::TerminateJob {
                    node: 0,
                    return_value: 1,
                },
                RecoveryRecord::SubmitJob { node: 0 },
            ],
            "",
        );
        assert_eq!(dag.status_of("A"), Some(NodeStatus::Submitted));

        // The whole event log is read again after the restart.
        let submit = dag.process_log_event(&LogEvent::at(
            first,
            LogEventKind::Submit {
                node: Some("A".into()),
            },
            0,
        ));
        assert!(submit.is_empty());
        let terminate = dag.process_log_event(&LogEvent::at(
            first,
            LogEventKind::Terminated(Termination::Normal(1)),
            0,
        ));
        assert!(terminate.is_empty());

        let node = dag.node(0).unwrap();
        assert_eq!(node.status(), NodeStatus::Submitted);
        assert_eq!(node.retries(), 1);
        assert_eq!(node.condor_id(), None);
        assert_eq!(dag.run_ready_jobs().submits().count(), 0);

        let second = CondorId::new(2, 0, 0);
        let step = dag.process_log_event(&LogEvent::at(
            second,
            LogEventKind::Submit {
                node: Some("A".into()),
            },
            0,
        ));
        assert_eq!(
            step.records().cloned().collect::<Vec<_>>(),
            vec![RecoveryRecord::SetCondorId { node: 0, id: second }]
        );
    }

    #[test]
    fn replayed_undo_keeps_the_pre_script_done() {
        let mut live = engine_with(&["A"], &[]);
        live.set_script(0, ScriptKind::Pre, "prep".into()).unwrap();
        live.run_ready_jobs();
        live.script_finished(0, ScriptKind::Pre, 0);
        let mut log: Vec<RecoveryRecord> = live.run_ready_jobs().records().cloned().collect();
        log.extend(live.submit_failed(0, "no schedd").records().cloned());

        let mut recovered = engine_with(&["A"], &[]);
        recovered.set_script(0, ScriptKind::Pre, "prep".into()).unwrap();
        recovered.replay(&log, "");

        for dag in [&mut live, &mut recovered] {
            let step = dag.run_ready_jobs();
            assert_eq!(step.scripts().count(), 0, "PRE already passed");
            assert_eq!(submitted_names(&step), vec!["A"]);
        }
    }
}
