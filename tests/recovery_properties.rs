// tests/recovery_properties.rs

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;

use gridflow::dag::{DagEngine, DagOptions, DagStep, NodeId, NodeSpec, NodeStatus, RecoveryRecord};
use gridflow::types::CondorId;
use gridflow::userlog::{LogEvent, LogEventKind, Termination};

/// Shape of a generated DAG. Edges only run from lower to higher node
/// index, so every generated DAG is acyclic.
#[derive(Debug, Clone)]
struct DagShape {
    nodes: usize,
    edges: BTreeSet<(usize, usize)>,
    retries: Vec<u32>,
    max_jobs: usize,
}

impl DagShape {
    fn build(&self) -> DagEngine {
        let mut dag = DagEngine::new(DagOptions {
            max_jobs: self.max_jobs,
            ..DagOptions::default()
        });
        for i in 0..self.nodes {
            let name = format!("N{i}");
            let id = dag
                .add_node(NodeSpec::new(name.as_str(), format!("{name}.sub")))
                .expect("unique node names");
            if self.retries[i] > 0 {
                dag.set_retry(id, self.retries[i], None).expect("known node");
            }
        }
        for &(p, c) in &self.edges {
            dag.add_dependency(p, c).expect("acyclic edge");
        }
        dag
    }
}

fn dag_shape_strategy(max_nodes: usize) -> impl Strategy<Value = DagShape> {
    (1..=max_nodes).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
            pairs
                .into_iter()
                .filter_map(|(a, b)| match a.cmp(&b) {
                    std::cmp::Ordering::Less => Some((a, b)),
                    std::cmp::Ordering::Greater => Some((b, a)),
                    std::cmp::Ordering::Equal => None,
                })
                .collect::<BTreeSet<_>>()
        });
        let retries = proptest::collection::vec(0u32..3, n);
        (Just(n), edges, retries, 0usize..4).prop_map(|(nodes, edges, retries, max_jobs)| {
            DagShape {
                nodes,
                edges,
                retries,
                max_jobs,
            }
        })
    })
}

/// What happens to one in-flight node.
#[derive(Debug, Clone, Copy)]
enum Op {
    /// Pick the `n`th in-flight node; submit replies succeed, jobs exit 0.
    Succeed(usize),
    /// Submit replies fail, jobs exit 1.
    Fail(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<usize>().prop_map(Op::Succeed),
        1 => any::<usize>().prop_map(Op::Fail),
    ]
}

type NodeState = (NodeStatus, Option<CondorId>, u32);

fn state(dag: &DagEngine) -> Vec<NodeState> {
    dag.nodes()
        .iter()
        .map(|n| (n.status(), n.condor_id(), n.retries()))
        .collect()
}

/// Drives a DAG the way the runtime does, recording everything it logs.
struct LiveRun {
    dag: DagEngine,
    records: Vec<RecoveryRecord>,
    /// Record count and node state after each operation.
    checkpoints: Vec<(usize, Vec<NodeState>)>,
    next_cluster: i64,
}

impl LiveRun {
    fn new(dag: DagEngine) -> Self {
        Self {
            dag,
            records: Vec::new(),
            checkpoints: Vec::new(),
            next_cluster: 1,
        }
    }

    fn absorb(&mut self, step: DagStep) -> Result<(), TestCaseError> {
        for req in step.submits() {
            let node = self.dag.node(req.node).expect("submitted node exists");
            for parent in node.incoming() {
                prop_assert_eq!(
                    self.dag.node(*parent).map(|p| p.status()),
                    Some(NodeStatus::Done),
                    "{} submitted before its parent finished",
                    req.name
                );
            }
        }
        self.records.extend(step.records().cloned());
        Ok(())
    }

    fn run_ready(&mut self) -> Result<(), TestCaseError> {
        let step = self.dag.run_ready_jobs();
        self.absorb(step)?;
        let max_jobs = self.dag.options().max_jobs;
        if max_jobs > 0 {
            let in_queue = self
                .dag
                .nodes()
                .iter()
                .filter(|n| n.status().is_in_queue())
                .count();
            prop_assert!(in_queue <= max_jobs, "{in_queue} jobs queued, limit {max_jobs}");
        }
        self.checkpoints
            .push((self.records.len(), state(&self.dag)));
        Ok(())
    }

    fn apply(&mut self, op: Op) -> Result<(), TestCaseError> {
        let in_flight: Vec<NodeId> = self
            .dag
            .nodes()
            .iter()
            .filter(|n| n.status().is_in_queue())
            .map(|n| n.id())
            .collect();
        if in_flight.is_empty() {
            return Ok(());
        }
        let (pick, ok) = match op {
            Op::Succeed(n) => (n, true),
            Op::Fail(n) => (n, false),
        };
        let node = in_flight[pick % in_flight.len()];
        let status = self.dag.node(node).map(|n| n.status());

        let step = match (status, ok) {
            (Some(NodeStatus::Submitted), true) => {
                let id = CondorId::new(self.next_cluster, 0, 0);
                self.next_cluster += 1;
                self.dag.submit_succeeded(node, id)
            }
            (Some(NodeStatus::Submitted), false) => self.dag.submit_failed(node, "refused"),
            (_, ok) => {
                let id = self.dag.node(node).and_then(|n| n.condor_id());
                let Some(id) = id else {
                    return Ok(());
                };
                let code = if ok { 0 } else { 1 };
                self.dag.process_log_event(&LogEvent::at(
                    id,
                    LogEventKind::Terminated(Termination::Normal(code)),
                    0,
                ))
            }
        };
        self.absorb(step)?;
        self.run_ready()
    }
}

proptest! {
    #[test]
    fn replaying_any_prefix_reproduces_live_state(
        shape in dag_shape_strategy(8),
        ops in proptest::collection::vec(op_strategy(), 0..40),
    ) {
        let mut live = LiveRun::new(shape.build());
        live.run_ready()?;
        for op in ops {
            live.apply(op)?;
        }

        for (len, expected) in &live.checkpoints {
            let mut replayed = shape.build();
            let report = replayed.replay(&live.records[..*len], "");
            prop_assert!(report.warnings.is_empty(), "{:?}", report.warnings);
            prop_assert_eq!(&state(&replayed), expected);
        }
    }

    #[test]
    fn every_resubmission_follows_an_undo_or_terminate(
        shape in dag_shape_strategy(8),
        ops in proptest::collection::vec(op_strategy(), 0..40),
    ) {
        let mut live = LiveRun::new(shape.build());
        live.run_ready()?;
        for op in ops {
            live.apply(op)?;
        }

        // true while a node has a SubmitJob not yet closed out.
        let mut open: HashMap<NodeId, bool> = HashMap::new();
        for record in &live.records {
            match record {
                RecoveryRecord::SubmitJob { node } => {
                    let was_open = open.insert(*node, true).unwrap_or(false);
                    prop_assert!(!was_open, "node {} submitted twice without a result", node);
                }
                RecoveryRecord::UndoJob { node } | RecoveryRecord::TerminateJob { node, .. } => {
                    open.insert(*node, false);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn readiness_only_grows(
        shape in dag_shape_strategy(8),
        ops in proptest::collection::vec(op_strategy(), 0..40),
    ) {
        let mut live = LiveRun::new(shape.build());
        let waiting = |dag: &DagEngine| -> Vec<BTreeSet<NodeId>> {
            dag.nodes().iter().map(|n| n.waiting().clone()).collect()
        };
        let mut prev_waiting = waiting(&live.dag);
        let mut prev_status: Vec<NodeStatus> = live.dag.nodes().iter().map(|n| n.status()).collect();
        let mut released = vec![0u32; shape.nodes];

        live.run_ready()?;
        for op in ops {
            live.apply(op)?;
            let now_waiting = waiting(&live.dag);
            for (i, (before, after)) in prev_waiting.iter().zip(&now_waiting).enumerate() {
                prop_assert!(after.is_subset(before), "N{} gained a parent to wait on", i);
            }
            for node in live.dag.nodes() {
                let i = node.id();
                if prev_status[i] == NodeStatus::NotReady && node.status() != NodeStatus::NotReady {
                    released[i] += 1;
                    prop_assert!(node.waiting().is_empty());
                    for parent in node.incoming() {
                        prop_assert_eq!(
                            live.dag.node(*parent).map(|p| p.status()),
                            Some(NodeStatus::Done)
                        );
                    }
                }
                prop_assert!(released[i] <= 1, "N{} released twice", i);
            }
            prev_waiting = now_waiting;
            prev_status = live.dag.nodes().iter().map(|n| n.status()).collect();
        }
    }
}

#[test]
fn crash_between_submit_and_job_id_is_reconciled_from_the_event_log() {
    let shape = DagShape {
        nodes: 2,
        edges: BTreeSet::from([(0, 1)]),
        retries: vec![0, 0],
        max_jobs: 0,
    };
    let mut live = shape.build();
    let step = live.run_ready_jobs();
    let logged: Vec<RecoveryRecord> = step.records().cloned().collect();
    assert_eq!(logged, vec![RecoveryRecord::SubmitJob { node: 0 }]);
    // Crash: the submit RPC reply never arrived.

    let mut dag = shape.build();
    let report = dag.replay(&logged, "");
    assert!(report.warnings.is_empty());
    assert_eq!(dag.status_of("N0"), Some(NodeStatus::Submitted));
    assert_eq!(dag.run_ready_jobs().submits().count(), 0, "N0 must not be resubmitted");

    let id = CondorId::new(42, 0, 0);
    let step = dag.process_log_event(&LogEvent::at(
        id,
        LogEventKind::Submit {
            node: Some("N0".into()),
        },
        0,
    ));
    assert_eq!(
        step.records().cloned().collect::<Vec<_>>(),
        vec![RecoveryRecord::SetCondorId { node: 0, id }]
    );
    assert_eq!(dag.status_of("N0"), Some(NodeStatus::Running));

    dag.process_log_event(&LogEvent::at(
        id,
        LogEventKind::Terminated(Termination::Normal(0)),
        0,
    ));
    assert_eq!(dag.status_of("N0"), Some(NodeStatus::Done));
    let next: Vec<String> = dag.run_ready_jobs().submits().map(|r| r.name.clone()).collect();
    assert_eq!(next, vec!["N1"]);
}
