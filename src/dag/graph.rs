// src/dag/graph.rs

//! Cycle detection over the node table.

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::node::{DagNode, NodeId};
use crate::errors::{GridflowError, Result};

/// Build a petgraph view of the dependency edges.
///
/// Edge direction: parent -> child.
fn build_graph(nodes: &[DagNode]) -> DiGraphMap<NodeId, ()> {
    let mut graph: DiGraphMap<NodeId, ()> = DiGraphMap::new();
    for node in nodes {
        graph.add_node(node.id);
    }
    for node in nodes {
        for &child in &node.outgoing {
            graph.add_edge(node.id, child, ());
        }
    }
    graph
}

pub fn is_cycle(nodes: &[DagNode]) -> bool {
    toposort(&build_graph(nodes), None).is_err()
}

/// Fails with [`GridflowError::DagCycle`] naming one node on the cycle.
pub fn check_acyclic(nodes: &[DagNode]) -> Result<()> {
    match toposort(&build_graph(nodes), None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let id = cycle.node_id();
            let name = nodes
                .get(id)
                .map(|n| n.name.as_str())
                .unwrap_or("<unknown>");
            Err(GridflowError::DagCycle(format!(
                "cycle detected in DAG involving node '{name}'"
            )))
        }
    }
}
