// src/dag/mod.rs

//! DAG representation and execution bookkeeping.
//!
//! - [`node`] holds the vertex type and node statuses.
//! - [`engine`] contains the DAG engine that decides which nodes are ready,
//!   applies job/script outcomes and replays the recovery log.
//! - [`step`] defines the result type for engine steps.
//! - [`graph`] performs cycle detection.
//! - [`parser`] reads DAG description files.
//! - [`recovery`] is the write-ahead recovery log.
//! - [`rescue`] writes and locates rescue DAGs.

pub mod engine;
pub mod graph;
pub mod node;
pub mod parser;
pub mod recovery;
pub mod rescue;
pub mod step;

pub use engine::{DagEngine, DagOptions, DagSummary, ReplayReport};
pub use node::{DagNode, NodeId, NodeSpec, NodeStatus, ScriptKind};
pub use parser::{load_dag_files, parse_dag_text, LoadedDag};
pub use recovery::{RecoveryContents, RecoveryLog, RecoveryRecord};
pub use step::{DagAction, DagStep, ScriptRequest, SubmitRequest};
