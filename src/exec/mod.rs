// src/exec/mod.rs

//! Process execution layer.
//!
//! This module is responsible for actually running the external commands
//! the DAG run needs, using `tokio::process::Command`, and reporting back to
//! the runtime via `RuntimeEvent`s.
//!
//! - [`backend`] provides the `SubmitBackend` trait and the production
//!   `CondorSubmitBackend`; tests replace it with a fake.
//! - [`submit`] invokes the submit / remove commands.
//! - [`script_runner`] runs PRE and POST scripts.

pub mod backend;
pub mod script_runner;
pub mod submit;

pub use backend::{CondorSubmitBackend, SubmitBackend};
pub use script_runner::spawn_script;
