// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated DAG state
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels and the event log
//! - writing recovery records before acting on them
//! - handing submissions to the backend and spawning scripts
//! - handling Ctrl+C / shutdown
//!
//! The core is intended to be extensively unit tested without any Tokio,
//! channels, filesystem, or processes.

use crate::dag::DagEngine;
use crate::engine::event_handlers::{
    commands_from_step, finish_if_done, handle_log_events, handle_script_finished,
    handle_shutdown, handle_start, handle_submit_finished, CoreStep,
};
use crate::engine::RuntimeEvent;

/// Pure core runtime state.
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    dag: DagEngine,
    started: bool,
    finished: bool,
}

impl CoreRuntime {
    pub fn new(dag: DagEngine) -> Self {
        Self {
            dag,
            started: false,
            finished: false,
        }
    }

    pub fn dag(&self) -> &DagEngine {
        &self.dag
    }

    /// Whether a `Finish` command has been issued.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        if self.finished {
            return CoreStep::default();
        }

        let dag_step = match event {
            RuntimeEvent::Start => {
                self.started = true;
                handle_start(&mut self.dag)
            }
            RuntimeEvent::SubmitFinished { node, result } => {
                handle_submit_finished(&mut self.dag, node, result)
            }
            RuntimeEvent::ScriptFinished {
                node,
                kind,
                exit_code,
            } => handle_script_finished(&mut self.dag, node, kind, exit_code),
            RuntimeEvent::LogEvents(events) => handle_log_events(&mut self.dag, &events),
            // Reading the log is IO; the shell turns this into `LogEvents`.
            RuntimeEvent::LogChanged => return CoreStep::running(Vec::new()),
            RuntimeEvent::ShutdownRequested => {
                self.finished = true;
                return CoreStep {
                    commands: handle_shutdown(&self.dag),
                    keep_running: false,
                };
            }
        };

        let mut commands = commands_from_step(dag_step);
        if !self.started {
            return CoreStep::running(commands);
        }

        // Completions may have freed throttle slots or released children.
        commands.extend(commands_from_step(self.dag.run_ready_jobs()));

        match finish_if_done(&self.dag) {
            Some(finish) => {
                self.finished = true;
                commands.extend(finish);
                CoreStep {
                    commands,
                    keep_running: false,
                }
            }
            None => CoreStep::running(commands),
        }
    }
}
