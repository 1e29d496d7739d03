// src/grid/core.rs

//! Pure core of the gridmanager.
//!
//! [`GridCore`] consumes [`GridEvent`]s together with the current time and
//! returns the [`GridCommand`]s the shell must execute. It owns the
//! dispatcher, and through it every job and resource, but has no channels,
//! no Tokio types and performs no IO.

use tracing::{debug, info};

use super::dispatcher::GridManagerDispatcher;
use super::{GridCommand, GridEvent, GridStep, EXIT_SHUTDOWN};

#[derive(Debug)]
pub struct GridCore {
    dispatcher: GridManagerDispatcher,
    finished: bool,
}

impl GridCore {
    pub fn new(dispatcher: GridManagerDispatcher) -> Self {
        Self {
            dispatcher,
            finished: false,
        }
    }

    pub fn dispatcher(&self) -> &GridManagerDispatcher {
        &self.dispatcher
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Handle one event at unix time `now`.
    pub fn step(&mut self, event: GridEvent, now: i64) -> GridStep {
        if self.finished {
            return GridStep::default();
        }

        let d = &mut self.dispatcher;
        let commands = match event {
            GridEvent::Start => d.start(now),
            GridEvent::Tick => d.tick(now),
            GridEvent::RpcReply { proc, seq, reply } => d.on_rpc_reply(proc, seq, reply, now),
            GridEvent::PingResult { key, up } => d.on_ping(&key, up, now),
            GridEvent::Callback { remote_id, status } => d.on_callback(remote_id, status, now),
            GridEvent::QueueSnapshot(snapshot) => d.on_snapshot(snapshot, now),
            GridEvent::QueueQueryFailed(msg) => d.on_query_failed(&msg, now),
            GridEvent::QueueCommitted => d.on_committed(now),
            GridEvent::QueueCommitFailed(msg) => d.on_commit_failed(&msg, now),
            GridEvent::ShutdownRequested => {
                info!(jobs = d.job_count(), "shutdown requested");
                self.finished = true;
                return GridStep {
                    commands: vec![GridCommand::Shutdown {
                        exit_code: EXIT_SHUTDOWN,
                    }],
                    keep_running: false,
                };
            }
        };

        if commands
            .iter()
            .any(|c| matches!(c, GridCommand::Shutdown { .. }))
        {
            debug!("core finished");
            self.finished = true;
            return GridStep {
                commands,
                keep_running: false,
            };
        }
        GridStep::running(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridmanagerSection;
    use crate::grid::QueueSnapshot;

    #[test]
    fn empty_queue_shuts_down() {
        let mut core = GridCore::new(GridManagerDispatcher::new(GridmanagerSection::default()));
        let step = core.step(GridEvent::Start, 0);
        assert!(step.keep_running);
        let step = core.step(GridEvent::QueueSnapshot(QueueSnapshot::default()), 1);
        assert!(!step.keep_running);
        assert!(core.is_finished());
        assert_eq!(core.step(GridEvent::Tick, 2), GridStep::default());
    }

    #[test]
    fn shutdown_request_stops_the_core() {
        let mut core = GridCore::new(GridManagerDispatcher::new(GridmanagerSection::default()));
        let step = core.step(GridEvent::ShutdownRequested, 0);
        assert_eq!(
            step.commands,
            vec![GridCommand::Shutdown {
                exit_code: EXIT_SHUTDOWN
            }]
        );
        assert!(!step.keep_running);
    }
}
