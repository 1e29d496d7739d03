// src/userlog/event.rs

//! Event-log record model.

use chrono::{DateTime, Utc};

use crate::types::CondorId;

/// How a job process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this return value.
    Normal(i32),
    /// Killed by this signal.
    Signal(i32),
}

impl Termination {
    /// Return value as seen by DAG nodes and POST scripts. Signals map to
    /// the negated signal number.
    pub fn return_value(&self) -> i32 {
        match self {
            Termination::Normal(code) => *code,
            Termination::Signal(sig) => -sig,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Normal(0))
    }
}

/// Payload of one event-log record, keyed by its numeric event code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEventKind {
    /// 000: submitted to the local queue; carries the DAG node tag if any.
    Submit { node: Option<String> },
    /// 001
    Execute { host: Option<String> },
    /// 004
    Evicted,
    /// 005
    Terminated(Termination),
    /// 009
    Aborted { reason: Option<String> },
    /// 012
    Held { reason: Option<String> },
    /// 013
    Released,
    /// 025
    GridResourceUp { resource: String },
    /// 026
    GridResourceDown { resource: String },
    /// 027
    GridSubmit { resource: String, job_id: String },
    /// Any event code this crate does not interpret.
    Other(u16),
}

impl LogEventKind {
    pub fn code(&self) -> u16 {
        match self {
            LogEventKind::Submit { .. } => 0,
            LogEventKind::Execute { .. } => 1,
            LogEventKind::Evicted => 4,
            LogEventKind::Terminated(_) => 5,
            LogEventKind::Aborted { .. } => 9,
            LogEventKind::Held { .. } => 12,
            LogEventKind::Released => 13,
            LogEventKind::GridResourceUp { .. } => 25,
            LogEventKind::GridResourceDown { .. } => 26,
            LogEventKind::GridSubmit { .. } => 27,
            LogEventKind::Other(code) => *code,
        }
    }
}

/// One record of the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub id: CondorId,
    /// `MM/DD HH:MM:SS`, as written in the header line.
    pub timestamp: String,
    pub kind: LogEventKind,
}

impl LogEvent {
    /// Build an event stamped with the given unix time (UTC).
    pub fn at(id: CondorId, kind: LogEventKind, unix_secs: i64) -> Self {
        Self {
            id,
            timestamp: format_timestamp(unix_secs),
            kind,
        }
    }
}

pub(crate) fn format_timestamp(unix_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .unwrap_or_default()
        .format("%m/%d %H:%M:%S")
        .to_string()
}
