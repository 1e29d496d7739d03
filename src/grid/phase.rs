// src/grid/phase.rs

//! Job phases, remote states and the "already logged" event set.

use std::fmt;
use std::str::FromStr;

/// Gridmanager-internal phase of one job. One enum covers every backend;
/// a backend simply never enters the phases its capabilities exclude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Init,
    Start,
    Register,
    RecoverQuery,
    Unsubmitted,
    Submit,
    SubmitSave,
    SubmitCommit,
    StageIn,
    Submitted,
    Probe,
    RefreshProxy,
    ExtendLifetime,
    HoldRemote,
    ReleaseRemote,
    StageOut,
    DoneSave,
    DoneCommit,
    Cancel,
    Failed,
    Delete,
    ClearRequest,
    Hold,
    ProxyExpired,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Init => "INIT",
            JobPhase::Start => "START",
            JobPhase::Register => "REGISTER",
            JobPhase::RecoverQuery => "RECOVER_QUERY",
            JobPhase::Unsubmitted => "UNSUBMITTED",
            JobPhase::Submit => "SUBMIT",
            JobPhase::SubmitSave => "SUBMIT_SAVE",
            JobPhase::SubmitCommit => "SUBMIT_COMMIT",
            JobPhase::StageIn => "STAGE_IN",
            JobPhase::Submitted => "SUBMITTED",
            JobPhase::Probe => "PROBE",
            JobPhase::RefreshProxy => "REFRESH_PROXY",
            JobPhase::ExtendLifetime => "EXTEND_LIFETIME",
            JobPhase::HoldRemote => "HOLD_REMOTE",
            JobPhase::ReleaseRemote => "RELEASE_REMOTE",
            JobPhase::StageOut => "STAGE_OUT",
            JobPhase::DoneSave => "DONE_SAVE",
            JobPhase::DoneCommit => "DONE_COMMIT",
            JobPhase::Cancel => "CANCEL",
            JobPhase::Failed => "FAILED",
            JobPhase::Delete => "DELETE",
            JobPhase::ClearRequest => "CLEAR_REQUEST",
            JobPhase::Hold => "HOLD",
            JobPhase::ProxyExpired => "PROXY_EXPIRED",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state as reported by the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    Unsubmitted,
    Pending,
    Idle,
    Running,
    Suspended,
    Held,
    Completed,
    Failed,
    Removed,
    Unknown,
}

impl RemoteState {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteState::Unsubmitted => "UNSUBMITTED",
            RemoteState::Pending => "PENDING",
            RemoteState::Idle => "IDLE",
            RemoteState::Running => "RUNNING",
            RemoteState::Suspended => "SUSPENDED",
            RemoteState::Held => "HELD",
            RemoteState::Completed => "COMPLETED",
            RemoteState::Failed => "FAILED",
            RemoteState::Removed => "REMOVED",
            RemoteState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "UNSUBMITTED" => RemoteState::Unsubmitted,
            "PENDING" | "QUEUED" | "STAGE_IN" => RemoteState::Pending,
            "IDLE" => RemoteState::Idle,
            "RUNNING" | "ACTIVE" => RemoteState::Running,
            "SUSPENDED" => RemoteState::Suspended,
            "HELD" => RemoteState::Held,
            "COMPLETED" | "DONE" | "FINISHED" => RemoteState::Completed,
            "FAILED" => RemoteState::Failed,
            "REMOVED" | "CANCELLED" | "KILLED" => RemoteState::Removed,
            "UNKNOWN" => RemoteState::Unknown,
            other => return Err(format!("unknown remote state '{other}'")),
        })
    }
}

/// Event kinds that may be written at most once per submission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoggedEvent {
    Submit,
    Execute,
    Terminate,
    Abort,
    Evict,
    Hold,
}

impl LoggedEvent {
    fn bit(self) -> u8 {
        match self {
            LoggedEvent::Submit => 1,
            LoggedEvent::Execute => 1 << 1,
            LoggedEvent::Terminate => 1 << 2,
            LoggedEvent::Abort => 1 << 3,
            LoggedEvent::Evict => 1 << 4,
            LoggedEvent::Hold => 1 << 5,
        }
    }
}

/// Set of event kinds already written for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub fn contains(&self, kind: LoggedEvent) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Mark `kind` as written. Returns false if it already was.
    pub fn insert(&mut self, kind: LoggedEvent) -> bool {
        let fresh = !self.contains(kind);
        self.0 |= kind.bit();
        fresh
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}
