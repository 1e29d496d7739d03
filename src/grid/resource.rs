// src/grid/resource.rs

//! Per-endpoint admission control and liveness tracking.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info, warn};

use crate::types::ProcId;

use super::backend::BackendKind;

/// Identity of a remote resource: endpoint plus the credential used on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: BackendKind,
    pub endpoint: String,
    pub credential: Option<String>,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.endpoint)
    }
}

/// Up/down change reported by a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTransition {
    Up,
    Down,
}

/// Result of applying a ping reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingOutcome {
    pub transition: Option<ResourceTransition>,
    /// Jobs to re-evaluate: all registered jobs on a transition, else the
    /// jobs that asked for this ping.
    pub wake: Vec<ProcId>,
}

#[derive(Debug, Clone)]
pub struct RemoteResource {
    key: ResourceKey,
    max_submits: usize,
    submitting: BTreeSet<ProcId>,
    /// Jobs that asked for a slot while none was free.
    slot_waiters: BTreeSet<ProcId>,
    jobs: BTreeSet<ProcId>,
    ping_waiters: BTreeSet<ProcId>,
    ping_in_flight: bool,
    last_ping: Option<i64>,
    down: bool,
    state_known: bool,
    since: i64,
}

impl RemoteResource {
    pub fn new(key: ResourceKey, max_submits: usize, now: i64) -> Self {
        Self {
            key,
            max_submits: max_submits.max(1),
            submitting: BTreeSet::new(),
            slot_waiters: BTreeSet::new(),
            jobs: BTreeSet::new(),
            ping_waiters: BTreeSet::new(),
            ping_in_flight: false,
            last_ping: None,
            down: false,
            state_known: false,
            since: now,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn register_job(&mut self, job: ProcId) {
        self.jobs.insert(job);
    }

    /// Forget a job, releasing any slot it held. Returns jobs to wake.
    pub fn unregister_job(&mut self, job: ProcId) -> Vec<ProcId> {
        self.jobs.remove(&job);
        self.ping_waiters.remove(&job);
        self.slot_waiters.remove(&job);
        self.cancel_submit(job)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Reserve a submission slot. Idempotent for a job that already holds
    /// one; false means the caller must wait.
    pub fn request_submit(&mut self, job: ProcId) -> bool {
        if self.submitting.contains(&job) {
            return true;
        }
        if self.submitting.len() >= self.max_submits {
            self.slot_waiters.insert(job);
            debug!(resource = %self.key, job = %job, "no free submit slot");
            return false;
        }
        self.slot_waiters.remove(&job);
        self.submitting.insert(job);
        true
    }

    /// Release the slot after the submit RPC completed.
    pub fn submit_complete(&mut self, job: ProcId) -> Vec<ProcId> {
        self.release_slot(job)
    }

    /// Release the slot without a completed submission.
    pub fn cancel_submit(&mut self, job: ProcId) -> Vec<ProcId> {
        self.release_slot(job)
    }

    fn release_slot(&mut self, job: ProcId) -> Vec<ProcId> {
        if !self.submitting.remove(&job) {
            return Vec::new();
        }
        self.slot_waiters.iter().copied().collect()
    }

    pub fn submits_in_flight(&self) -> usize {
        self.submitting.len()
    }

    /// Ask for a liveness check. Returns true when a new ping must be
    /// sent; concurrent requests share one ping.
    pub fn request_ping(&mut self, job: ProcId, now: i64) -> bool {
        self.ping_waiters.insert(job);
        if self.ping_in_flight {
            return false;
        }
        self.ping_in_flight = true;
        self.last_ping = Some(now);
        true
    }

    /// Periodic re-ping of a down resource. Returns true when one is due.
    pub fn ping_due(&mut self, now: i64, interval: i64) -> bool {
        if !self.down || self.ping_in_flight {
            return false;
        }
        if self.last_ping.is_some_and(|t| now < t + interval) {
            return false;
        }
        self.ping_in_flight = true;
        self.last_ping = Some(now);
        true
    }

    pub fn ping_result(&mut self, up: bool, now: i64) -> PingOutcome {
        self.ping_in_flight = false;
        let waiters: Vec<ProcId> = std::mem::take(&mut self.ping_waiters).into_iter().collect();

        let transition = match (self.state_known, self.down, up) {
            (_, true, true) => Some(ResourceTransition::Up),
            (false, _, false) | (true, false, false) => Some(ResourceTransition::Down),
            _ => None,
        };
        self.state_known = true;

        match transition {
            Some(t) => {
                self.down = t == ResourceTransition::Down;
                self.since = now;
                match t {
                    ResourceTransition::Up => info!(resource = %self.key, "resource is back up"),
                    ResourceTransition::Down => warn!(resource = %self.key, "resource is down"),
                }
                PingOutcome {
                    transition: Some(t),
                    wake: self.jobs.iter().copied().collect(),
                }
            }
            None => PingOutcome {
                transition: None,
                wake: waiters,
            },
        }
    }

    pub fn is_down(&self) -> bool {
        self.down
    }

    /// Seconds the resource has been down, or `None` when it is up.
    pub fn down_for(&self, now: i64) -> Option<i64> {
        self.down.then(|| now - self.since)
    }
}

/// True when there is at least one resource and every one of them has
/// been down longer than `ceiling` seconds.
pub fn all_down_longer_than<'a>(
    resources: impl IntoIterator<Item = &'a RemoteResource>,
    now: i64,
    ceiling: i64,
) -> bool {
    let mut any = false;
    for r in resources {
        any = true;
        if !r.down_for(now).is_some_and(|d| d > ceiling) {
            return false;
        }
    }
    any
}
