// src/grid/ad.rs

//! Job attribute store with dirty tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ProcId;

/// Well-known attribute names.
pub mod attr {
    pub const CLUSTER_ID: &str = "ClusterId";
    pub const PROC_ID: &str = "ProcId";
    pub const JOB_STATUS: &str = "JobStatus";
    pub const ENTERED_CURRENT_STATUS: &str = "EnteredCurrentStatus";
    pub const HOLD_REASON: &str = "HoldReason";
    pub const HOLD_REASON_CODE: &str = "HoldReasonCode";
    pub const HOLD_REASON_SUBCODE: &str = "HoldReasonSubCode";
    pub const RELEASE_REASON: &str = "ReleaseReason";
    pub const LAST_RELEASE_REASON: &str = "LastReleaseReason";
    pub const NUM_SYSTEM_HOLDS: &str = "NumSystemHolds";
    pub const REMOVE_REASON: &str = "RemoveReason";
    pub const JOB_STATUS_ON_RELEASE: &str = "JobStatusOnRelease";
    pub const GRID_RESOURCE: &str = "GridResource";
    pub const GRID_RESOURCE_FAILOVER: &str = "GridResourceFailover";
    pub const GRID_JOB_ID: &str = "GridJobId";
    pub const GRID_JOB_STATUS: &str = "GridJobStatus";
    pub const FAILOVER_ORPHAN_JOB_ID: &str = "FailoverOrphanJobId";
    pub const MANAGED: &str = "Managed";
    pub const EXIT_CODE: &str = "ExitCode";
    pub const EXIT_BY_SIGNAL: &str = "ExitBySignal";
    pub const EXIT_SIGNAL: &str = "ExitSignal";
    pub const USER_LOG: &str = "UserLog";
    pub const X509_USER_PROXY: &str = "x509userproxy";
    pub const X509_USER_PROXY_EXPIRATION: &str = "x509UserProxyExpiration";
    pub const NUM_GRID_SUBMITS: &str = "NumGridSubmits";
    pub const LAST_REMOTE_STATUS_UPDATE: &str = "LastRemoteStatusUpdate";
    pub const DELEGATED_PROXY_EXPIRATION: &str = "DelegatedProxyExpiration";
    pub const GRID_JOB_LIFETIME: &str = "GridJobLifetime";
    pub const PERIODIC_HOLD: &str = "PeriodicHold";
    pub const PERIODIC_RELEASE: &str = "PeriodicRelease";
    pub const PERIODIC_REMOVE: &str = "PeriodicRemove";
    pub const ON_EXIT_HOLD: &str = "OnExitHold";
    pub const ON_EXIT_REMOVE: &str = "OnExitRemove";
}

/// Values of the `Managed` attribute.
pub mod managed {
    /// The gridmanager owns the job.
    pub const EXTERNAL: &str = "External";
    /// Handed back to the schedd (held or idle).
    pub const SCHEDD: &str = "Schedd";
    /// Finished; never pick it up again.
    pub const DONE: &str = "Done";
}

/// One attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    #[serde(skip)]
    Undefined,
}

impl AdValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, AdValue::Undefined)
    }
}

impl fmt::Display for AdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdValue::Int(i) => write!(f, "{i}"),
            AdValue::Float(x) => write!(f, "{x}"),
            AdValue::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            AdValue::Str(s) => write!(f, "\"{s}\""),
            AdValue::Undefined => f.write_str("undefined"),
        }
    }
}

impl From<i64> for AdValue {
    fn from(v: i64) -> Self {
        AdValue::Int(v)
    }
}

impl From<i32> for AdValue {
    fn from(v: i32) -> Self {
        AdValue::Int(v.into())
    }
}

impl From<u32> for AdValue {
    fn from(v: u32) -> Self {
        AdValue::Int(v.into())
    }
}

impl From<f64> for AdValue {
    fn from(v: f64) -> Self {
        AdValue::Float(v)
    }
}

impl From<bool> for AdValue {
    fn from(v: bool) -> Self {
        AdValue::Bool(v)
    }
}

impl From<&str> for AdValue {
    fn from(v: &str) -> Self {
        AdValue::Str(v.to_string())
    }
}

impl From<String> for AdValue {
    fn from(v: String) -> Self {
        AdValue::Str(v)
    }
}

/// Local (queue-visible) job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalStatus {
    Idle,
    Running,
    Removed,
    Completed,
    Held,
}

impl LocalStatus {
    pub fn code(self) -> i64 {
        match self {
            LocalStatus::Idle => 1,
            LocalStatus::Running => 2,
            LocalStatus::Removed => 3,
            LocalStatus::Completed => 4,
            LocalStatus::Held => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(LocalStatus::Idle),
            2 => Some(LocalStatus::Running),
            3 => Some(LocalStatus::Removed),
            4 => Some(LocalStatus::Completed),
            5 => Some(LocalStatus::Held),
            _ => None,
        }
    }
}

impl fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocalStatus::Idle => "IDLE",
            LocalStatus::Running => "RUNNING",
            LocalStatus::Removed => "REMOVED",
            LocalStatus::Completed => "COMPLETED",
            LocalStatus::Held => "HELD",
        })
    }
}

/// Mutable attribute map that remembers which attributes changed since the
/// last flush to the queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobAd {
    attrs: BTreeMap<String, AdValue>,
    dirty: BTreeSet<String>,
}

impl JobAd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ad loaded from the queue: nothing is dirty.
    pub fn from_attrs(attrs: impl IntoIterator<Item = (String, AdValue)>) -> Self {
        Self {
            attrs: attrs.into_iter().collect(),
            dirty: BTreeSet::new(),
        }
    }

    /// Attribute lookup; names are case-insensitive.
    pub fn get(&self, name: &str) -> Option<&AdValue> {
        self.attrs.get(name).or_else(|| {
            self.attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            AdValue::Int(i) => Some(*i),
            AdValue::Float(f) => Some(*f as i64),
            AdValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            AdValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            AdValue::Bool(b) => Some(*b),
            AdValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Set an attribute, marking it dirty only if the value changed.
    pub fn set(&mut self, name: &str, value: impl Into<AdValue>) {
        let value = value.into();
        let key = self.key_for(name);
        if self.attrs.get(&key) == Some(&value) {
            return;
        }
        self.attrs.insert(key.clone(), value);
        self.dirty.insert(key);
    }

    pub fn set_undefined(&mut self, name: &str) {
        self.set(name, AdValue::Undefined);
    }

    fn key_for(&self, name: &str) -> String {
        if self.attrs.contains_key(name) {
            return name.to_string();
        }
        self.attrs
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(&self.key_for(name))
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Dirty attributes with their current values, clearing the flags.
    pub fn take_dirty(&mut self) -> Vec<(String, AdValue)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|k| self.attrs.get(&k).map(|v| (k, v.clone())))
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Dirty attributes with their current values; flags stay set.
    pub fn dirty_values(&self) -> Vec<(String, AdValue)> {
        self.dirty
            .iter()
            .filter_map(|k| self.attrs.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Clear the dirty flag of every attribute that still holds the value
    /// that was flushed. Attributes changed since then stay dirty.
    pub fn mark_clean(&mut self, flushed: &[(String, AdValue)]) {
        for (k, v) in flushed {
            if self.attrs.get(k) == Some(v) {
                self.dirty.remove(k);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AdValue)> {
        self.attrs.iter()
    }

    /// Cluster/proc taken from the ad.
    pub fn proc_id(&self) -> Option<ProcId> {
        Some(ProcId {
            cluster: self.get_int(attr::CLUSTER_ID)?,
            proc: self.get_int(attr::PROC_ID)?,
        })
    }

    pub fn local_status(&self) -> Option<LocalStatus> {
        self.get_int(attr::JOB_STATUS).and_then(LocalStatus::from_code)
    }

    /// Apply queue-side values without marking anything dirty.
    pub fn merge_clean(&mut self, updates: impl IntoIterator<Item = (String, AdValue)>) {
        for (k, v) in updates {
            let key = self.key_for(&k);
            self.attrs.insert(key, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_values_stay_clean() {
        let mut ad = JobAd::from_attrs([(attr::JOB_STATUS.to_string(), AdValue::Int(1))]);
        ad.set("jobstatus", 1);
        assert!(!ad.has_dirty());
        ad.set(attr::JOB_STATUS, 2);
        assert!(ad.is_dirty(attr::JOB_STATUS));
        assert_eq!(ad.take_dirty(), vec![(attr::JOB_STATUS.to_string(), AdValue::Int(2))]);
        assert!(!ad.has_dirty());
    }

    #[test]
    fn values_changed_during_a_flush_stay_dirty() {
        let mut ad = JobAd::new();
        ad.set(attr::GRID_JOB_STATUS, "IDLE");
        ad.set(attr::NUM_GRID_SUBMITS, 1);
        let flushed = ad.dirty_values();
        ad.set(attr::GRID_JOB_STATUS, "RUNNING");
        ad.mark_clean(&flushed);
        assert!(ad.is_dirty(attr::GRID_JOB_STATUS));
        assert!(!ad.is_dirty(attr::NUM_GRID_SUBMITS));
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let mut ad = JobAd::new();
        ad.set("GridResource", "condor schedd.example.org");
        assert_eq!(ad.get_str("gridresource"), Some("condor schedd.example.org"));
        ad.set("GRIDRESOURCE", "batch pbs");
        assert_eq!(ad.iter().count(), 1);
    }

    #[test]
    fn proc_id_needs_both_numbers() {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, 12);
        assert_eq!(ad.proc_id(), None);
        ad.set(attr::PROC_ID, 3);
        assert_eq!(ad.proc_id(), Some(ProcId { cluster: 12, proc: 3 }));
    }
}
