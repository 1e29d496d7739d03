// src/grid/credential.rs

//! Proxy credential cache shared by every job using the same proxy file.

use std::collections::{BTreeSet, HashMap};

use crate::types::ProcId;

#[derive(Debug, Clone, Default)]
struct Entry {
    expiration: Option<i64>,
    users: BTreeSet<ProcId>,
}

/// Expiration times of proxy files, and which jobs use each one.
///
/// Jobs hold only the proxy path; the cache owns the lifetime data.
#[derive(Debug, Clone, Default)]
pub struct CredentialCache {
    entries: HashMap<String, Entry>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: &str, job: ProcId, expiration: Option<i64>) {
        let entry = self.entries.entry(path.to_string()).or_default();
        entry.users.insert(job);
        if let Some(exp) = expiration {
            if entry.expiration.is_none_or(|cur| exp > cur) {
                entry.expiration = Some(exp);
            }
        }
    }

    pub fn unregister(&mut self, path: &str, job: ProcId) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.users.remove(&job);
            if entry.users.is_empty() {
                self.entries.remove(path);
            }
        }
    }

    pub fn expiration(&self, path: &str) -> Option<i64> {
        self.entries.get(path).and_then(|e| e.expiration)
    }

    /// Record a new expiration. Returns the jobs to wake when it moved
    /// forward; an older or equal value changes nothing.
    pub fn update(&mut self, path: &str, expiration: i64) -> Vec<ProcId> {
        let Some(entry) = self.entries.get_mut(path) else {
            return Vec::new();
        };
        if entry.expiration.is_some_and(|cur| expiration <= cur) {
            return Vec::new();
        }
        entry.expiration = Some(expiration);
        entry.users.iter().copied().collect()
    }

    /// True when the proxy expires within `min_lifetime` seconds of `now`.
    /// An unknown expiration counts as expired.
    pub fn near_expiry(&self, path: &str, now: i64, min_lifetime: i64) -> bool {
        match self.expiration(path) {
            Some(exp) => exp < now + min_lifetime,
            None => true,
        }
    }
}
