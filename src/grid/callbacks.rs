// src/grid/callbacks.rs

//! Status callbacks that arrived before their job was known.

use std::collections::VecDeque;

use tracing::debug;

use super::backend::RemoteStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct OrphanCallback {
    pub remote_id: String,
    pub status: RemoteStatus,
    pub received: i64,
}

/// Queue of callbacks for unknown remote ids, retried on every tick for
/// a bounded window.
#[derive(Debug, Clone, Default)]
pub struct OrphanCallbacks {
    entries: VecDeque<OrphanCallback>,
}

impl OrphanCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, remote_id: String, status: RemoteStatus, now: i64) {
        debug!(remote_id, "queueing callback for unknown job");
        self.entries.push_back(OrphanCallback {
            remote_id,
            status,
            received: now,
        });
    }

    /// Remove and return, in arrival order, every entry whose remote id
    /// `is_known` accepts.
    pub fn drain_known(&mut self, is_known: impl Fn(&str) -> bool) -> Vec<OrphanCallback> {
        let (known, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|cb| is_known(&cb.remote_id));
        self.entries = rest;
        known.into()
    }

    /// Drop entries older than `window` seconds. Returns how many.
    pub fn expire(&mut self, now: i64, window: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|cb| now - cb.received <= window);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, "dropped callbacks for jobs that never appeared");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
