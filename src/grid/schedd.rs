// src/grid/schedd.rs

//! Coalescing of job queue updates into batched flushes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::ProcId;

/// One flush in progress: job and the highest request id it carries.
pub type Batch = Vec<(ProcId, u64)>;

/// Tracks which jobs need their queue row written and which update
/// requests have been committed.
///
/// Jobs ask `request(proc, request_id)` and proceed only once it returns
/// true, i.e. once a flush carrying that request id has committed.
#[derive(Debug, Clone)]
pub struct ScheddUpdater {
    contact_delay: i64,
    pending: BTreeMap<ProcId, u64>,
    in_flight: Option<Batch>,
    committed: HashMap<ProcId, u64>,
    first_pending_at: Option<i64>,
    last_contact: Option<i64>,
    requests: HashMap<ProcId, BTreeSet<u64>>,
}

impl ScheddUpdater {
    pub fn new(contact_delay_secs: u64) -> Self {
        Self {
            contact_delay: contact_delay_secs as i64,
            pending: BTreeMap::new(),
            in_flight: None,
            committed: HashMap::new(),
            first_pending_at: None,
            last_contact: None,
            requests: HashMap::new(),
        }
    }

    fn mark_pending(&mut self, proc: ProcId, request_id: u64, now: i64) {
        let slot = self.pending.entry(proc).or_insert(0);
        *slot = (*slot).max(request_id);
        self.first_pending_at.get_or_insert(now);
    }

    /// Schedule a flush of `proc` without waiting on it.
    pub fn enqueue(&mut self, proc: ProcId, now: i64) {
        self.mark_pending(proc, 0, now);
    }

    fn in_flight_for(&self, proc: ProcId) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|b| b.iter().any(|(p, _)| *p == proc))
    }

    /// Ask for an update carrying `request_id`. Returns true once one has
    /// committed. With no local work and nothing queued or in flight for
    /// the job it returns true immediately.
    pub fn request(&mut self, proc: ProcId, request_id: u64, has_work: bool, now: i64) -> bool {
        if self.committed.get(&proc).is_some_and(|c| *c >= request_id) {
            return true;
        }
        if !has_work && !self.pending.contains_key(&proc) && !self.in_flight_for(proc) {
            return true;
        }
        self.requests.entry(proc).or_default().insert(request_id);
        self.mark_pending(proc, request_id, now);
        false
    }

    /// Number of distinct update requests `proc` has made.
    pub fn request_count(&self, proc: ProcId) -> usize {
        self.requests.get(&proc).map_or(0, BTreeSet::len)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.in_flight.is_some()
    }

    pub fn is_pending(&self, proc: ProcId) -> bool {
        self.pending.contains_key(&proc) || self.in_flight_for(proc)
    }

    /// Start a flush when one is due: nothing in flight, work queued, the
    /// coalescing delay since the first queued job has passed, and the
    /// minimum spacing since the last contact has passed.
    pub fn take_batch(&mut self, now: i64) -> Option<Batch> {
        if self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        if self
            .first_pending_at
            .is_some_and(|t| now < t + self.contact_delay)
        {
            return None;
        }
        if self
            .last_contact
            .is_some_and(|t| now < t + self.contact_delay)
        {
            return None;
        }
        let batch: Batch = std::mem::take(&mut self.pending).into_iter().collect();
        self.first_pending_at = None;
        self.last_contact = Some(now);
        self.in_flight = Some(batch.clone());
        Some(batch)
    }

    /// The in-flight flush committed. Returns the jobs it carried.
    pub fn commit(&mut self) -> Vec<ProcId> {
        let Some(batch) = self.in_flight.take() else {
            return Vec::new();
        };
        batch
            .into_iter()
            .map(|(proc, id)| {
                let c = self.committed.entry(proc).or_insert(0);
                *c = (*c).max(id);
                proc
            })
            .collect()
    }

    /// The in-flight flush failed; its jobs are queued again.
    pub fn fail(&mut self, now: i64) {
        if let Some(batch) = self.in_flight.take() {
            for (proc, id) in batch {
                self.mark_pending(proc, id, now);
            }
        }
    }

    /// Drop all state for a destroyed job.
    pub fn forget(&mut self, proc: ProcId) {
        self.pending.remove(&proc);
        self.committed.remove(&proc);
        self.requests.remove(&proc);
        if self.pending.is_empty() {
            self.first_pending_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_completes_after_commit() {
        let mut s = ScheddUpdater::new(5);
        let job = ProcId::new(17, 0);
        assert!(!s.request(job, 3, true, 100));
        assert!(!s.request(job, 3, true, 101));
        assert_eq!(s.request_count(job), 1);

        assert_eq!(s.take_batch(102), None);
        assert_eq!(s.take_batch(105), Some(vec![(job, 3)]));
        assert!(!s.request(job, 3, true, 106));
        assert_eq!(s.commit(), vec![job]);
        assert!(s.request(job, 3, true, 107));
        assert!(!s.request(job, 4, true, 107));
    }

    #[test]
    fn nothing_to_do_returns_immediately() {
        let mut s = ScheddUpdater::new(5);
        let job = ProcId::new(1, 0);
        assert!(s.request(job, 9, false, 0));
        s.enqueue(job, 0);
        assert!(!s.request(job, 9, false, 0));
    }

    #[test]
    fn failed_flush_is_retried_after_spacing() {
        let mut s = ScheddUpdater::new(5);
        let job = ProcId::new(1, 0);
        s.request(job, 2, true, 0);
        assert!(s.take_batch(5).is_some());
        s.fail(6);
        assert_eq!(s.take_batch(9), None);
        assert_eq!(s.take_batch(11), Some(vec![(job, 2)]));
    }
}
