// src/grid/dispatcher.rs

//! Owner of every managed job and remote resource.
//!
//! The dispatcher turns queue snapshots into jobs, routes RPC replies,
//! pings and callbacks to them, evaluates the ones that have something to
//! do, and batches their attribute changes and event-log records into
//! queue flushes. It never performs IO; everything it needs done comes
//! back as [`GridCommand`]s.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::config::GridmanagerSection;
use crate::types::ProcId;
use crate::userlog::LogEvent;

use super::ad::{attr, managed, AdValue, JobAd, LocalStatus};
use super::backend::{BackendKind, RemoteStatus, RpcReply};
use super::callbacks::OrphanCallbacks;
use super::credential::CredentialCache;
use super::job::{JobContext, JobStateMachine, HOLD_CODE_GRIDMANAGER};
use super::queue::{QueueSnapshot, QueueUpdate};
use super::resource::{all_down_longer_than, RemoteResource, ResourceKey};
use super::schedd::ScheddUpdater;
use super::{FlushBatch, GridCommand, RpcRequest, EXIT_NO_JOBS};

/// What an in-flight flush carried for one job.
#[derive(Debug, Clone)]
struct FlushedJob {
    proc: ProcId,
    set: Vec<(String, AdValue)>,
    events: Vec<LogEvent>,
}

#[derive(Debug, Clone, Default)]
struct InFlightFlush {
    jobs: Vec<FlushedJob>,
    direct: Vec<QueueUpdate>,
}

#[derive(Debug)]
pub struct GridManagerDispatcher {
    cfg: GridmanagerSection,
    jobs: BTreeMap<ProcId, JobStateMachine>,
    resources: BTreeMap<ResourceKey, RemoteResource>,
    job_resource: HashMap<ProcId, ResourceKey>,
    by_remote_id: HashMap<String, ProcId>,
    job_remote_id: HashMap<ProcId, String>,
    schedd: ScheddUpdater,
    credentials: CredentialCache,
    orphans: OrphanCallbacks,
    /// Jobs to evaluate on the next pass.
    ready: BTreeSet<ProcId>,
    wake_at: HashMap<ProcId, i64>,
    /// Queue updates for jobs that could not be managed at all.
    direct: Vec<QueueUpdate>,
    in_flight: Option<InFlightFlush>,
    first_contact: bool,
    query_in_flight: bool,
    query_now: bool,
    last_query: Option<i64>,
    last_periodic: Option<i64>,
    escalated_at: Option<i64>,
}

impl GridManagerDispatcher {
    pub fn new(cfg: GridmanagerSection) -> Self {
        let schedd = ScheddUpdater::new(cfg.contact_schedd_delay_secs);
        Self {
            cfg,
            jobs: BTreeMap::new(),
            resources: BTreeMap::new(),
            job_resource: HashMap::new(),
            by_remote_id: HashMap::new(),
            job_remote_id: HashMap::new(),
            schedd,
            credentials: CredentialCache::new(),
            orphans: OrphanCallbacks::new(),
            ready: BTreeSet::new(),
            wake_at: HashMap::new(),
            direct: Vec::new(),
            in_flight: None,
            first_contact: true,
            query_in_flight: false,
            query_now: true,
            last_query: None,
            last_periodic: None,
            escalated_at: None,
        }
    }

    pub fn config(&self) -> &GridmanagerSection {
        &self.cfg
    }

    pub fn job(&self, proc: ProcId) -> Option<&JobStateMachine> {
        self.jobs.get(&proc)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobStateMachine> {
        self.jobs.values()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&RemoteResource> {
        self.resources.get(key)
    }

    pub fn schedd(&self) -> &ScheddUpdater {
        &self.schedd
    }

    pub fn orphan_callbacks(&self) -> usize {
        self.orphans.len()
    }

    // ---- events ----------------------------------------------------------

    pub fn start(&mut self, now: i64) -> Vec<GridCommand> {
        info!("gridmanager dispatcher started");
        let mut cmds = Vec::new();
        self.maybe_query(now, &mut cmds);
        cmds
    }

    pub fn tick(&mut self, now: i64) -> Vec<GridCommand> {
        let mut cmds = Vec::new();

        let due: Vec<ProcId> = self
            .wake_at
            .iter()
            .filter(|(_, t)| **t <= now)
            .map(|(p, _)| *p)
            .collect();
        for proc in due {
            self.wake_at.remove(&proc);
            self.ready.insert(proc);
        }

        let interval = self.cfg.periodic_expr_interval_secs as i64;
        if self.last_periodic.is_none_or(|t| now >= t + interval) {
            self.last_periodic = Some(now);
            for (proc, job) in self.jobs.iter_mut() {
                if job.eval_periodic_policy(now) {
                    self.ready.insert(*proc);
                }
            }
        }

        self.drain_orphans(now);
        self.ping_down_resources(now, &mut cmds);
        self.maybe_escalate(now, &mut cmds);
        self.maybe_query(now, &mut cmds);
        self.run_ready(now, &mut cmds);
        self.maybe_flush(now, &mut cmds);
        cmds
    }

    pub fn on_rpc_reply(
        &mut self,
        proc: ProcId,
        seq: u64,
        reply: RpcReply,
        now: i64,
    ) -> Vec<GridCommand> {
        match self.jobs.get_mut(&proc) {
            Some(job) => {
                if job.deliver_reply(seq, reply) {
                    self.ready.insert(proc);
                }
            }
            None => debug!(job = %proc, seq, "rpc reply for a job that is gone"),
        }
        self.settle(now)
    }

    pub fn on_ping(&mut self, key: &ResourceKey, up: bool, now: i64) -> Vec<GridCommand> {
        let Some(resource) = self.resources.get_mut(key) else {
            debug!(resource = %key, "ping result for an unknown resource");
            return Vec::new();
        };
        let outcome = resource.ping_result(up, now);
        for proc in outcome.wake {
            if let (Some(t), Some(job)) = (outcome.transition, self.jobs.get_mut(&proc)) {
                job.resource_changed(t, now);
                self.schedd.enqueue(proc, now);
            }
            self.ready.insert(proc);
        }
        self.settle(now)
    }

    pub fn on_callback(
        &mut self,
        remote_id: String,
        status: RemoteStatus,
        now: i64,
    ) -> Vec<GridCommand> {
        match self.by_remote_id.get(&remote_id).copied() {
            Some(proc) => self.deliver_callback(proc, status),
            None => self.orphans.push(remote_id, status, now),
        }
        self.settle(now)
    }

    fn deliver_callback(&mut self, proc: ProcId, status: RemoteStatus) {
        if let Some(job) = self.jobs.get_mut(&proc) {
            if job.callback(status) {
                self.ready.insert(proc);
            }
        }
    }

    pub fn on_snapshot(&mut self, snapshot: QueueSnapshot, now: i64) -> Vec<GridCommand> {
        self.query_in_flight = false;
        self.first_contact = false;
        self.last_query = Some(now);

        for (path, expiration) in snapshot.proxy_expirations {
            for proc in self.credentials.update(&path, expiration) {
                if let Some(job) = self.jobs.get_mut(&proc) {
                    job.credential_updated();
                    self.ready.insert(proc);
                }
            }
        }

        for status in snapshot.statuses {
            if let Some(job) = self.jobs.get_mut(&status.proc) {
                if job.queue_status(status.status, status.reason.as_deref()) {
                    self.ready.insert(status.proc);
                }
            }
        }

        for ad in snapshot.new_jobs {
            self.adopt(ad, now);
        }

        let mut cmds = self.settle(now);
        if self.jobs.is_empty() && self.idle() {
            info!("no jobs left to manage; shutting down");
            cmds.push(GridCommand::Shutdown {
                exit_code: EXIT_NO_JOBS,
            });
        }
        cmds
    }

    pub fn on_query_failed(&mut self, message: &str, now: i64) -> Vec<GridCommand> {
        warn!("job queue query failed: {message}");
        self.query_in_flight = false;
        self.last_query = Some(now);
        Vec::new()
    }

    pub fn on_committed(&mut self, now: i64) -> Vec<GridCommand> {
        let committed = self.schedd.commit();
        if let Some(flush) = self.in_flight.take() {
            for flushed in flush.jobs {
                if let Some(job) = self.jobs.get_mut(&flushed.proc) {
                    job.ad_mut().mark_clean(&flushed.set);
                }
            }
            for update in flush.direct {
                self.schedd.forget(update.proc);
            }
        }
        for proc in committed {
            if self.jobs.contains_key(&proc) {
                self.ready.insert(proc);
            }
        }
        let cmds = self.settle(now);
        if self.jobs.is_empty() && self.idle() {
            self.query_now = true;
        }
        cmds
    }

    pub fn on_commit_failed(&mut self, message: &str, now: i64) -> Vec<GridCommand> {
        warn!("job queue update failed: {message}");
        if let Some(flush) = self.in_flight.take() {
            for flushed in flush.jobs {
                if let Some(job) = self.jobs.get_mut(&flushed.proc) {
                    job.requeue_events(flushed.events);
                }
            }
            let mut direct = flush.direct;
            direct.append(&mut self.direct);
            self.direct = direct;
        }
        self.schedd.fail(now);
        Vec::new()
    }

    // ---- internals -------------------------------------------------------

    fn idle(&self) -> bool {
        !self.schedd.has_pending() && self.in_flight.is_none() && self.direct.is_empty()
    }

    /// Evaluate ready jobs and start a flush if one is due.
    fn settle(&mut self, now: i64) -> Vec<GridCommand> {
        let mut cmds = Vec::new();
        self.run_ready(now, &mut cmds);
        self.maybe_flush(now, &mut cmds);
        cmds
    }

    fn adopt(&mut self, ad: JobAd, now: i64) {
        let Some(proc) = ad.proc_id() else {
            warn!("ignoring queue row without ClusterId/ProcId");
            return;
        };
        if self.jobs.contains_key(&proc) {
            return;
        }
        let proxy_expiration = ad.get_int(attr::X509_USER_PROXY_EXPIRATION);
        match JobStateMachine::new(ad) {
            Ok(job) => {
                let key = job.resource_key();
                info!(job = %proc, resource = %key, "managing job");
                if let Some(path) = job.proxy_path() {
                    self.credentials.register(path, proc, proxy_expiration);
                }
                self.register_on(proc, key, now);
                self.jobs.insert(proc, job);
                self.ready.insert(proc);
            }
            Err(reason) => {
                warn!(job = %proc, reason, "cannot manage job; holding it");
                self.direct.push(QueueUpdate {
                    proc,
                    set: vec![
                        (
                            attr::JOB_STATUS.to_string(),
                            AdValue::Int(LocalStatus::Held.code()),
                        ),
                        (attr::HOLD_REASON.to_string(), reason.into()),
                        (
                            attr::HOLD_REASON_CODE.to_string(),
                            AdValue::Int(HOLD_CODE_GRIDMANAGER),
                        ),
                        (attr::ENTERED_CURRENT_STATUS.to_string(), now.into()),
                        (attr::MANAGED.to_string(), managed::SCHEDD.into()),
                    ],
                    delete: false,
                });
                self.schedd.enqueue(proc, now);
            }
        }
    }

    fn register_on(&mut self, proc: ProcId, key: ResourceKey, now: i64) {
        let max_submits = self.cfg.max_submits_per_resource;
        self.resources
            .entry(key.clone())
            .or_insert_with(|| RemoteResource::new(key.clone(), max_submits, now))
            .register_job(proc);
        self.job_resource.insert(proc, key);
    }

    fn unregister(&mut self, proc: ProcId) {
        let Some(key) = self.job_resource.remove(&proc) else {
            return;
        };
        let Some(resource) = self.resources.get_mut(&key) else {
            return;
        };
        self.ready.extend(resource.unregister_job(proc));
        if resource.job_count() == 0 {
            debug!(resource = %key, "resource has no jobs left");
            self.resources.remove(&key);
        }
    }

    fn run_ready(&mut self, now: i64, cmds: &mut Vec<GridCommand>) {
        while let Some(proc) = self.ready.pop_first() {
            self.evaluate(proc, now, cmds);
        }
    }

    fn evaluate(&mut self, proc: ProcId, now: i64, cmds: &mut Vec<GridCommand>) {
        let Some(job) = self.jobs.get_mut(&proc) else {
            return;
        };
        let Some(key) = self.job_resource.get(&proc).cloned() else {
            warn!(job = %proc, "job has no resource");
            return;
        };
        let max_submits = self.cfg.max_submits_per_resource;
        let resource = self
            .resources
            .entry(key.clone())
            .or_insert_with(|| RemoteResource::new(key.clone(), max_submits, now));

        let mut ctx = JobContext {
            now,
            cfg: &self.cfg,
            resource: &mut *resource,
            schedd: &mut self.schedd,
            credentials: &self.credentials,
        };
        let eval = job.evaluate(&mut ctx);

        if let Some(rpc) = eval.rpc {
            cmds.push(GridCommand::Rpc(RpcRequest {
                proc,
                seq: rpc.seq,
                kind: key.kind,
                endpoint: key.endpoint.clone(),
                op: rpc.op,
            }));
        }
        if eval.ping && resource.request_ping(proc, now) {
            debug!(job = %proc, resource = %key, "pinging resource");
            cmds.push(GridCommand::Ping { key: key.clone() });
        }
        match eval.wake_at {
            Some(t) => {
                self.wake_at.insert(proc, t);
            }
            None => {
                self.wake_at.remove(&proc);
            }
        }

        if job.ad().has_dirty() || job.has_events() {
            self.schedd.enqueue(proc, now);
        }

        let remote_id = job.remote_id().map(str::to_string);
        let moved_to = eval.moved.then(|| job.resource_key());
        self.ready.extend(eval.wake);
        self.sync_remote_id(proc, remote_id);

        if let Some(new_key) = moved_to {
            self.unregister(proc);
            self.register_on(proc, new_key, now);
            self.ready.insert(proc);
        }
        if eval.finished {
            self.destroy(proc);
        }
    }

    fn sync_remote_id(&mut self, proc: ProcId, remote_id: Option<String>) {
        if self.job_remote_id.get(&proc) == remote_id.as_ref() {
            return;
        }
        if let Some(old) = self.job_remote_id.remove(&proc) {
            self.by_remote_id.remove(&old);
        }
        if let Some(id) = remote_id {
            self.by_remote_id.insert(id.clone(), proc);
            self.job_remote_id.insert(proc, id);
        }
    }

    fn destroy(&mut self, proc: ProcId) {
        let Some(job) = self.jobs.remove(&proc) else {
            return;
        };
        info!(job = %proc, status = %job.local_status(), "job no longer managed");
        if let Some(path) = job.proxy_path() {
            self.credentials.unregister(path, proc);
        }
        self.unregister(proc);
        self.sync_remote_id(proc, None);
        self.schedd.forget(proc);
        self.wake_at.remove(&proc);
        self.ready.remove(&proc);
        if self.jobs.is_empty() {
            self.query_now = true;
        }
    }

    fn drain_orphans(&mut self, now: i64) {
        if self.orphans.is_empty() {
            return;
        }
        let known = &self.by_remote_id;
        for cb in self.orphans.drain_known(|id| known.contains_key(id)) {
            if let Some(proc) = self.by_remote_id.get(&cb.remote_id).copied() {
                self.deliver_callback(proc, cb.status);
            }
        }
        self.orphans
            .expire(now, self.cfg.orphan_callback_window_secs as i64);
    }

    fn ping_down_resources(&mut self, now: i64, cmds: &mut Vec<GridCommand>) {
        let interval = self.cfg.probe_interval_secs as i64;
        for (key, resource) in self.resources.iter_mut() {
            if resource.ping_due(now, interval) {
                cmds.push(GridCommand::Ping { key: key.clone() });
            }
        }
    }

    fn maybe_escalate(&mut self, now: i64, cmds: &mut Vec<GridCommand>) {
        let ceiling = self.cfg.max_time_down_resources_secs as i64;
        if !all_down_longer_than(self.resources.values(), now, ceiling) {
            self.escalated_at = None;
            return;
        }
        if self.escalated_at.is_some_and(|t| now < t + ceiling) {
            return;
        }
        self.escalated_at = Some(now);
        let kinds: BTreeSet<BackendKind> = self.resources.keys().map(|k| k.kind).collect();
        warn!(
            resources = self.resources.len(),
            "every resource has been down too long; restarting helpers"
        );
        cmds.push(GridCommand::RestartHelpers(kinds.into_iter().collect()));
    }

    fn maybe_query(&mut self, now: i64, cmds: &mut Vec<GridCommand>) {
        if self.query_in_flight {
            return;
        }
        let interval = self.cfg.schedd_poll_interval_secs as i64;
        let due = self.query_now || self.last_query.is_none_or(|t| now >= t + interval);
        if !due {
            return;
        }
        self.query_now = false;
        self.query_in_flight = true;
        cmds.push(GridCommand::QueryQueue {
            first_contact: self.first_contact,
        });
    }

    fn maybe_flush(&mut self, now: i64, cmds: &mut Vec<GridCommand>) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(batch) = self.schedd.take_batch(now) else {
            return;
        };

        let direct = std::mem::take(&mut self.direct);
        let mut updates = direct.clone();
        let mut events = Vec::new();
        let mut flushed = Vec::new();

        for (proc, _) in batch {
            let Some(job) = self.jobs.get_mut(&proc) else {
                continue;
            };
            let set = job.ad().dirty_values();
            let job_events = job.take_events();
            match job.user_log() {
                Some(path) => {
                    events.extend(job_events.iter().map(|e| (path.clone(), e.clone())))
                }
                None if !job_events.is_empty() => {
                    debug!(job = %proc, count = job_events.len(), "job has no user log; events not written")
                }
                None => {}
            }
            updates.push(QueueUpdate {
                proc,
                set: set.clone(),
                delete: job.delete_requested(),
            });
            flushed.push(FlushedJob {
                proc,
                set,
                events: job_events,
            });
        }

        debug!(
            updates = updates.len(),
            events = events.len(),
            "flushing job queue updates"
        );
        self.in_flight = Some(InFlightFlush {
            jobs: flushed,
            direct,
        });
        cmds.push(GridCommand::Flush(FlushBatch { updates, events }));
    }
}
