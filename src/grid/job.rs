// src/grid/job.rs

//! One managed remote job: local status transitions plus the shared
//! phase machine that drives it through submission, execution and
//! completion on any backend.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::GridmanagerSection;
use crate::types::ProcId;
use crate::userlog::{LogEvent, LogEventKind, Termination};

use super::ad::{attr, managed, AdValue, JobAd, LocalStatus};
use super::backend::{submit_description, BackendKind, Capabilities, RemoteOp, RemoteStatus, RpcReply};
use super::credential::CredentialCache;
use super::phase::{EventSet, JobPhase, LoggedEvent, RemoteState};
use super::policy::{
    eval_on_exit, eval_periodic, PolicyVerdict, HOLD_CODE_JOB_POLICY,
    HOLD_CODE_JOB_POLICY_UNDEFINED,
};
use super::resource::{RemoteResource, ResourceKey, ResourceTransition};
use super::schedd::ScheddUpdater;

/// Upper bound on transitions applied by one `evaluate` call.
const MAX_EVALUATE_STEPS: usize = 64;
/// Delay before retrying an RPC whose resource could not be contacted.
const CONNECT_RETRY_SECS: i64 = 5;
/// Connection failures tolerated before asking the resource for a ping.
const MAX_CONNECT_FAILURES: u32 = 3;

/// Hold code for holds the gridmanager decides on.
pub const HOLD_CODE_GRIDMANAGER: i64 = 0;

/// Shared state a job needs while it evaluates.
pub struct JobContext<'a> {
    pub now: i64,
    pub cfg: &'a GridmanagerSection,
    pub resource: &'a mut RemoteResource,
    pub schedd: &'a mut ScheddUpdater,
    pub credentials: &'a CredentialCache,
}

/// RPC issued by an evaluation; its reply must come back with `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRpc {
    pub seq: u64,
    pub op: RemoteOp,
}

/// What one evaluation asks of the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub rpc: Option<IssuedRpc>,
    /// Evaluate again at this time.
    pub wake_at: Option<i64>,
    /// The resource looks unreachable; ask for a ping.
    pub ping: bool,
    /// Other jobs to evaluate (freed submit slots).
    pub wake: Vec<ProcId>,
    /// The final queue update committed; the job can be destroyed.
    pub finished: bool,
    /// The job switched resources and must be re-registered.
    pub moved: bool,
}

impl Evaluation {
    fn wake_at(&mut self, t: i64) {
        self.wake_at = Some(self.wake_at.map_or(t, |cur| cur.min(t)));
    }
}

#[derive(Debug, Clone)]
struct PendingRpc {
    seq: u64,
    reply: Option<RpcReply>,
}

enum Poll {
    Ready(RpcReply),
    Wait,
}

fn is_already_gone(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("job not found") || msg.contains("already done")
}

fn describe(reply: &RpcReply) -> String {
    match reply {
        RpcReply::Error(msg) | RpcReply::Unreachable(msg) => msg.clone(),
        RpcReply::Gone => "Job not found on the remote resource".to_string(),
        RpcReply::Ok { .. } => "Unexpected reply from the remote resource".to_string(),
        RpcReply::Status(_) => "Unexpected status reply from the remote resource".to_string(),
    }
}

/// State machine for one remote job.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    proc: ProcId,
    ad: JobAd,
    kind: BackendKind,
    caps: Capabilities,
    endpoint: String,
    phase: JobPhase,
    /// Bumped on every phase change; doubles as the queue update request id.
    epoch: u64,
    local: LocalStatus,
    remote_state: RemoteState,
    remote_id: Option<String>,
    error: Option<String>,
    proxy_path: Option<String>,

    last_submit_attempt: Option<i64>,
    num_submit_attempts: u32,
    requested_lifetime: Option<i64>,
    lifetime_until: Option<i64>,
    last_proxy_refresh: Option<i64>,
    last_remove_attempt: Option<i64>,

    last_probe: Option<i64>,
    probe_now: bool,
    last_status_time: Option<i64>,
    new_status: Option<RemoteStatus>,
    exit_code: Option<i32>,

    pending: Option<PendingRpc>,
    next_seq: u64,
    connect_failures: u32,
    retry_at: Option<i64>,

    logged: EventSet,
    events: Vec<LogEvent>,
    failover_to: Option<String>,
    exit_applied: bool,
    clear_applied: bool,
    done_applied: bool,
    delete_from_queue: bool,
}

impl JobStateMachine {
    /// Take over a job from the queue. Errors carry the hold reason for
    /// jobs that cannot be managed at all.
    pub fn new(mut ad: JobAd) -> Result<Self, String> {
        let proc = ad
            .proc_id()
            .ok_or_else(|| "Job ad has no ClusterId/ProcId".to_string())?;
        let (kind, endpoint) = BackendKind::parse_grid_resource(ad.get_str(attr::GRID_RESOURCE))?;
        let local = ad.local_status().unwrap_or(LocalStatus::Idle);
        let remote_id = ad.get_str(attr::GRID_JOB_ID).map(str::to_string);
        let proxy_path = ad.get_str(attr::X509_USER_PROXY).map(str::to_string);
        let lifetime_until = ad.get_int(attr::GRID_JOB_LIFETIME);

        let mut logged = EventSet::default();
        if remote_id.is_some() {
            logged.insert(LoggedEvent::Submit);
        }
        if local == LocalStatus::Running {
            logged.insert(LoggedEvent::Execute);
        }
        ad.set(attr::MANAGED, managed::EXTERNAL);

        Ok(Self {
            proc,
            ad,
            kind,
            caps: kind.capabilities(),
            endpoint,
            phase: JobPhase::Init,
            epoch: 1,
            local,
            remote_state: RemoteState::Unknown,
            remote_id,
            error: None,
            proxy_path,
            last_submit_attempt: None,
            num_submit_attempts: 0,
            requested_lifetime: None,
            lifetime_until,
            last_proxy_refresh: None,
            last_remove_attempt: None,
            last_probe: None,
            probe_now: false,
            last_status_time: None,
            new_status: None,
            exit_code: None,
            pending: None,
            next_seq: 1,
            connect_failures: 0,
            retry_at: None,
            logged,
            events: Vec::new(),
            failover_to: None,
            exit_applied: false,
            clear_applied: false,
            done_applied: false,
            delete_from_queue: false,
        })
    }

    pub fn proc(&self) -> ProcId {
        self.proc
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn local_status(&self) -> LocalStatus {
        self.local
    }

    pub fn remote_state(&self) -> RemoteState {
        self.remote_state
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn ad(&self) -> &JobAd {
        &self.ad
    }

    pub(crate) fn ad_mut(&mut self) -> &mut JobAd {
        &mut self.ad
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn proxy_path(&self) -> Option<&str> {
        self.proxy_path.as_deref()
    }

    pub fn submit_attempts(&self) -> u32 {
        self.num_submit_attempts
    }

    pub fn has_pending_rpc(&self) -> bool {
        self.pending.is_some()
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind,
            endpoint: self.endpoint.clone(),
            credential: self.proxy_path.clone(),
        }
    }

    /// `GridResource`-style name used in events.
    pub fn resource_name(&self) -> String {
        format!("{} {}", self.kind, self.endpoint).trim().to_string()
    }

    pub fn user_log(&self) -> Option<PathBuf> {
        self.ad.get_str(attr::USER_LOG).map(PathBuf::from)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<LogEvent> {
        std::mem::take(&mut self.events)
    }

    /// Put back events whose write did not commit, ahead of newer ones.
    pub fn requeue_events(&mut self, mut events: Vec<LogEvent>) {
        events.append(&mut self.events);
        self.events = events;
    }

    pub fn delete_requested(&self) -> bool {
        self.delete_from_queue
    }

    // ---- inputs ---------------------------------------------------------

    /// Hand over an RPC reply. Replies for a purged or superseded call are
    /// dropped; returns whether the reply was accepted.
    pub fn deliver_reply(&mut self, seq: u64, reply: RpcReply) -> bool {
        match &mut self.pending {
            Some(p) if p.seq == seq && p.reply.is_none() => {
                p.reply = Some(reply);
                true
            }
            _ => {
                debug!(job = %self.proc, seq, "dropping stale rpc reply");
                false
            }
        }
    }

    /// Pushed status report. Returns whether it was newer than the last
    /// one applied.
    pub fn callback(&mut self, status: RemoteStatus) -> bool {
        self.accept_status(status)
    }

    fn accept_status(&mut self, status: RemoteStatus) -> bool {
        if let (Some(t), Some(last)) = (status.server_time, self.last_status_time) {
            if t <= last {
                debug!(job = %self.proc, server_time = t, last, "discarding stale status");
                return false;
            }
        }
        if status.server_time.is_some() {
            self.last_status_time = status.server_time;
        }
        self.new_status = Some(status);
        true
    }

    /// The queue reports the job REMOVED or HELD; that overrides the
    /// cached local status. Returns whether anything changed.
    pub fn queue_status(&mut self, status: LocalStatus, reason: Option<&str>) -> bool {
        if status == self.local {
            return false;
        }
        let mut vals: Vec<(String, AdValue)> =
            vec![(attr::JOB_STATUS.to_string(), AdValue::Int(status.code()))];
        match status {
            LocalStatus::Removed => {
                if let Some(r) = reason {
                    vals.push((attr::REMOVE_REASON.to_string(), r.into()));
                }
            }
            LocalStatus::Held => {
                if let Some(r) = reason {
                    vals.push((attr::HOLD_REASON.to_string(), r.into()));
                }
                // The queue already logged this hold.
                self.logged.insert(LoggedEvent::Hold);
            }
            _ => return false,
        }
        info!(job = %self.proc, status = %status, "queue changed job status");
        self.local = status;
        self.ad.merge_clean(vals.clone());
        self.ad.mark_clean(&vals);
        true
    }

    /// Up/down change of the job's resource.
    pub fn resource_changed(&mut self, transition: ResourceTransition, now: i64) {
        let resource = self.resource_name();
        let kind = match transition {
            ResourceTransition::Up => LogEventKind::GridResourceUp { resource },
            ResourceTransition::Down => LogEventKind::GridResourceDown { resource },
        };
        self.push_event(kind, now);
    }

    /// Newer credential expiration; cancels the delegation bookkeeping so
    /// a refresh is considered again.
    pub fn credential_updated(&mut self) {
        self.last_proxy_refresh = None;
    }

    // ---- local status transitions ----------------------------------------

    fn push_event(&mut self, kind: LogEventKind, now: i64) {
        self.events
            .push(LogEvent::at(self.proc.condor_id(), kind, now));
    }

    /// Write `event` unless an event of `kind` was already written since
    /// the last request clear.
    fn emit(&mut self, kind: LoggedEvent, event: LogEventKind, now: i64) {
        if self.logged.insert(kind) {
            self.push_event(event, now);
        }
    }

    fn set_local(&mut self, status: LocalStatus, now: i64) {
        debug!(job = %self.proc, from = %self.local, to = %status, "local status");
        self.local = status;
        self.ad.set(attr::JOB_STATUS, status.code());
        self.ad.set(attr::ENTERED_CURRENT_STATUS, now);
    }

    pub fn job_running(&mut self, now: i64) {
        if matches!(
            self.local,
            LocalStatus::Running | LocalStatus::Held | LocalStatus::Removed
        ) {
            return;
        }
        self.set_local(LocalStatus::Running, now);
        let host = Some(self.resource_name());
        self.emit(LoggedEvent::Execute, LogEventKind::Execute { host }, now);
    }

    pub fn job_idle(&mut self, now: i64) {
        if self.local != LocalStatus::Running {
            return;
        }
        self.set_local(LocalStatus::Idle, now);
        self.emit(LoggedEvent::Evict, LogEventKind::Evicted, now);
    }

    pub fn job_held(&mut self, now: i64, reason: &str, code: i64, subcode: i64) {
        if self.local == LocalStatus::Held {
            return;
        }
        if self.local == LocalStatus::Removed {
            self.ad
                .set(attr::JOB_STATUS_ON_RELEASE, LocalStatus::Removed.code());
        }
        self.set_local(LocalStatus::Held, now);
        self.ad.set(attr::HOLD_REASON, reason);
        self.ad.set(attr::HOLD_REASON_CODE, code);
        self.ad.set(attr::HOLD_REASON_SUBCODE, subcode);
        if let Some(release) = self.ad.get_str(attr::RELEASE_REASON).map(str::to_string) {
            self.ad.set(attr::LAST_RELEASE_REASON, release);
            self.ad.set_undefined(attr::RELEASE_REASON);
        }
        let holds = self.ad.get_int(attr::NUM_SYSTEM_HOLDS).unwrap_or(0);
        self.ad.set(attr::NUM_SYSTEM_HOLDS, holds + 1);
        info!(job = %self.proc, reason, "job held");
        self.emit(
            LoggedEvent::Hold,
            LogEventKind::Held {
                reason: Some(reason.to_string()),
            },
            now,
        );
    }

    pub fn job_removed(&mut self, now: i64, reason: &str) {
        if self.local == LocalStatus::Removed {
            return;
        }
        self.set_local(LocalStatus::Removed, now);
        self.ad.set(attr::REMOVE_REASON, reason);
        info!(job = %self.proc, reason, "job removed");
    }

    pub fn job_completed(&mut self, now: i64) {
        if self.local == LocalStatus::Completed {
            return;
        }
        self.set_local(LocalStatus::Completed, now);
    }

    /// Record the exit and apply the on-exit policy.
    fn job_terminated(&mut self, now: i64) {
        let code = self.exit_code.unwrap_or(0);
        self.ad.set(attr::EXIT_CODE, code);
        self.ad.set(attr::EXIT_BY_SIGNAL, false);
        match eval_on_exit(&self.ad, now) {
            PolicyVerdict::Remove { .. } => self.job_completed(now),
            PolicyVerdict::Hold { reason } => {
                self.job_held(now, &reason, HOLD_CODE_JOB_POLICY, 0)
            }
            PolicyVerdict::Undefined { reason } => {
                self.job_held(now, &reason, HOLD_CODE_JOB_POLICY_UNDEFINED, 0)
            }
            PolicyVerdict::StaysInQueue | PolicyVerdict::Release => {
                info!(job = %self.proc, code, "job exited but stays in the queue");
            }
        }
    }

    /// Hand the job back to the queue in its final form.
    fn done_with_job(&mut self, now: i64) {
        match self.local {
            LocalStatus::Completed => {
                self.ad.set(attr::MANAGED, managed::DONE);
                let code = self.exit_code.unwrap_or(0);
                self.emit(
                    LoggedEvent::Terminate,
                    LogEventKind::Terminated(Termination::Normal(code)),
                    now,
                );
                self.delete_from_queue = true;
            }
            LocalStatus::Removed => {
                self.ad.set(attr::MANAGED, managed::DONE);
                let reason = self.ad.get_str(attr::REMOVE_REASON).map(str::to_string);
                self.emit(LoggedEvent::Abort, LogEventKind::Aborted { reason }, now);
                self.delete_from_queue = true;
            }
            LocalStatus::Held => {
                self.ad.set(attr::MANAGED, managed::SCHEDD);
                let reason = self.ad.get_str(attr::HOLD_REASON).map(str::to_string);
                self.emit(LoggedEvent::Hold, LogEventKind::Held { reason }, now);
            }
            LocalStatus::Idle | LocalStatus::Running => {
                self.ad.set(attr::MANAGED, managed::SCHEDD);
            }
        }
        debug!(job = %self.proc, status = %self.local, "done with job");
    }

    /// Periodic user policy. Returns whether the job must be re-evaluated.
    pub fn eval_periodic_policy(&mut self, now: i64) -> bool {
        if matches!(self.local, LocalStatus::Completed | LocalStatus::Removed) {
            return false;
        }
        match eval_periodic(&self.ad, now) {
            PolicyVerdict::Hold { reason } if self.local != LocalStatus::Held => {
                self.job_held(now, &reason, HOLD_CODE_JOB_POLICY, 0);
                true
            }
            PolicyVerdict::Undefined { reason } if self.local != LocalStatus::Held => {
                self.job_held(now, &reason, HOLD_CODE_JOB_POLICY_UNDEFINED, 0);
                true
            }
            PolicyVerdict::Remove { reason } => {
                self.job_removed(now, &reason);
                true
            }
            _ => false,
        }
    }

    // ---- phase machine ---------------------------------------------------

    fn set_phase(&mut self, next: JobPhase) {
        if next == self.phase {
            return;
        }
        debug!(job = %self.proc, from = %self.phase, to = %next, "phase change");
        self.phase = next;
        self.epoch += 1;
        self.pending = None;
        self.connect_failures = 0;
        self.retry_at = None;
    }

    fn set_remote_id(&mut self, id: Option<String>) {
        match &id {
            Some(id) => self.ad.set(attr::GRID_JOB_ID, id.as_str()),
            None => self.ad.set_undefined(attr::GRID_JOB_ID),
        }
        self.remote_id = id;
    }

    fn credential_near_expiry(&self, ctx: &JobContext<'_>) -> bool {
        self.proxy_path.as_deref().is_some_and(|p| {
            ctx.credentials
                .near_expiry(p, ctx.now, ctx.cfg.min_proxy_lifetime_secs as i64)
        })
    }

    /// Issue `op` or collect its reply. At most one RPC is outstanding.
    /// Nothing is issued while the resource is down (unless `force`) or
    /// while the credential is about to expire.
    fn poll_rpc(
        &mut self,
        ctx: &mut JobContext<'_>,
        eval: &mut Evaluation,
        force: bool,
        op: impl FnOnce(&Self) -> RemoteOp,
    ) -> Poll {
        if let Some(pending) = &mut self.pending {
            let Some(reply) = pending.reply.take() else {
                return Poll::Wait;
            };
            self.pending = None;
            if let RpcReply::Unreachable(msg) = &reply {
                if !force {
                    self.connect_failures += 1;
                    warn!(
                        job = %self.proc,
                        resource = %ctx.resource.key(),
                        failures = self.connect_failures,
                        "resource unreachable: {msg}"
                    );
                    self.error = Some(msg.clone());
                    if self.connect_failures < MAX_CONNECT_FAILURES {
                        let at = ctx.now + CONNECT_RETRY_SECS;
                        self.retry_at = Some(at);
                        eval.wake_at(at);
                    } else {
                        self.connect_failures = 0;
                        eval.ping = true;
                    }
                    return Poll::Wait;
                }
            }
            self.connect_failures = 0;
            return Poll::Ready(reply);
        }

        if ctx.resource.is_down() && !force {
            return Poll::Wait;
        }
        if let Some(at) = self.retry_at {
            if ctx.now < at {
                eval.wake_at(at);
                return Poll::Wait;
            }
            self.retry_at = None;
        }
        if self.credential_near_expiry(ctx) {
            self.set_phase(JobPhase::ProxyExpired);
            return Poll::Wait;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let op = op(self);
        debug!(job = %self.proc, phase = %self.phase, op = op.name(), seq, "issuing rpc");
        self.pending = Some(PendingRpc { seq, reply: None });
        eval.rpc = Some(IssuedRpc { seq, op });
        Poll::Wait
    }

    /// Run transitions until the job has to wait for something.
    pub fn evaluate(&mut self, ctx: &mut JobContext<'_>) -> Evaluation {
        let mut eval = Evaluation::default();
        let key = self.resource_key();
        for _ in 0..MAX_EVALUATE_STEPS {
            let epoch = self.epoch;
            self.step(ctx, &mut eval);
            if self.epoch == epoch || eval.finished {
                return eval;
            }
            if self.resource_key() != key {
                eval.moved = true;
                return eval;
            }
        }
        warn!(job = %self.proc, phase = %self.phase, "evaluation did not settle");
        eval.wake_at(ctx.now + 1);
        eval
    }

    fn step(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        match self.phase {
            JobPhase::Init => self.step_init(),
            JobPhase::Start => self.step_start(),
            JobPhase::RecoverQuery => self.step_recover_query(ctx, eval),
            JobPhase::Register => self.step_register(ctx, eval),
            JobPhase::Unsubmitted => self.step_unsubmitted(),
            JobPhase::Submit => self.step_submit(ctx, eval),
            JobPhase::SubmitSave => self.step_submit_save(ctx),
            JobPhase::SubmitCommit => self.step_submit_commit(ctx, eval),
            JobPhase::StageIn => self.step_stage_in(ctx, eval),
            JobPhase::Submitted => self.step_submitted(ctx, eval),
            JobPhase::Probe => self.step_probe(ctx, eval),
            JobPhase::RefreshProxy => self.step_refresh_proxy(ctx, eval),
            JobPhase::ExtendLifetime => self.step_extend_lifetime(ctx, eval),
            JobPhase::HoldRemote => self.step_hold_remote(ctx, eval),
            JobPhase::ReleaseRemote => self.step_release_remote(ctx, eval),
            JobPhase::StageOut => self.step_stage_out(ctx, eval),
            JobPhase::DoneSave => self.step_done_save(ctx),
            JobPhase::DoneCommit => self.step_done_commit(ctx, eval),
            JobPhase::Cancel => self.step_cancel(ctx, eval),
            JobPhase::Failed => self.step_failed(ctx, eval),
            JobPhase::Delete => self.step_delete(ctx, eval),
            JobPhase::ClearRequest => self.step_clear_request(ctx),
            JobPhase::Hold => self.step_hold(ctx.now),
            JobPhase::ProxyExpired => self.step_proxy_expired(ctx),
        }
    }

    fn step_init(&mut self) {
        if self.caps.credential_required && self.proxy_path.is_none() {
            self.error = Some("Job has no x509 user proxy".to_string());
            self.set_phase(JobPhase::Hold);
            return;
        }
        self.set_phase(JobPhase::Start);
    }

    fn step_start(&mut self) {
        if self.remote_id.is_none() {
            self.set_phase(JobPhase::Unsubmitted);
            return;
        }
        info!(job = %self.proc, remote_id = ?self.remote_id, "recovering submitted job");
        self.probe_now = true;
        self.set_phase(if self.caps.recovery_query {
            JobPhase::RecoverQuery
        } else if self.caps.callbacks {
            JobPhase::Register
        } else {
            JobPhase::Submitted
        });
    }

    fn step_recover_query(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::Unsubmitted);
            return;
        };
        let Poll::Ready(reply) = self.poll_rpc(ctx, eval, false, |_| RemoteOp::Status { remote_id })
        else {
            return;
        };
        match reply {
            RpcReply::Status(status) => {
                self.accept_status(status);
                self.last_probe = Some(ctx.now);
                self.probe_now = false;
                self.set_phase(if self.caps.callbacks {
                    JobPhase::Register
                } else {
                    JobPhase::Submitted
                });
            }
            RpcReply::Ok { .. } => self.set_phase(JobPhase::Submitted),
            RpcReply::Gone => {
                info!(job = %self.proc, "remote job not found during recovery; resubmitting");
                self.set_remote_id(None);
                self.set_phase(JobPhase::ClearRequest);
            }
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Hold);
            }
        }
    }

    fn step_register(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::Unsubmitted);
            return;
        };
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, false, |_| RemoteOp::Register { remote_id })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } | RpcReply::Status(_) => {
                self.probe_now = true;
                self.set_phase(JobPhase::Submitted);
            }
            RpcReply::Gone => {
                self.set_remote_id(None);
                self.set_phase(JobPhase::ClearRequest);
            }
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Hold);
            }
        }
    }

    fn step_unsubmitted(&mut self) {
        match self.local {
            LocalStatus::Removed | LocalStatus::Held | LocalStatus::Completed => {
                self.set_phase(JobPhase::Delete)
            }
            LocalStatus::Idle | LocalStatus::Running => self.set_phase(JobPhase::Submit),
        }
    }

    fn step_submit(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let now = ctx.now;
        if self.pending.is_none() {
            if matches!(self.local, LocalStatus::Removed | LocalStatus::Held) {
                eval.wake.extend(ctx.resource.cancel_submit(self.proc));
                self.set_phase(JobPhase::Unsubmitted);
                return;
            }
            if self.num_submit_attempts >= ctx.cfg.max_submit_attempts {
                eval.wake.extend(ctx.resource.cancel_submit(self.proc));
                self.error = Some(match &self.error {
                    Some(last) => format!("Attempts to submit failed: {last}"),
                    None => "Attempts to submit failed".to_string(),
                });
                self.set_phase(JobPhase::Hold);
                return;
            }
            if let Some(last) = self.last_submit_attempt {
                let next = last + ctx.cfg.submit_interval_secs as i64;
                if now < next {
                    eval.wake_at(next);
                    return;
                }
            }
            if !ctx.resource.request_submit(self.proc) {
                return;
            }
            self.requested_lifetime = self
                .caps
                .lifetime_extension
                .then(|| now + ctx.cfg.job_lifetime_secs as i64);
        }

        let Poll::Ready(reply) = self.poll_rpc(ctx, eval, false, |job| RemoteOp::Submit {
            description: submit_description(job.kind, &job.ad),
            lifetime_until: job.requested_lifetime,
        }) else {
            return;
        };

        self.last_submit_attempt = Some(now);
        self.num_submit_attempts += 1;
        eval.wake.extend(ctx.resource.submit_complete(self.proc));

        match reply {
            RpcReply::Ok {
                remote_id: Some(remote_id),
            } => {
                info!(job = %self.proc, remote_id, resource = %self.resource_name(), "job submitted");
                self.set_remote_id(Some(remote_id.clone()));
                self.remote_state = RemoteState::Pending;
                self.error = None;
                let submits = self.ad.get_int(attr::NUM_GRID_SUBMITS).unwrap_or(0);
                self.ad.set(attr::NUM_GRID_SUBMITS, submits + 1);
                if let Some(until) = self.requested_lifetime {
                    self.lifetime_until = Some(until);
                    self.ad.set(attr::GRID_JOB_LIFETIME, until);
                }
                if self.caps.credential_delegation {
                    if let Some(exp) = self
                        .proxy_path
                        .as_deref()
                        .and_then(|p| ctx.credentials.expiration(p))
                    {
                        self.ad.set(attr::DELEGATED_PROXY_EXPIRATION, exp);
                        self.last_proxy_refresh = Some(now);
                    }
                }
                let resource = self.resource_name();
                self.emit(
                    LoggedEvent::Submit,
                    LogEventKind::GridSubmit {
                        resource,
                        job_id: remote_id,
                    },
                    now,
                );
                self.probe_now = true;
                self.set_phase(JobPhase::SubmitSave);
            }
            other => {
                let msg = match other {
                    RpcReply::Ok { remote_id: None } => {
                        "Submission returned no job id".to_string()
                    }
                    ref o => describe(o),
                };
                warn!(job = %self.proc, attempts = self.num_submit_attempts, "submit failed: {msg}");
                self.error = Some(msg);
                self.set_phase(JobPhase::Unsubmitted);
            }
        }
    }

    fn step_submit_save(&mut self, ctx: &mut JobContext<'_>) {
        if matches!(self.local, LocalStatus::Removed | LocalStatus::Held) {
            self.set_phase(JobPhase::Cancel);
            return;
        }
        let has_work = self.ad.is_dirty(attr::GRID_JOB_ID);
        if !ctx.schedd.request(self.proc, self.epoch, has_work, ctx.now) {
            return;
        }
        self.set_phase(if self.caps.two_phase_commit {
            JobPhase::SubmitCommit
        } else if self.caps.stage_in {
            JobPhase::StageIn
        } else {
            JobPhase::Submitted
        });
    }

    fn step_submit_commit(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if self.pending.is_none()
            && matches!(self.local, LocalStatus::Removed | LocalStatus::Held)
        {
            self.set_phase(JobPhase::Cancel);
            return;
        }
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::ClearRequest);
            return;
        };
        let Poll::Ready(reply) = self.poll_rpc(ctx, eval, false, |_| RemoteOp::Commit { remote_id })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } => self.set_phase(if self.caps.stage_in {
                JobPhase::StageIn
            } else {
                JobPhase::Submitted
            }),
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Cancel);
            }
        }
    }

    fn step_stage_in(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if self.pending.is_none()
            && matches!(self.local, LocalStatus::Removed | LocalStatus::Held)
        {
            self.set_phase(JobPhase::Cancel);
            return;
        }
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::ClearRequest);
            return;
        };
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, false, |_| RemoteOp::StageIn { remote_id })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } => self.set_phase(JobPhase::Submitted),
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Cancel);
            }
        }
    }

    fn apply_new_status(&mut self, now: i64) {
        let Some(status) = self.new_status.take() else {
            return;
        };
        if status.state != self.remote_state {
            info!(
                job = %self.proc,
                from = %self.remote_state,
                to = %status.state,
                "remote state changed"
            );
        }
        self.remote_state = status.state;
        self.ad.set(attr::GRID_JOB_STATUS, status.state.as_str());
        if let Some(t) = status.server_time {
            self.ad.set(attr::LAST_REMOTE_STATUS_UPDATE, t);
        }
        if let Some(code) = status.exit_code {
            self.exit_code = Some(code);
        }
        if status.reason.is_some() {
            self.error = status.reason;
        }
        match status.state {
            RemoteState::Running => self.job_running(now),
            RemoteState::Idle | RemoteState::Pending => self.job_idle(now),
            _ => {}
        }
    }

    fn step_submitted(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let now = ctx.now;
        if self.credential_near_expiry(ctx) {
            self.set_phase(JobPhase::ProxyExpired);
            return;
        }
        if self.local == LocalStatus::Removed {
            self.set_phase(JobPhase::Cancel);
            return;
        }
        self.apply_new_status(now);

        match self.remote_state {
            RemoteState::Completed => {
                self.set_phase(if self.caps.stage_out {
                    JobPhase::StageOut
                } else {
                    JobPhase::DoneSave
                });
                return;
            }
            RemoteState::Failed => {
                if self.error.is_none() {
                    self.error = Some("Job failed on the remote resource".to_string());
                }
                self.set_phase(JobPhase::Failed);
                return;
            }
            RemoteState::Removed => {
                self.error = Some("Job was removed on the remote resource".to_string());
                self.set_remote_id(None);
                self.set_phase(JobPhase::Hold);
                return;
            }
            _ => {}
        }

        if self.local == LocalStatus::Held {
            self.set_phase(match (self.caps.remote_hold_release, self.remote_state) {
                (true, RemoteState::Held) => JobPhase::Delete,
                (true, _) => JobPhase::HoldRemote,
                (false, _) => JobPhase::Cancel,
            });
            return;
        }
        if self.remote_state == RemoteState::Held {
            if self.caps.remote_hold_release {
                self.set_phase(JobPhase::ReleaseRemote);
            } else {
                if self.error.is_none() {
                    self.error = Some("Job was held on the remote resource".to_string());
                }
                self.set_phase(JobPhase::Cancel);
            }
            return;
        }

        if self.caps.failover {
            let target = self.ad.get_str(attr::GRID_RESOURCE_FAILOVER).map(str::to_string);
            let down_too_long = ctx
                .resource
                .down_for(now)
                .is_some_and(|d| d > ctx.cfg.failover_delay_secs as i64);
            if let (Some(target), true) = (target, down_too_long) {
                warn!(job = %self.proc, target, "resource down too long; failing over");
                self.failover_to = Some(target);
                self.set_phase(JobPhase::Cancel);
                return;
            }
        }

        if self.caps.lifetime_extension {
            if let Some(until) = self.lifetime_until {
                let threshold =
                    ctx.cfg.job_lifetime_secs as i64 - ctx.cfg.lifetime_refresh_margin_secs as i64;
                if until - now < threshold {
                    self.set_phase(JobPhase::ExtendLifetime);
                    return;
                }
            }
        }

        if self.caps.credential_delegation {
            if let Some(exp) = self
                .proxy_path
                .as_deref()
                .and_then(|p| ctx.credentials.expiration(p))
            {
                let delegated = self.ad.get_int(attr::DELEGATED_PROXY_EXPIRATION);
                let interval = ctx.cfg.proxy_refresh_interval_secs as i64;
                let newer = delegated.is_none_or(|d| exp > d);
                let due = self.last_proxy_refresh.is_none_or(|t| now >= t + interval);
                if newer && due {
                    self.set_phase(JobPhase::RefreshProxy);
                    return;
                }
            }
        }

        let interval = ctx.cfg.probe_interval_secs as i64;
        match self.last_probe {
            Some(last) if !self.probe_now && now < last + interval => eval.wake_at(last + interval),
            _ => self.set_phase(JobPhase::Probe),
        }
    }

    fn step_probe(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if self.local == LocalStatus::Removed {
            self.set_phase(JobPhase::Cancel);
            return;
        }
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::ClearRequest);
            return;
        };
        let Poll::Ready(reply) = self.poll_rpc(ctx, eval, false, |_| RemoteOp::Status { remote_id })
        else {
            return;
        };
        self.last_probe = Some(ctx.now);
        self.probe_now = false;
        match reply {
            RpcReply::Status(status) => {
                self.accept_status(status);
                self.set_phase(JobPhase::Submitted);
            }
            RpcReply::Ok { .. } => self.set_phase(JobPhase::Submitted),
            RpcReply::Gone => {
                self.error = Some("Job disappeared from remote queue".to_string());
                self.set_remote_id(None);
                self.set_phase(JobPhase::Hold);
            }
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Hold);
            }
        }
    }

    fn step_refresh_proxy(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let (Some(remote_id), Some(proxy)) = (self.remote_id.clone(), self.proxy_path.clone())
        else {
            self.set_phase(JobPhase::Submitted);
            return;
        };
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, false, |_| RemoteOp::RefreshProxy { remote_id, proxy })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } => {
                if let Some(exp) = self
                    .proxy_path
                    .as_deref()
                    .and_then(|p| ctx.credentials.expiration(p))
                {
                    self.ad.set(attr::DELEGATED_PROXY_EXPIRATION, exp);
                }
                self.last_proxy_refresh = Some(ctx.now);
                self.set_phase(JobPhase::Submitted);
            }
            RpcReply::Gone => {
                self.error = Some("Job disappeared from remote queue".to_string());
                self.set_remote_id(None);
                self.set_phase(JobPhase::Hold);
            }
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Cancel);
            }
        }
    }

    fn step_extend_lifetime(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::ClearRequest);
            return;
        };
        if self.pending.is_none() {
            self.requested_lifetime = Some(ctx.now + ctx.cfg.job_lifetime_secs as i64);
        }
        let until = self.requested_lifetime.unwrap_or(ctx.now);
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, false, |_| RemoteOp::ExtendLifetime { remote_id, until })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } => {
                debug!(job = %self.proc, until, "lifetime extended");
                self.lifetime_until = Some(until);
                self.ad.set(attr::GRID_JOB_LIFETIME, until);
                self.set_phase(JobPhase::Submitted);
            }
            RpcReply::Gone => {
                self.error = Some("Job disappeared from remote queue".to_string());
                self.set_remote_id(None);
                self.set_phase(JobPhase::Hold);
            }
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Cancel);
            }
        }
    }

    fn step_hold_remote(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if self.pending.is_none() && self.local != LocalStatus::Held {
            self.set_phase(JobPhase::Submitted);
            return;
        }
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::ClearRequest);
            return;
        };
        let reason = self
            .ad
            .get_str(attr::HOLD_REASON)
            .unwrap_or("held by user")
            .to_string();
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, false, |_| RemoteOp::Hold { remote_id, reason })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } => {
                self.remote_state = RemoteState::Held;
                self.ad.set(attr::GRID_JOB_STATUS, RemoteState::Held.as_str());
                self.set_phase(JobPhase::Submitted);
            }
            RpcReply::Gone => {
                self.set_remote_id(None);
                self.set_phase(JobPhase::Hold);
            }
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Cancel);
            }
        }
    }

    fn step_release_remote(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if self.pending.is_none()
            && matches!(self.local, LocalStatus::Held | LocalStatus::Removed)
        {
            self.set_phase(JobPhase::Submitted);
            return;
        }
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::ClearRequest);
            return;
        };
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, false, |_| RemoteOp::Release { remote_id })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } => {
                self.remote_state = RemoteState::Idle;
                self.ad.set(attr::GRID_JOB_STATUS, RemoteState::Idle.as_str());
                self.set_phase(JobPhase::Submitted);
            }
            RpcReply::Gone => {
                self.error = Some("Job disappeared from remote queue".to_string());
                self.set_remote_id(None);
                self.set_phase(JobPhase::Hold);
            }
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Cancel);
            }
        }
    }

    fn step_stage_out(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let Some(remote_id) = self.remote_id.clone() else {
            self.set_phase(JobPhase::DoneSave);
            return;
        };
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, false, |_| RemoteOp::StageOut { remote_id })
        else {
            return;
        };
        match reply {
            RpcReply::Ok { .. } => self.set_phase(JobPhase::DoneSave),
            other => {
                self.error = Some(describe(&other));
                self.set_phase(JobPhase::Cancel);
            }
        }
    }

    fn step_done_save(&mut self, ctx: &mut JobContext<'_>) {
        if !matches!(self.local, LocalStatus::Held | LocalStatus::Removed) {
            if !self.exit_applied {
                self.exit_applied = true;
                self.job_terminated(ctx.now);
            }
            if self.local == LocalStatus::Completed {
                let has_work = self.ad.is_dirty(attr::JOB_STATUS);
                if !ctx.schedd.request(self.proc, self.epoch, has_work, ctx.now) {
                    return;
                }
            }
        }
        self.set_phase(JobPhase::DoneCommit);
    }

    fn step_done_commit(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if let Some(remote_id) = self.remote_id.clone() {
            let Poll::Ready(reply) =
                self.poll_rpc(ctx, eval, false, |_| RemoteOp::Destroy { remote_id })
            else {
                return;
            };
            if !matches!(reply, RpcReply::Ok { .. } | RpcReply::Gone) {
                debug!(job = %self.proc, "ignoring destroy failure: {}", describe(&reply));
            }
        }
        if matches!(self.local, LocalStatus::Completed | LocalStatus::Removed) {
            self.set_phase(JobPhase::Delete);
        } else {
            self.set_remote_id(None);
            eval.wake.extend(ctx.resource.cancel_submit(self.proc));
            self.set_phase(JobPhase::ClearRequest);
        }
    }

    fn step_cancel(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        let Some(remote_id) = self.remote_id.clone() else {
            self.after_cancel();
            return;
        };
        if self.pending.is_none() {
            if let Some(last) = self.last_remove_attempt {
                let next = last + ctx.cfg.submit_interval_secs as i64;
                if ctx.now < next {
                    eval.wake_at(next);
                    return;
                }
            }
        }
        let force = self.failover_to.is_some();
        let cancelled_id = remote_id.clone();
        let Poll::Ready(reply) =
            self.poll_rpc(ctx, eval, force, |_| RemoteOp::Cancel { remote_id })
        else {
            return;
        };
        self.last_remove_attempt = Some(ctx.now);

        let gone = match &reply {
            RpcReply::Ok { .. } | RpcReply::Gone => true,
            RpcReply::Error(msg) => is_already_gone(msg),
            _ => false,
        };
        if gone {
            debug!(job = %self.proc, remote_id = cancelled_id, "remote job cancelled");
            self.remote_state = RemoteState::Removed;
            self.set_remote_id(None);
            self.after_cancel();
            return;
        }

        let msg = describe(&reply);
        if self.failover_to.is_some() {
            warn!(job = %self.proc, remote_id = cancelled_id, "abandoning remote job: {msg}");
            self.ad
                .set(attr::FAILOVER_ORPHAN_JOB_ID, cancelled_id.as_str());
            self.set_remote_id(None);
            self.after_cancel();
        } else {
            warn!(job = %self.proc, "cancel failed: {msg}");
            self.error = Some(msg);
            self.set_phase(JobPhase::Hold);
        }
    }

    fn after_cancel(&mut self) {
        if let Some(target) = self.failover_to.take() {
            match BackendKind::parse_grid_resource(Some(&target)) {
                Ok((kind, endpoint)) => {
                    info!(job = %self.proc, from = %self.resource_name(), to = target, "switching resource");
                    self.ad.set(attr::GRID_RESOURCE, target.as_str());
                    self.kind = kind;
                    self.caps = kind.capabilities();
                    self.endpoint = endpoint;
                    self.set_phase(JobPhase::ClearRequest);
                }
                Err(reason) => {
                    self.error = Some(reason);
                    self.set_phase(JobPhase::Hold);
                }
            }
            return;
        }
        if self.local == LocalStatus::Removed {
            self.set_phase(JobPhase::Delete);
        } else {
            self.set_remote_id(None);
            self.set_phase(JobPhase::Hold);
        }
    }

    fn step_failed(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if let Some(remote_id) = self.remote_id.clone() {
            let Poll::Ready(_) =
                self.poll_rpc(ctx, eval, false, |_| RemoteOp::Destroy { remote_id })
            else {
                return;
            };
            self.set_remote_id(None);
        }
        self.set_phase(if self.local == LocalStatus::Removed {
            JobPhase::Delete
        } else {
            JobPhase::ClearRequest
        });
    }

    fn step_delete(&mut self, ctx: &mut JobContext<'_>, eval: &mut Evaluation) {
        if !self.done_applied {
            self.done_applied = true;
            self.done_with_job(ctx.now);
        }
        let has_work = self.ad.has_dirty() || self.has_events() || self.delete_from_queue;
        if ctx.schedd.request(self.proc, self.epoch, has_work, ctx.now) {
            eval.finished = true;
        }
    }

    fn step_clear_request(&mut self, ctx: &mut JobContext<'_>) {
        if self.remote_id.is_some() {
            if self.local == LocalStatus::Removed {
                self.set_phase(JobPhase::Cancel);
            } else {
                self.error = Some(
                    "Internal error: Attempting to clear request, but remote job id is still set"
                        .to_string(),
                );
                self.set_phase(JobPhase::Hold);
            }
            return;
        }
        if !self.clear_applied {
            self.clear_applied = true;
            self.job_idle(ctx.now);
            if self.logged.contains(LoggedEvent::Submit) {
                self.emit(LoggedEvent::Evict, LogEventKind::Evicted, ctx.now);
            }
        }
        if !ctx
            .schedd
            .request(self.proc, self.epoch, self.ad.has_dirty(), ctx.now)
        {
            return;
        }

        self.logged.clear();
        self.error = None;
        self.remote_state = RemoteState::Unsubmitted;
        self.ad.set_undefined(attr::GRID_JOB_STATUS);
        self.new_status = None;
        self.last_status_time = None;
        self.last_probe = None;
        self.probe_now = false;
        self.lifetime_until = None;
        self.requested_lifetime = None;
        self.last_remove_attempt = None;
        self.exit_code = None;
        self.exit_applied = false;
        self.clear_applied = false;
        self.set_phase(JobPhase::Unsubmitted);
    }

    fn step_hold(&mut self, now: i64) {
        if self.local != LocalStatus::Held {
            let reason = self
                .ad
                .get_str(attr::HOLD_REASON)
                .map(str::to_string)
                .or_else(|| self.error.clone())
                .unwrap_or_else(|| "Unspecified gridmanager error".to_string());
            self.job_held(now, &reason, HOLD_CODE_GRIDMANAGER, 0);
        }
        self.set_phase(JobPhase::Delete);
    }

    fn step_proxy_expired(&mut self, ctx: &mut JobContext<'_>) {
        if !self.credential_near_expiry(ctx) {
            info!(job = %self.proc, "credential refreshed");
            self.set_phase(match (&self.remote_id, self.caps.credential_delegation) {
                (Some(_), true) => JobPhase::RefreshProxy,
                (Some(_), false) => JobPhase::Submitted,
                (None, _) => JobPhase::Start,
            });
            return;
        }
        if self.remote_id.is_none()
            && matches!(self.local, LocalStatus::Removed | LocalStatus::Held)
        {
            self.set_phase(JobPhase::Delete);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        cfg: GridmanagerSection,
        resource: RemoteResource,
        schedd: ScheddUpdater,
        credentials: CredentialCache,
    }

    impl Harness {
        fn new(job: &JobStateMachine) -> Self {
            Self {
                cfg: GridmanagerSection::default(),
                resource: RemoteResource::new(job.resource_key(), 5, 0),
                schedd: ScheddUpdater::new(5),
                credentials: CredentialCache::new(),
            }
        }

        fn eval(&mut self, job: &mut JobStateMachine, now: i64) -> Evaluation {
            let mut ctx = JobContext {
                now,
                cfg: &self.cfg,
                resource: &mut self.resource,
                schedd: &mut self.schedd,
                credentials: &self.credentials,
            };
            job.evaluate(&mut ctx)
        }

        /// Flush everything queued and mark the job's ad clean.
        fn flush(&mut self, job: &mut JobStateMachine, now: i64) {
            let flushed = job.ad().dirty_values();
            if self.schedd.take_batch(now).is_some() {
                job.ad_mut().mark_clean(&flushed);
                job.take_events();
                self.schedd.commit();
            }
        }
    }

    fn batch_job() -> JobStateMachine {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, 17);
        ad.set(attr::PROC_ID, 0);
        ad.set(attr::JOB_STATUS, LocalStatus::Idle.code());
        ad.set(attr::GRID_RESOURCE, "batch pbs");
        JobStateMachine::new(ad).unwrap()
    }

    fn reply(job: &mut JobStateMachine, eval: &Evaluation, reply: RpcReply) {
        let seq = eval.rpc.as_ref().unwrap().seq;
        assert!(job.deliver_reply(seq, reply));
    }

    #[test]
    fn unknown_grid_type_is_rejected() {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, 1);
        ad.set(attr::PROC_ID, 0);
        ad.set(attr::GRID_RESOURCE, "warp drive");
        assert_eq!(
            JobStateMachine::new(ad).unwrap_err(),
            "Unsupported grid type"
        );
    }

    #[test]
    fn happy_path_reaches_delete() {
        let mut job = batch_job();
        let mut h = Harness::new(&job);

        let ev = h.eval(&mut job, 100);
        assert_eq!(job.phase(), JobPhase::Submit);
        assert!(matches!(ev.rpc.as_ref().unwrap().op, RemoteOp::Submit { .. }));
        reply(
            &mut job,
            &ev,
            RpcReply::Ok {
                remote_id: Some("pbs.42".into()),
            },
        );

        h.eval(&mut job, 101);
        assert_eq!(job.phase(), JobPhase::SubmitSave);
        assert_eq!(job.ad().get_str(attr::GRID_JOB_ID), Some("pbs.42"));
        h.flush(&mut job, 106);

        let ev = h.eval(&mut job, 106);
        assert_eq!(job.phase(), JobPhase::Probe);
        reply(
            &mut job,
            &ev,
            RpcReply::Status(RemoteStatus::new(RemoteState::Running).at(1)),
        );
        h.eval(&mut job, 107);
        assert_eq!(job.local_status(), LocalStatus::Running);
        assert_eq!(job.phase(), JobPhase::Submitted);

        // The next probe is due after the probe interval.
        let ev = h.eval(&mut job, 107 + 300);
        assert_eq!(job.phase(), JobPhase::Probe);
        reply(
            &mut job,
            &ev,
            RpcReply::Status(
                RemoteStatus::new(RemoteState::Completed)
                    .with_exit_code(0)
                    .at(2),
            ),
        );
        h.eval(&mut job, 408);
        assert_eq!(job.phase(), JobPhase::DoneSave);
        assert_eq!(job.local_status(), LocalStatus::Completed);
        h.flush(&mut job, 413);

        let ev = h.eval(&mut job, 413);
        assert_eq!(job.phase(), JobPhase::DoneCommit);
        assert!(matches!(ev.rpc.as_ref().unwrap().op, RemoteOp::Destroy { .. }));
        reply(&mut job, &ev, RpcReply::ok());

        let ev = h.eval(&mut job, 414);
        assert_eq!(job.phase(), JobPhase::Delete);
        assert!(!ev.finished);
        assert!(job.delete_requested());
        assert_eq!(job.ad().get_str(attr::MANAGED), Some(managed::DONE));
        h.flush(&mut job, 419);
        assert!(h.eval(&mut job, 419).finished);
    }

    #[test]
    fn failed_submit_is_retried_until_attempt_cap() {
        let mut job = batch_job();
        let mut h = Harness::new(&job);
        h.cfg.max_submit_attempts = 2;

        let ev = h.eval(&mut job, 0);
        reply(&mut job, &ev, RpcReply::Error("queue full".into()));
        let ev = h.eval(&mut job, 1);
        assert_eq!(job.phase(), JobPhase::Submit);
        assert_eq!(ev.rpc, None);
        assert_eq!(ev.wake_at, Some(301));

        let ev = h.eval(&mut job, 301);
        reply(&mut job, &ev, RpcReply::Error("queue full".into()));
        h.eval(&mut job, 302);
        assert_eq!(job.submit_attempts(), 2);
        assert_eq!(job.local_status(), LocalStatus::Held);
        assert_eq!(
            job.ad().get_str(attr::HOLD_REASON),
            Some("Attempts to submit failed: queue full")
        );
        assert_eq!(job.phase(), JobPhase::Delete);
    }

    #[test]
    fn unreachable_resource_retries_then_pings() {
        let mut job = batch_job();
        let mut h = Harness::new(&job);

        let mut now = 0;
        for _ in 0..MAX_CONNECT_FAILURES - 1 {
            let ev = h.eval(&mut job, now);
            reply(&mut job, &ev, RpcReply::Unreachable("refused".into()));
            let ev = h.eval(&mut job, now);
            assert_eq!(ev.wake_at, Some(now + CONNECT_RETRY_SECS));
            now += CONNECT_RETRY_SECS;
        }
        let ev = h.eval(&mut job, now);
        reply(&mut job, &ev, RpcReply::Unreachable("refused".into()));
        let ev = h.eval(&mut job, now);
        assert!(ev.ping);
        assert_eq!(job.submit_attempts(), 0);
    }

    #[test]
    fn stale_reply_and_stale_status_are_dropped() {
        let mut job = batch_job();
        let mut h = Harness::new(&job);
        let ev = h.eval(&mut job, 0);
        let seq = ev.rpc.unwrap().seq;
        assert!(!job.deliver_reply(seq + 1, RpcReply::ok()));

        assert!(job.callback(RemoteStatus::new(RemoteState::Running).at(10)));
        assert!(!job.callback(RemoteStatus::new(RemoteState::Idle).at(10)));
        assert!(job.callback(RemoteStatus::new(RemoteState::Idle).at(11)));
    }

    #[test]
    fn local_hold_on_submitted_condor_job_holds_remote_then_returns_to_schedd() {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, 5);
        ad.set(attr::PROC_ID, 0);
        ad.set(attr::JOB_STATUS, LocalStatus::Running.code());
        ad.set(attr::GRID_RESOURCE, "condor remote.example.org cm.example.org");
        ad.set(attr::GRID_JOB_ID, "33.0");
        let mut job = JobStateMachine::new(ad).unwrap();
        let mut h = Harness::new(&job);

        let ev = h.eval(&mut job, 0);
        assert_eq!(job.phase(), JobPhase::RecoverQuery);
        reply(
            &mut job,
            &ev,
            RpcReply::Status(RemoteStatus::new(RemoteState::Running).at(1)),
        );
        h.eval(&mut job, 1);
        assert_eq!(job.phase(), JobPhase::Submitted);

        assert!(job.queue_status(LocalStatus::Held, Some("via condor_hold")));
        let ev = h.eval(&mut job, 2);
        assert_eq!(job.phase(), JobPhase::HoldRemote);
        reply(&mut job, &ev, RpcReply::ok());
        h.eval(&mut job, 3);
        assert_eq!(job.phase(), JobPhase::Delete);
        assert_eq!(job.ad().get_str(attr::MANAGED), Some(managed::SCHEDD));
        assert_eq!(job.ad().get_str(attr::GRID_JOB_ID), Some("33.0"));
        // The queue logged the hold itself.
        assert!(!job
            .take_events()
            .iter()
            .any(|e| matches!(e.kind, LogEventKind::Held { .. })));
    }

    #[test]
    fn job_held_moves_release_reason_and_counts_holds() {
        let mut job = batch_job();
        job.ad_mut().set(attr::RELEASE_REASON, "fixed it");
        job.job_removed(1, "by user");
        job.job_held(2, "policy", HOLD_CODE_JOB_POLICY, 0);
        job.job_held(3, "again", HOLD_CODE_JOB_POLICY, 0);
        let ad = job.ad();
        assert_eq!(ad.get_str(attr::LAST_RELEASE_REASON), Some("fixed it"));
        assert!(ad.get(attr::RELEASE_REASON).is_some_and(AdValue::is_undefined));
        assert_eq!(ad.get_int(attr::NUM_SYSTEM_HOLDS), Some(1));
        assert_eq!(
            ad.get_int(attr::JOB_STATUS_ON_RELEASE),
            Some(LocalStatus::Removed.code())
        );
        assert_eq!(ad.get_str(attr::HOLD_REASON), Some("policy"));
    }

    #[test]
    fn clear_request_with_remote_id_holds() {
        let mut job = batch_job();
        let mut h = Harness::new(&job);
        job.set_remote_id(Some("orphan.1".into()));
        job.set_phase(JobPhase::ClearRequest);
        h.eval(&mut job, 0);
        assert_eq!(job.local_status(), LocalStatus::Held);
        assert_eq!(
            job.ad().get_str(attr::HOLD_REASON),
            Some("Internal error: Attempting to clear request, but remote job id is still set")
        );
    }

    #[test]
    fn resource_key_includes_credential() {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, 1);
        ad.set(attr::PROC_ID, 0);
        ad.set(attr::GRID_RESOURCE, "gt2 gk.example.org/jobmanager-pbs");
        ad.set(attr::X509_USER_PROXY, "/tmp/x509up_u1");
        let job = JobStateMachine::new(ad).unwrap();
        assert_eq!(
            job.resource_key(),
            ResourceKey {
                kind: BackendKind::Gram2,
                endpoint: "gk.example.org/jobmanager-pbs".into(),
                credential: Some("/tmp/x509up_u1".into()),
            }
        );
    }
}
