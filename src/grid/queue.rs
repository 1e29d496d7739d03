// src/grid/queue.rs

//! The local job queue the gridmanager synchronises with.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{GridflowError, Result};
use crate::fs::FileSystem;
use crate::types::ProcId;

use super::ad::{attr, managed, AdValue, JobAd, LocalStatus};

/// Queue-side status of a job the gridmanager already manages.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub proc: ProcId,
    pub status: LocalStatus,
    pub reason: Option<String>,
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    /// Jobs eligible for management.
    pub new_jobs: Vec<JobAd>,
    /// Managed jobs the queue reports as REMOVED or HELD.
    pub statuses: Vec<QueueStatus>,
    /// Current `x509UserProxyExpiration` per proxy path.
    pub proxy_expirations: Vec<(String, i64)>,
}

/// Attribute writes for one job; `Undefined` deletes the attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueUpdate {
    pub proc: ProcId,
    pub set: Vec<(String, AdValue)>,
    /// Remove the job row after applying `set`.
    pub delete: bool,
}

pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Batched access to the job queue.
pub trait JobQueue: Send {
    /// Discovery pass. On first contact jobs already marked as managed by
    /// the gridmanager are returned as new too.
    fn query(&mut self, first_contact: bool) -> QueueFuture<'_, QueueSnapshot>;

    /// Apply updates in one transaction.
    fn commit(&mut self, updates: Vec<QueueUpdate>) -> QueueFuture<'_, ()>;
}

fn is_managed_externally(ad: &JobAd) -> bool {
    ad.get_str(attr::MANAGED)
        .is_some_and(|m| m.eq_ignore_ascii_case(managed::EXTERNAL))
}

/// Build a snapshot from the full set of queue rows.
pub fn snapshot_of<'a>(
    ads: impl IntoIterator<Item = &'a JobAd>,
    first_contact: bool,
) -> QueueSnapshot {
    let mut snap = QueueSnapshot::default();
    let mut proxies = BTreeMap::new();

    for ad in ads {
        let Some(proc) = ad.proc_id() else {
            continue;
        };
        let status = ad.local_status();
        let external = is_managed_externally(ad);

        let unmanaged_and_runnable = ad.get(attr::MANAGED).is_none()
            && matches!(status, Some(LocalStatus::Idle) | Some(LocalStatus::Running));
        let adopt = first_contact && external && status != Some(LocalStatus::Completed);
        if unmanaged_and_runnable || adopt {
            snap.new_jobs.push(ad.clone());
        } else if external {
            if let Some(s @ (LocalStatus::Removed | LocalStatus::Held)) = status {
                let reason = match s {
                    LocalStatus::Removed => ad.get_str(attr::REMOVE_REASON),
                    _ => ad.get_str(attr::HOLD_REASON),
                };
                snap.statuses.push(QueueStatus {
                    proc,
                    status: s,
                    reason: reason.map(str::to_string),
                });
            }
        }

        if let (Some(path), Some(exp)) = (
            ad.get_str(attr::X509_USER_PROXY),
            ad.get_int(attr::X509_USER_PROXY_EXPIRATION),
        ) {
            let slot = proxies.entry(path.to_string()).or_insert(exp);
            *slot = (*slot).max(exp);
        }
    }
    snap.proxy_expirations = proxies.into_iter().collect();
    snap
}

fn apply_update(rows: &mut BTreeMap<ProcId, JobAd>, update: QueueUpdate) {
    if update.delete {
        if rows.remove(&update.proc).is_none() {
            warn!(job = %update.proc, "queue delete for a job that is not in the queue");
        }
        return;
    }
    let Some(ad) = rows.get_mut(&update.proc) else {
        warn!(job = %update.proc, "queue update for a job that is not in the queue");
        return;
    };
    let mut kept = Vec::new();
    for (k, v) in ad.iter() {
        if !update.set.iter().any(|(name, _)| name.eq_ignore_ascii_case(k)) {
            kept.push((k.clone(), v.clone()));
        }
    }
    for (k, v) in update.set {
        if !v.is_undefined() {
            kept.push((k, v));
        }
    }
    *ad = JobAd::from_attrs(kept);
}

/// Queue held in memory and shared between clones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobQueue {
    rows: Arc<Mutex<BTreeMap<ProcId, JobAd>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<ProcId, JobAd>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a job row. Rows without a cluster/proc id are ignored.
    pub fn insert(&self, ad: JobAd) {
        if let Some(proc) = ad.proc_id() {
            let mut ad = ad;
            ad.clear_dirty();
            self.rows().insert(proc, ad);
        }
    }

    pub fn get(&self, proc: ProcId) -> Option<JobAd> {
        self.rows().get(&proc).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    /// User hold, as `condor_hold` would do it.
    pub fn hold(&self, proc: ProcId, reason: &str) {
        self.edit(proc, |ad| {
            ad.set(attr::JOB_STATUS, LocalStatus::Held.code());
            ad.set(attr::HOLD_REASON, reason);
        });
    }

    /// User removal, as `condor_rm` would do it.
    pub fn remove(&self, proc: ProcId, reason: &str) {
        self.edit(proc, |ad| {
            ad.set(attr::JOB_STATUS, LocalStatus::Removed.code());
            ad.set(attr::REMOVE_REASON, reason);
        });
    }

    /// User release: back to idle and handed to the gridmanager again.
    pub fn release(&self, proc: ProcId, reason: &str) {
        self.edit(proc, |ad| {
            ad.set(attr::JOB_STATUS, LocalStatus::Idle.code());
            ad.set(attr::RELEASE_REASON, reason);
            ad.set_undefined(attr::HOLD_REASON);
        });
        let mut rows = self.rows();
        if let Some(ad) = rows.get_mut(&proc) {
            let kept: Vec<_> = ad
                .iter()
                .filter(|(k, v)| !k.eq_ignore_ascii_case(attr::MANAGED) && !v.is_undefined())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            *ad = JobAd::from_attrs(kept);
        }
    }

    /// Change an attribute from outside the gridmanager.
    pub fn set_attr(&self, proc: ProcId, name: &str, value: impl Into<AdValue>) {
        let value = value.into();
        self.edit(proc, |ad| ad.set(name, value));
    }

    fn edit(&self, proc: ProcId, f: impl FnOnce(&mut JobAd)) {
        if let Some(ad) = self.rows().get_mut(&proc) {
            f(ad);
            ad.clear_dirty();
        }
    }
}

impl JobQueue for InMemoryJobQueue {
    fn query(&mut self, first_contact: bool) -> QueueFuture<'_, QueueSnapshot> {
        let snap = snapshot_of(self.rows().values(), first_contact);
        Box::pin(async move { Ok(snap) })
    }

    fn commit(&mut self, updates: Vec<QueueUpdate>) -> QueueFuture<'_, ()> {
        let mut rows = self.rows();
        for update in updates {
            apply_update(&mut rows, update);
        }
        drop(rows);
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    job: Vec<BTreeMap<String, AdValue>>,
}

/// Queue persisted as a TOML file of `[[job]]` tables.
#[derive(Debug, Clone)]
pub struct FileJobQueue {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl FileJobQueue {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All rows in file order.
    pub fn load(&self) -> Result<Vec<JobAd>> {
        if !self.fs.exists(&self.path) {
            return Ok(Vec::new());
        }
        let text = self.fs.read_to_string(&self.path)?;
        let file: QueueFile = toml::from_str(&text)?;
        Ok(file.job.into_iter().map(JobAd::from_attrs).collect())
    }

    fn store(&self, ads: &[JobAd]) -> Result<()> {
        let file = QueueFile {
            job: ads
                .iter()
                .map(|ad| {
                    ad.iter()
                        .filter(|(_, v)| !v.is_undefined())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .collect(),
        };
        let text = toml::to_string(&file)
            .map_err(|e| GridflowError::ConfigError(format!("serialising job queue: {e}")))?;
        self.fs
            .write(&self.path, text.as_bytes())
            .with_context(|| format!("writing job queue {:?}", self.path))?;
        Ok(())
    }
}

impl JobQueue for FileJobQueue {
    fn query(&mut self, first_contact: bool) -> QueueFuture<'_, QueueSnapshot> {
        Box::pin(async move {
            let ads = self.load()?;
            Ok(snapshot_of(&ads, first_contact))
        })
    }

    fn commit(&mut self, updates: Vec<QueueUpdate>) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            let ads = self.load()?;
            let order: Vec<ProcId> = ads.iter().filter_map(JobAd::proc_id).collect();
            let mut rows: BTreeMap<ProcId, JobAd> =
                ads.into_iter().filter_map(|ad| Some((ad.proc_id()?, ad))).collect();
            debug!(updates = updates.len(), path = ?self.path, "committing queue updates");
            for update in updates {
                apply_update(&mut rows, update);
            }
            let kept: Vec<JobAd> = order.iter().filter_map(|p| rows.remove(p)).collect();
            self.store(&kept)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn job(cluster: i64, status: LocalStatus) -> JobAd {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, cluster);
        ad.set(attr::PROC_ID, 0);
        ad.set(attr::JOB_STATUS, status.code());
        ad.set(attr::GRID_RESOURCE, "batch pbs");
        ad
    }

    #[test]
    fn eligibility_rules() {
        let fresh = job(1, LocalStatus::Idle);
        let held = job(2, LocalStatus::Held);
        let mut adopted = job(3, LocalStatus::Running);
        adopted.set(attr::MANAGED, managed::EXTERNAL);
        let mut removed = job(4, LocalStatus::Removed);
        removed.set(attr::MANAGED, managed::EXTERNAL);
        removed.set(attr::REMOVE_REASON, "by user");
        let ads = [fresh, held, adopted, removed];

        let later = snapshot_of(&ads, false);
        assert_eq!(later.new_jobs.len(), 1);
        assert_eq!(later.new_jobs[0].proc_id(), Some(ProcId::new(1, 0)));
        assert_eq!(later.statuses.len(), 1);
        assert_eq!(later.statuses[0].reason.as_deref(), Some("by user"));

        let first = snapshot_of(&ads, true);
        let ids: Vec<_> = first.new_jobs.iter().filter_map(JobAd::proc_id).collect();
        assert_eq!(
            ids,
            vec![ProcId::new(1, 0), ProcId::new(3, 0), ProcId::new(4, 0)]
        );
    }

    #[tokio::test]
    async fn in_memory_commit_sets_and_deletes() {
        let mut q = InMemoryJobQueue::new();
        q.insert(job(7, LocalStatus::Idle));
        q.commit(vec![QueueUpdate {
            proc: ProcId::new(7, 0),
            set: vec![
                (attr::MANAGED.into(), managed::EXTERNAL.into()),
                (attr::GRID_RESOURCE.into(), AdValue::Undefined),
            ],
            delete: false,
        }])
        .await
        .unwrap();
        let ad = q.get(ProcId::new(7, 0)).unwrap();
        assert_eq!(ad.get_str(attr::MANAGED), Some(managed::EXTERNAL));
        assert!(ad.get(attr::GRID_RESOURCE).is_none());

        q.commit(vec![QueueUpdate {
            proc: ProcId::new(7, 0),
            set: Vec::new(),
            delete: true,
        }])
        .await
        .unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn file_queue_round_trips_through_toml() {
        let fs = Arc::new(MockFileSystem::new());
        fs.write(
            Path::new("queue.toml"),
            br#"
[[job]]
ClusterId = 12
ProcId = 0
JobStatus = 1
GridResource = "gt2 gatekeeper.example.org"
x509userproxy = "/tmp/x509up_u500"
x509UserProxyExpiration = 90000
"#,
        )
        .unwrap();
        let mut q = FileJobQueue::new(fs.clone(), "queue.toml");
        let snap = q.query(false).await.unwrap();
        assert_eq!(snap.new_jobs.len(), 1);
        assert_eq!(
            snap.proxy_expirations,
            vec![("/tmp/x509up_u500".to_string(), 90000)]
        );

        q.commit(vec![QueueUpdate {
            proc: ProcId::new(12, 0),
            set: vec![(attr::GRID_JOB_ID.into(), "https://gk/123".into())],
            delete: false,
        }])
        .await
        .unwrap();
        let ads = q.load().unwrap();
        assert_eq!(ads[0].get_str(attr::GRID_JOB_ID), Some("https://gk/123"));
        assert_eq!(ads[0].get_int(attr::CLUSTER_ID), Some(12));
    }
}
