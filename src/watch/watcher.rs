// src/watch/watcher.rs

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::RuntimeEvent;

/// Handle for the event-log watcher.
///
/// This exists mainly so the underlying `RecommendedWatcher` is kept alive for
/// as long as needed. Dropping this handle will stop file watching.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish()
    }
}

/// Watch the event log and send `RuntimeEvent::LogChanged` whenever it is
/// created or modified.
///
/// The parent directory is watched (non-recursively) so a log that does not
/// exist yet is still picked up once the first job writes to it.
pub fn spawn_log_watcher(
    log_path: impl Into<PathBuf>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> Result<WatcherHandle> {
    let log_path = log_path.into();
    let dir = match log_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = log_path
        .file_name()
        .map(|n| n.to_os_string())
        .with_context(|| format!("event log path {log_path:?} has no file name"))?;

    // Channel from the blocking notify callback into the async world.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(err) = event_tx.send(event) {
                    eprintln!("gridflow: failed to forward notify event: {err}");
                }
            }
            Err(err) => {
                eprintln!("gridflow: file watch error: {err}");
            }
        },
        Config::default(),
    )?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {dir:?}"))?;

    info!(path = ?log_path, "event log watcher started");

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !touches_file(&event, &file_name) {
                continue;
            }
            debug!(kind = ?event.kind, "event log changed");
            if runtime_tx.send(RuntimeEvent::LogChanged).await.is_err() {
                break;
            }
        }
        debug!("watcher event loop finished");
    });

    Ok(WatcherHandle { _inner: watcher })
}

fn touches_file(event: &Event, file_name: &std::ffi::OsStr) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

/// Poll fallback: send `LogChanged` every `interval`.
///
/// Watch notifications can be lost (network filesystems, overflowed
/// queues), so a run always has a poller as well.
pub fn spawn_log_poller(
    interval: Duration,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if runtime_tx.send(RuntimeEvent::LogChanged).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    #[test]
    fn only_create_and_modify_of_the_log_count() {
        let name = std::ffi::OsStr::new("dag.nodes.log");
        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/tmp/run/dag.nodes.log"));
        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/tmp/run/dag.rescue001"));
        let remove = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/tmp/run/dag.nodes.log"));
        assert!(touches_file(&modify, name));
        assert!(!touches_file(&other, name));
        assert!(!touches_file(&remove, name));
    }

    #[tokio::test]
    async fn poller_ticks() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_log_poller(Duration::from_millis(10), tx);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out");
        assert!(matches!(event, Some(RuntimeEvent::LogChanged)));
        handle.abort();
    }
}
