// src/userlog/writer.rs

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::fs::FileSystem;
use crate::userlog::event::{LogEvent, LogEventKind, Termination};

/// Render one event in the classic text layout, including the `...`
/// terminator line.
pub fn format_event(event: &LogEvent) -> String {
    let id = event.id;
    let mut out = String::new();
    let header = match &event.kind {
        LogEventKind::Submit { .. } => "Job submitted from host: <gridflow>".to_string(),
        LogEventKind::Execute { host } => format!(
            "Job executing on host: {}",
            host.as_deref().unwrap_or("<unknown>")
        ),
        LogEventKind::Evicted => "Job was evicted.".to_string(),
        LogEventKind::Terminated(_) => "Job terminated.".to_string(),
        LogEventKind::Aborted { .. } => "Job was aborted.".to_string(),
        LogEventKind::Held { .. } => "Job was held.".to_string(),
        LogEventKind::Released => "Job was released.".to_string(),
        LogEventKind::GridResourceUp { .. } => "Grid Resource Back Up".to_string(),
        LogEventKind::GridResourceDown { .. } => "Detected Down Grid Resource".to_string(),
        LogEventKind::GridSubmit { .. } => "Job submitted to grid resource".to_string(),
        LogEventKind::Other(_) => "Generic event".to_string(),
    };
    let _ = writeln!(
        out,
        "{:03} ({:03}.{:03}.{:03}) {} {}",
        event.kind.code(),
        id.cluster,
        id.proc,
        id.subproc,
        event.timestamp,
        header
    );

    match &event.kind {
        LogEventKind::Submit { node: Some(node) } => {
            let _ = writeln!(out, "    DAG Node: {node}");
        }
        LogEventKind::Terminated(Termination::Normal(code)) => {
            let _ = writeln!(out, "\t(1) Normal termination (return value {code})");
        }
        LogEventKind::Terminated(Termination::Signal(sig)) => {
            let _ = writeln!(out, "\t(0) Abnormal termination (signal {sig})");
        }
        LogEventKind::Aborted { reason: Some(r) } | LogEventKind::Held { reason: Some(r) } => {
            let _ = writeln!(out, "\t{r}");
        }
        LogEventKind::GridResourceUp { resource } | LogEventKind::GridResourceDown { resource } => {
            let _ = writeln!(out, "    GridResource: {resource}");
        }
        LogEventKind::GridSubmit { resource, job_id } => {
            let _ = writeln!(out, "    GridResource: {resource}");
            let _ = writeln!(out, "    GridJobId: {job_id}");
        }
        _ => {}
    }
    out.push_str("...\n");
    out
}

/// Appends events to one event-log file.
#[derive(Debug, Clone)]
pub struct UserLogWriter {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl UserLogWriter {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, event: &LogEvent) -> Result<()> {
        self.fs
            .append_sync(&self.path, format_event(event).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CondorId;

    #[test]
    fn terminate_event_layout() {
        let ev = LogEvent {
            id: CondorId::new(17, 0, 0),
            timestamp: "10/17 12:03:10".into(),
            kind: LogEventKind::Terminated(Termination::Normal(0)),
        };
        assert_eq!(
            format_event(&ev),
            "005 (017.000.000) 10/17 12:03:10 Job terminated.\n\t(1) Normal termination (return value 0)\n...\n"
        );
    }

    #[test]
    fn submit_event_carries_node_tag() {
        let ev = LogEvent {
            id: CondorId::new(3, 1, 0),
            timestamp: "01/02 03:04:05".into(),
            kind: LogEventKind::Submit {
                node: Some("A".into()),
            },
        };
        let text = format_event(&ev);
        assert!(text.starts_with("000 (003.001.000) 01/02 03:04:05 "));
        assert!(text.contains("    DAG Node: A\n"));
    }
}
