// src/userlog/reader.rs

//! Incremental event-log reader.
//!
//! The reader remembers a byte offset and only ever consumes complete
//! events (terminated by a `...` line). A malformed event is skipped by
//! resynchronizing on the next terminator; the skip is reported as a
//! warning rather than an error so one bad record never wedges the reader.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{GridflowError, Result};
use crate::fs::FileSystem;
use crate::types::CondorId;
use crate::userlog::event::{LogEvent, LogEventKind, Termination};

struct Patterns {
    header: Regex,
    normal: Regex,
    signal: Regex,
}

impl Patterns {
    fn compile() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            header: Regex::new(
                r"^(\d{3}) \((\d+)\.(\d+)\.(\d+)\) (\d{2}/\d{2} \d{2}:\d{2}:\d{2}) ?(.*)$",
            )?,
            normal: Regex::new(r"Normal termination \(return value (-?\d+)\)")?,
            signal: Regex::new(r"Abnormal termination \(signal (\d+)\)")?,
        })
    }
}

static PATTERNS: LazyLock<std::result::Result<Patterns, regex::Error>> =
    LazyLock::new(Patterns::compile);

/// Result of one read pass.
#[derive(Debug, Default, Clone)]
pub struct ReadBatch {
    pub events: Vec<LogEvent>,
    /// Human-readable description of every record skipped while
    /// resynchronizing.
    pub warnings: Vec<String>,
}

/// Parse as many complete events as `text` holds.
///
/// Returns the batch and the number of bytes consumed; a trailing partial
/// event is left unconsumed.
pub fn parse_events(text: &str) -> (ReadBatch, usize) {
    parse_event_bytes(text.as_bytes())
}

/// Like [`parse_events`], over raw file contents.
///
/// Lines are split on the raw bytes and decoded one at a time, so the
/// consumed count is a byte offset into `bytes` even when a record holds
/// invalid UTF-8.
pub fn parse_event_bytes(bytes: &[u8]) -> (ReadBatch, usize) {
    let mut batch = ReadBatch::default();
    let mut consumed = 0usize;
    let mut block: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    for line in bytes.split_inclusive(|b| *b == b'\n') {
        cursor += line.len();
        if line.last() != Some(&b'\n') {
            // Incomplete trailing line; wait for the writer to finish it.
            break;
        }
        let decoded = String::from_utf8_lossy(line);
        let trimmed = decoded.trim_end_matches(['\n', '\r']);
        if trimmed == "..." {
            let lines: Vec<&str> = block.iter().map(String::as_str).collect();
            match parse_block(&lines) {
                Ok(Some(event)) => batch.events.push(event),
                Ok(None) => {}
                Err(msg) => {
                    warn!(error = %msg, "skipping malformed event-log record");
                    batch.warnings.push(msg);
                }
            }
            block.clear();
            consumed = cursor;
        } else {
            block.push(trimmed.to_string());
        }
    }

    (batch, consumed)
}

fn parse_block(lines: &[&str]) -> std::result::Result<Option<LogEvent>, String> {
    let mut iter = lines.iter().skip_while(|l| l.trim().is_empty());
    let Some(header) = iter.next() else {
        return Ok(None);
    };
    let patterns = PATTERNS
        .as_ref()
        .map_err(|e| format!("event-log patterns failed to compile: {e}"))?;
    let caps = patterns
        .header
        .captures(header)
        .ok_or_else(|| format!("unparsable event header: '{header}'"))?;

    let num = |i: usize| -> std::result::Result<i64, String> {
        caps[i]
            .parse::<i64>()
            .map_err(|e| format!("bad number in '{header}': {e}"))
    };
    let code = num(1)? as u16;
    let id = CondorId::new(num(2)?, num(3)?, num(4)?);
    let timestamp = caps[5].to_string();
    let message = caps[6].trim().to_string();
    let body: Vec<&str> = iter.map(|l| l.trim()).filter(|l| !l.is_empty()).collect();

    let field = |name: &str| -> Option<String> {
        body.iter()
            .find_map(|l| l.strip_prefix(name))
            .map(|v| v.trim().to_string())
    };

    let kind = match code {
        0 => LogEventKind::Submit {
            node: field("DAG Node:"),
        },
        1 => LogEventKind::Execute {
            host: message
                .strip_prefix("Job executing on host:")
                .map(|h| h.trim().to_string()),
        },
        4 => LogEventKind::Evicted,
        5 => {
            let term = body
                .iter()
                .find_map(|l| {
                    if let Some(c) = patterns.normal.captures(l) {
                        c[1].parse().ok().map(Termination::Normal)
                    } else if let Some(c) = patterns.signal.captures(l) {
                        c[1].parse().ok().map(Termination::Signal)
                    } else {
                        None
                    }
                })
                .ok_or_else(|| format!("terminate event for {id} has no exit status"))?;
            LogEventKind::Terminated(term)
        }
        9 => LogEventKind::Aborted {
            reason: body.first().map(|s| s.to_string()),
        },
        12 => LogEventKind::Held {
            reason: body.first().map(|s| s.to_string()),
        },
        13 => LogEventKind::Released,
        25 => LogEventKind::GridResourceUp {
            resource: field("GridResource:").unwrap_or_default(),
        },
        26 => LogEventKind::GridResourceDown {
            resource: field("GridResource:").unwrap_or_default(),
        },
        27 => LogEventKind::GridSubmit {
            resource: field("GridResource:").unwrap_or_default(),
            job_id: field("GridJobId:").unwrap_or_default(),
        },
        other => LogEventKind::Other(other),
    };

    Ok(Some(LogEvent {
        id,
        timestamp,
        kind,
    }))
}

/// Sequential reader over one event-log file.
#[derive(Debug)]
pub struct EventLogReader {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    offset: u64,
}

impl EventLogReader {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Start reading at the current end of the file. Used on a fresh run so
    /// events left behind by an earlier DAG are not attributed to this one.
    pub fn skip_to_end(&mut self) {
        self.offset = self.fs.len(&self.path).unwrap_or(0);
    }

    /// Read every complete event appended since the last call.
    ///
    /// A missing file is not an error (no job has logged anything yet).
    /// A read failure is retried once, and a file that shrank below the
    /// current offset is re-read from the start; both are warnings.
    pub fn read_new(&mut self) -> Result<ReadBatch> {
        if !self.fs.exists(&self.path) {
            return Ok(ReadBatch::default());
        }

        let mut warnings = Vec::new();

        match self.fs.len(&self.path) {
            Ok(len) if len < self.offset => {
                let msg = format!(
                    "event log {:?} shrank from {} to {} bytes; rereading from start",
                    self.path, self.offset, len
                );
                warn!("{msg}");
                warnings.push(msg);
                self.offset = 0;
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "could not stat event log"),
        }

        let bytes = match self.fs.read_from(&self.path, self.offset) {
            Ok(b) => b,
            Err(first) => {
                warn!(error = %first, path = ?self.path, "event log read failed; resynchronizing");
                self.fs.read_from(&self.path, self.offset).map_err(|e| {
                    GridflowError::EventLog(format!(
                        "reading {:?} at offset {} failed after resync: {e}",
                        self.path, self.offset
                    ))
                })?
            }
        };

        let (mut batch, consumed) = parse_event_bytes(&bytes);
        self.offset += consumed as u64;
        warnings.append(&mut batch.warnings);
        batch.warnings = warnings;
        Ok(batch)
    }
}
