// src/dag/recovery.rs

//! Write-ahead recovery log.
//!
//! One record per line, appended and fsynced before the action it protects
//! is started. Replay happens strictly in file order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::dag::node::NodeId;
use crate::errors::{GridflowError, Result};
use crate::fs::FileSystem;
use crate::types::CondorId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryRecord {
    Initialize { node_count: usize, digest: String },
    DoneInitialize,
    SubmitJob { node: NodeId },
    SetCondorId { node: NodeId, id: CondorId },
    TerminateJob { node: NodeId, return_value: i32 },
    /// The submission of `node` failed; it was never queued.
    UndoJob { node: NodeId },
}

impl fmt::Display for RecoveryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryRecord::Initialize { node_count, digest } => {
                write!(f, "Initialize {node_count} {digest}")
            }
            RecoveryRecord::DoneInitialize => f.write_str("DoneInitialize"),
            RecoveryRecord::SubmitJob { node } => write!(f, "SubmitJob {node}"),
            RecoveryRecord::SetCondorId { node, id } => write!(
                f,
                "SetCondorID {node} {} {} {}",
                id.cluster, id.proc, id.subproc
            ),
            RecoveryRecord::TerminateJob { node, return_value } => {
                write!(f, "TerminateJob {node} {return_value}")
            }
            RecoveryRecord::UndoJob { node } => write!(f, "UndoJob {node}"),
        }
    }
}

impl FromStr for RecoveryRecord {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&tag, args)) = tokens.split_first() else {
            return Err("empty record".to_string());
        };

        fn int<T: FromStr>(args: &[&str], i: usize, line: &str) -> std::result::Result<T, String> {
            args.get(i)
                .ok_or_else(|| format!("missing field {} in '{line}'", i + 1))?
                .parse::<T>()
                .map_err(|_| format!("bad field {} in '{line}'", i + 1))
        }

        let expect = |n: usize| -> std::result::Result<(), String> {
            if args.len() == n {
                Ok(())
            } else {
                Err(format!("'{tag}' expects {n} fields, got {}: '{line}'", args.len()))
            }
        };

        match tag {
            "Initialize" => {
                expect(2)?;
                Ok(RecoveryRecord::Initialize {
                    node_count: int(args, 0, line)?,
                    digest: args[1].to_string(),
                })
            }
            "DoneInitialize" => {
                expect(0)?;
                Ok(RecoveryRecord::DoneInitialize)
            }
            "SubmitJob" => {
                expect(1)?;
                Ok(RecoveryRecord::SubmitJob {
                    node: int(args, 0, line)?,
                })
            }
            "SetCondorID" => {
                expect(4)?;
                Ok(RecoveryRecord::SetCondorId {
                    node: int(args, 0, line)?,
                    id: CondorId::new(int(args, 1, line)?, int(args, 2, line)?, int(args, 3, line)?),
                })
            }
            "TerminateJob" => {
                expect(2)?;
                Ok(RecoveryRecord::TerminateJob {
                    node: int(args, 0, line)?,
                    return_value: int(args, 1, line)?,
                })
            }
            "UndoJob" => {
                expect(1)?;
                Ok(RecoveryRecord::UndoJob {
                    node: int(args, 0, line)?,
                })
            }
            other => Err(format!("unknown record type '{other}'")),
        }
    }
}

/// Records read back from disk, plus one warning per skipped line.
#[derive(Debug, Default, Clone)]
pub struct RecoveryContents {
    pub records: Vec<RecoveryRecord>,
    pub warnings: Vec<String>,
}

/// Append-only recovery log file.
#[derive(Debug, Clone)]
pub struct RecoveryLog {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl RecoveryLog {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the log for a fresh run.
    pub fn reset(&self) -> Result<()> {
        self.fs.write(&self.path, b"")?;
        Ok(())
    }

    /// Append one record and flush it to stable storage.
    pub fn append(&self, record: &RecoveryRecord) -> Result<()> {
        let line = format!("{record}\n");
        self.fs
            .append_sync(&self.path, line.as_bytes())
            .map_err(|e| {
                GridflowError::RecoveryLog(format!(
                    "appending '{record}' to {:?}: {e:#}",
                    self.path
                ))
            })
    }

    /// Read every record in file order. A missing file reads as empty.
    ///
    /// Lines that do not parse are skipped (the reader resynchronizes on
    /// the next parseable line) and reported as warnings.
    pub fn read_all(&self) -> Result<RecoveryContents> {
        if !self.fs.exists(&self.path) {
            return Ok(RecoveryContents::default());
        }
        let text = self.fs.read_to_string(&self.path).map_err(|e| {
            GridflowError::RecoveryLog(format!("reading {:?}: {e:#}", self.path))
        })?;

        let mut out = RecoveryContents::default();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<RecoveryRecord>() {
                Ok(record) => out.records.push(record),
                Err(e) => {
                    let msg = format!("{:?}:{}: skipping unparsable record: {e}", self.path, lineno + 1);
                    warn!("{msg}");
                    out.warnings.push(msg);
                }
            }
        }
        Ok(out)
    }
}
