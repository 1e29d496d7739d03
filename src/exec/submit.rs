// src/exec/submit.rs

//! `condor_submit` / `condor_rm` invocation.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::dag::SubmitRequest;
use crate::types::CondorId;

static SUBMITTED: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(\d+) job\(s\) submitted to cluster (\d+)"));

/// Extract the first job id from `condor_submit` output.
pub fn parse_submit_output(stdout: &str) -> Option<CondorId> {
    let re = SUBMITTED.as_ref().ok()?;
    let caps = re.captures(stdout)?;
    let cluster = caps[2].parse().ok()?;
    Some(CondorId::new(cluster, 0, 0))
}

/// Submit one node job and return its id.
///
/// The node name is tagged onto the job so the submit event in the event
/// log can be matched back to the node.
pub async fn run_submit(command: &str, req: &SubmitRequest, event_log: &Path) -> Result<CondorId> {
    let mut cmd = Command::new(command);
    cmd.arg("-a")
        .arg(format!("dag_node_name = {}", req.name))
        .arg("-a")
        .arg(format!("log = {}", event_log.display()))
        .arg(&req.submit_file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !req.dir.as_os_str().is_empty() {
        cmd.current_dir(&req.dir);
    }

    debug!(node = %req.name, command, submit_file = ?req.submit_file, "running submit command");
    let output = cmd
        .output()
        .await
        .with_context(|| format!("spawning '{command}' for node '{}'", req.name))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "'{command}' for node '{}' exited with {}: {}",
            req.name,
            output.status,
            stderr.trim()
        );
    }

    let id = parse_submit_output(&stdout).ok_or_else(|| {
        anyhow!(
            "could not find a job id in '{command}' output for node '{}': {}",
            req.name,
            stdout.trim()
        )
    })?;
    info!(node = %req.name, %id, "node job submitted");
    Ok(id)
}

/// Remove jobs from the queue.
pub async fn run_remove(command: &str, ids: &[CondorId]) -> Result<()> {
    let output = Command::new(command)
        .args(ids.iter().map(|id| id.proc_id().to_string()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("spawning '{command}'"))?;
    if !output.status.success() {
        bail!(
            "'{command}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
