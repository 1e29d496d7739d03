// src/grid/helper_backend.rs

//! `RemoteBackend` that runs an external helper program per operation.
//!
//! Invocation: `<helper> <backend> <OPERATION> <endpoint> [args...]`.
//! The helper prints one reply line on stdout:
//!
//! ```text
//! OK [remote_id]
//! STATUS <state> [exit=<n>] [time=<t>] [reason=<text>]
//! GONE
//! ERROR <message>
//! UNREACHABLE <message>
//! ```

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::backend::{BackendKind, RemoteBackend, RemoteOp, RemoteStatus, RpcReply};

#[derive(Debug, Clone)]
pub struct HelperBackend {
    command: String,
    timeout: Duration,
}

impl HelperBackend {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    async fn invoke(&self, kind: BackendKind, endpoint: &str, op: RemoteOp) -> RpcReply {
        let mut cmd = Command::new(&self.command);
        cmd.arg(kind.as_str())
            .arg(op.name())
            .arg(endpoint)
            .args(op.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(backend = %kind, endpoint, op = op.name(), "running helper");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                return RpcReply::Error(format!(
                    "{} timed out after {}s",
                    op.name(),
                    self.timeout.as_secs()
                ));
            }
            Ok(Err(e)) => {
                return RpcReply::Error(format!("failed to run helper '{}': {e}", self.command));
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(line) => parse_reply(line),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                RpcReply::Error(format!(
                    "helper exited with {} without a reply: {}",
                    output.status,
                    stderr.trim()
                ))
            }
        }
    }
}

impl RemoteBackend for HelperBackend {
    fn call<'a>(
        &'a self,
        kind: BackendKind,
        endpoint: &'a str,
        op: RemoteOp,
    ) -> Pin<Box<dyn Future<Output = RpcReply> + Send + 'a>> {
        Box::pin(self.invoke(kind, endpoint, op))
    }

    fn restart_helper(
        &self,
        kind: BackendKind,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            warn!(backend = %kind, "restarting helper");
            let output = Command::new(&self.command)
                .arg(kind.as_str())
                .arg("RESTART")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .with_context(|| format!("spawning helper '{}'", self.command))?;
            if !output.status.success() {
                bail!(
                    "helper restart for {kind} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            info!(backend = %kind, "helper restarted");
            Ok(())
        })
    }
}

/// Parse one helper reply line.
pub fn parse_reply(line: &str) -> RpcReply {
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    match word.to_ascii_uppercase().as_str() {
        "OK" => RpcReply::Ok {
            remote_id: (!rest.is_empty()).then(|| rest.to_string()),
        },
        "GONE" => RpcReply::Gone,
        "ERROR" => RpcReply::Error(rest.to_string()),
        "UNREACHABLE" => RpcReply::Unreachable(rest.to_string()),
        "STATUS" => parse_status(rest),
        _ => RpcReply::Error(format!("malformed helper reply: {line}")),
    }
}

fn parse_status(rest: &str) -> RpcReply {
    let (state, mut fields) = match rest.split_once(char::is_whitespace) {
        Some((s, f)) => (s, f.trim()),
        None => (rest, ""),
    };
    let state = match state.parse() {
        Ok(s) => s,
        Err(e) => return RpcReply::Error(e),
    };
    let mut status = RemoteStatus::new(state);

    while !fields.is_empty() {
        if let Some(reason) = fields.strip_prefix("reason=") {
            status.reason = Some(reason.to_string());
            break;
        }
        let (field, tail) = match fields.split_once(char::is_whitespace) {
            Some((f, t)) => (f, t.trim_start()),
            None => (fields, ""),
        };
        match field.split_once('=') {
            Some(("exit", v)) => status.exit_code = v.parse().ok(),
            Some(("time", v)) => status.server_time = v.parse().ok(),
            _ => return RpcReply::Error(format!("malformed status field '{field}'")),
        }
        fields = tail;
    }
    RpcReply::Status(status)
}
