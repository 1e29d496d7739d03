// src/exec/script_runner.rs

//! PRE/POST script runner.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::dag::ScriptRequest;
use crate::engine::RuntimeEvent;

/// Run one script in the background and report `ScriptFinished`.
///
/// A script that cannot be started, or dies from a signal, reports exit
/// code -1.
pub fn spawn_script(req: ScriptRequest, runtime_tx: mpsc::Sender<RuntimeEvent>) {
    tokio::spawn(async move {
        let exit_code = match run_script(&req).await {
            Ok(code) => code,
            Err(err) => {
                error!(node = %req.name, script = %req.kind, error = %err, "script execution error");
                -1
            }
        };
        let _ = runtime_tx
            .send(RuntimeEvent::ScriptFinished {
                node: req.node,
                kind: req.kind,
                exit_code,
            })
            .await;
    });
}

async fn run_script(req: &ScriptRequest) -> Result<i32> {
    info!(node = %req.name, script = %req.kind, cmd = %req.command, "starting script");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&req.command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&req.command);
        c
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !req.dir.as_os_str().is_empty() {
        cmd.current_dir(&req.dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {} script for node '{}'", req.kind, req.name))?;

    // Drain both pipes so a chatty script never blocks on a full buffer.
    for (stream, pipe) in [
        ("stdout", child.stdout.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>)),
        ("stderr", child.stderr.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>)),
    ] {
        if let Some(pipe) = pipe {
            let node = req.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(node = %node, stream, "{}", line);
                }
            });
        }
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for {} script of node '{}'", req.kind, req.name))?;
    let code = status.code().unwrap_or(-1);
    info!(node = %req.name, script = %req.kind, exit_code = code, "script exited");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ScriptKind;

    #[tokio::test]
    async fn reports_exit_code() {
        let (tx, mut rx) = mpsc::channel(4);
        spawn_script(
            ScriptRequest {
                node: 3,
                name: "A".into(),
                kind: ScriptKind::Post,
                command: "echo post A; exit 7".into(),
                dir: "".into(),
            },
            tx,
        );
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match event {
            RuntimeEvent::ScriptFinished {
                node,
                kind,
                exit_code,
            } => {
                assert_eq!(node, 3);
                assert_eq!(kind, ScriptKind::Post);
                assert_eq!(exit_code, 7);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
