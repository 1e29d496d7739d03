use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use gridflow::grid::{BackendKind, RemoteBackend, RemoteOp, RemoteState, RemoteStatus, RpcReply};

/// One RPC as seen by a [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: BackendKind,
    pub endpoint: String,
    pub op: RemoteOp,
}

/// A `RemoteBackend` returning scripted replies.
///
/// Replies are queued per operation name (`"SUBMIT"`, `"STATUS"`, ...).
/// When a queue is empty the default is used: `SUBMIT` returns a fresh
/// remote id, `STATUS` reports a completed job with exit code 0, and every
/// other operation succeeds.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: Mutex<HashMap<&'static str, VecDeque<RpcReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    restarts: Mutex<Vec<BackendKind>>,
    next_id: Mutex<u64>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, op: &'static str, reply: RpcReply) -> Self {
        self.push(op, reply);
        self
    }

    pub fn push(&self, op: &'static str, reply: RpcReply) {
        self.replies
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of the operations called, in order.
    pub fn op_names(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|c| c.op.name()).collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.op.name() == op)
            .count()
    }

    pub fn restarts(&self) -> Vec<BackendKind> {
        self.restarts.lock().unwrap().clone()
    }

    fn next_reply(&self, op: &RemoteOp) -> RpcReply {
        if let Some(reply) = self
            .replies
            .lock()
            .unwrap()
            .get_mut(op.name())
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        match op {
            RemoteOp::Submit { .. } => {
                let mut n = self.next_id.lock().unwrap();
                *n += 1;
                RpcReply::Ok {
                    remote_id: Some(format!("remote-{n}")),
                }
            }
            RemoteOp::Status { .. } => {
                let mut status = RemoteStatus::new(RemoteState::Completed);
                status.exit_code = Some(0);
                RpcReply::Status(status)
            }
            _ => RpcReply::ok(),
        }
    }
}

impl RemoteBackend for ScriptedBackend {
    fn call<'a>(
        &'a self,
        kind: BackendKind,
        endpoint: &'a str,
        op: RemoteOp,
    ) -> Pin<Box<dyn Future<Output = RpcReply> + Send + 'a>> {
        Box::pin(async move {
            let reply = self.next_reply(&op);
            self.calls.lock().unwrap().push(RecordedCall {
                kind,
                endpoint: endpoint.to_string(),
                op,
            });
            reply
        })
    }

    fn restart_helper(
        &self,
        kind: BackendKind,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.restarts.lock().unwrap().push(kind);
            Ok(())
        })
    }
}
