// src/grid/backend.rs

//! Remote backend kinds, their capabilities, and the RPC interface the job
//! state machines talk through.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use super::ad::JobAd;
use super::phase::RemoteState;

/// Grid type named by the first token of `GridResource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    Condor,
    Gram2,
    Gram3,
    Gram4,
    Nordugrid,
    Unicore,
    Batch,
    Oracle,
    Mirror,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Condor => "condor",
            BackendKind::Gram2 => "gt2",
            BackendKind::Gram3 => "gt3",
            BackendKind::Gram4 => "gt4",
            BackendKind::Nordugrid => "nordugrid",
            BackendKind::Unicore => "unicore",
            BackendKind::Batch => "batch",
            BackendKind::Oracle => "oracle",
            BackendKind::Mirror => "mirror",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        let none = Capabilities::default();
        match self {
            BackendKind::Condor => Capabilities {
                remote_hold_release: true,
                stage_in: true,
                stage_out: true,
                credential_delegation: true,
                recovery_query: true,
                ..none
            },
            BackendKind::Gram2 | BackendKind::Gram3 => Capabilities {
                callbacks: true,
                two_phase_commit: true,
                credential_required: true,
                credential_delegation: true,
                ..none
            },
            BackendKind::Gram4 => Capabilities {
                callbacks: true,
                two_phase_commit: true,
                lifetime_extension: true,
                credential_required: true,
                credential_delegation: true,
                ..none
            },
            BackendKind::Nordugrid => Capabilities {
                credential_required: true,
                stage_in: true,
                stage_out: true,
                ..none
            },
            BackendKind::Unicore => Capabilities {
                credential_required: true,
                recovery_query: true,
                ..none
            },
            BackendKind::Batch => none,
            BackendKind::Oracle => Capabilities {
                two_phase_commit: true,
                ..none
            },
            BackendKind::Mirror => Capabilities {
                failover: true,
                recovery_query: true,
                ..none
            },
        }
    }

    /// Split a `GridResource` value into backend kind and endpoint.
    ///
    /// Errors carry the hold reason used when the job cannot be managed.
    pub fn parse_grid_resource(value: Option<&str>) -> Result<(BackendKind, String), String> {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        let Some(value) = value else {
            return Err("GridResource is not set".to_string());
        };
        let mut parts = value.splitn(2, char::is_whitespace);
        let kind = parts
            .next()
            .unwrap_or_default()
            .parse::<BackendKind>()
            .map_err(|_| "Unsupported grid type".to_string())?;
        let endpoint = parts.next().map(str::trim).unwrap_or_default().to_string();
        Ok((kind, endpoint))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "condor" => BackendKind::Condor,
            "gt2" | "gram2" => BackendKind::Gram2,
            "gt3" | "gram3" => BackendKind::Gram3,
            "gt4" | "gram4" => BackendKind::Gram4,
            "nordugrid" => BackendKind::Nordugrid,
            "unicore" => BackendKind::Unicore,
            "batch" | "pbs" | "lsf" => BackendKind::Batch,
            "oracle" => BackendKind::Oracle,
            "mirror" => BackendKind::Mirror,
            other => return Err(format!("unsupported grid type '{other}'")),
        })
    }
}

/// What a backend supports; the shared state machine skips phases a
/// backend lacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Pushes status changes; jobs re-register after a restart.
    pub callbacks: bool,
    pub two_phase_commit: bool,
    pub lifetime_extension: bool,
    pub remote_hold_release: bool,
    pub stage_in: bool,
    pub stage_out: bool,
    pub credential_required: bool,
    pub credential_delegation: bool,
    pub recovery_query: bool,
    pub failover: bool,
}

/// One operation sent to a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Ping,
    Submit {
        description: String,
        lifetime_until: Option<i64>,
    },
    Register { remote_id: String },
    Commit { remote_id: String },
    StageIn { remote_id: String },
    StageOut { remote_id: String },
    Status { remote_id: String },
    Cancel { remote_id: String },
    Hold { remote_id: String, reason: String },
    Release { remote_id: String },
    RefreshProxy { remote_id: String, proxy: String },
    ExtendLifetime { remote_id: String, until: i64 },
    Destroy { remote_id: String },
}

impl RemoteOp {
    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteOp::Ping => "PING",
            RemoteOp::Submit { .. } => "SUBMIT",
            RemoteOp::Register { .. } => "REGISTER",
            RemoteOp::Commit { .. } => "COMMIT",
            RemoteOp::StageIn { .. } => "STAGE_IN",
            RemoteOp::StageOut { .. } => "STAGE_OUT",
            RemoteOp::Status { .. } => "STATUS",
            RemoteOp::Cancel { .. } => "CANCEL",
            RemoteOp::Hold { .. } => "HOLD",
            RemoteOp::Release { .. } => "RELEASE",
            RemoteOp::RefreshProxy { .. } => "REFRESH_PROXY",
            RemoteOp::ExtendLifetime { .. } => "EXTEND_LIFETIME",
            RemoteOp::Destroy { .. } => "DESTROY",
        }
    }

    /// Positional arguments following the endpoint.
    pub fn args(&self) -> Vec<String> {
        match self {
            RemoteOp::Ping => Vec::new(),
            RemoteOp::Submit {
                description,
                lifetime_until,
            } => {
                let mut args = vec![description.clone()];
                if let Some(until) = lifetime_until {
                    args.push(until.to_string());
                }
                args
            }
            RemoteOp::Register { remote_id }
            | RemoteOp::Commit { remote_id }
            | RemoteOp::StageIn { remote_id }
            | RemoteOp::StageOut { remote_id }
            | RemoteOp::Status { remote_id }
            | RemoteOp::Cancel { remote_id }
            | RemoteOp::Release { remote_id }
            | RemoteOp::Destroy { remote_id } => vec![remote_id.clone()],
            RemoteOp::Hold { remote_id, reason } => vec![remote_id.clone(), reason.clone()],
            RemoteOp::RefreshProxy { remote_id, proxy } => vec![remote_id.clone(), proxy.clone()],
            RemoteOp::ExtendLifetime { remote_id, until } => {
                vec![remote_id.clone(), until.to_string()]
            }
        }
    }
}

/// Status of a remote job as reported by a probe or a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub state: RemoteState,
    pub exit_code: Option<i32>,
    /// Server-side timestamp of the report, if the backend provides one.
    pub server_time: Option<i64>,
    pub reason: Option<String>,
}

impl RemoteStatus {
    pub fn new(state: RemoteState) -> Self {
        Self {
            state,
            exit_code: None,
            server_time: None,
            reason: None,
        }
    }

    pub fn at(mut self, server_time: i64) -> Self {
        self.server_time = Some(server_time);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// Outcome of one RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    Ok { remote_id: Option<String> },
    Status(RemoteStatus),
    /// The remote side does not know the job.
    Gone,
    /// The remote side rejected the request, or it timed out.
    Error(String),
    /// The resource could not be contacted at all.
    Unreachable(String),
}

impl RpcReply {
    pub fn ok() -> Self {
        RpcReply::Ok { remote_id: None }
    }
}

/// Async transport to remote resources.
pub trait RemoteBackend: Send + Sync {
    fn call<'a>(
        &'a self,
        kind: BackendKind,
        endpoint: &'a str,
        op: RemoteOp,
    ) -> Pin<Box<dyn Future<Output = RpcReply> + Send + 'a>>;

    /// Kill and restart whatever helper serves `kind`.
    fn restart_helper(
        &self,
        kind: BackendKind,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Attributes never forwarded in a submit description.
const LOCAL_ONLY: &[&str] = &[
    "ClusterId",
    "ProcId",
    "JobStatus",
    "EnteredCurrentStatus",
    "GridResource",
    "GridResourceFailover",
    "GridJobId",
    "GridJobStatus",
    "Managed",
    "UserLog",
    "NumGridSubmits",
    "NumSystemHolds",
    "HoldReason",
    "HoldReasonCode",
    "HoldReasonSubCode",
    "ReleaseReason",
    "LastReleaseReason",
];

/// Build the backend-specific submit description from the job ad.
pub fn submit_description(kind: BackendKind, ad: &JobAd) -> String {
    let forwarded = ad
        .iter()
        .filter(|(k, v)| {
            !v.is_undefined() && !LOCAL_ONLY.iter().any(|l| l.eq_ignore_ascii_case(k))
        })
        .collect::<Vec<_>>();

    match kind {
        // RSL / xRSL: &(attr=value)(attr=value)
        BackendKind::Gram2 | BackendKind::Gram3 | BackendKind::Gram4 | BackendKind::Nordugrid => {
            let mut out = String::from("&");
            for (k, v) in forwarded {
                out.push_str(&format!("({}={})", k.to_ascii_lowercase(), v));
            }
            out
        }
        // ClassAd lines.
        _ => forwarded
            .into_iter()
            .map(|(k, v)| format!("{k} = {v}"))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ad::attr;

    #[test]
    fn grid_resource_parsing() {
        assert_eq!(
            BackendKind::parse_grid_resource(Some("condor schedd.example.org cm.example.org")),
            Ok((
                BackendKind::Condor,
                "schedd.example.org cm.example.org".to_string()
            ))
        );
        assert_eq!(
            BackendKind::parse_grid_resource(Some("  ")),
            Err("GridResource is not set".to_string())
        );
        assert_eq!(
            BackendKind::parse_grid_resource(Some("teleport far.away")),
            Err("Unsupported grid type".to_string())
        );
    }

    #[test]
    fn capability_table() {
        assert!(BackendKind::Gram4.capabilities().lifetime_extension);
        assert!(!BackendKind::Gram3.capabilities().lifetime_extension);
        assert!(BackendKind::Mirror.capabilities().failover);
        assert_eq!(BackendKind::Batch.capabilities(), Capabilities::default());
    }

    #[test]
    fn rsl_description_skips_local_attributes() {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, 4);
        ad.set("Executable", "/bin/true");
        let rsl = submit_description(BackendKind::Gram2, &ad);
        assert_eq!(rsl, "&(executable=\"/bin/true\")");
    }
}
