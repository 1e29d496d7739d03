// src/config/model.rs

use serde::Deserialize;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [dagman]
/// max_jobs = 10
/// max_post = 2
///
/// [gridmanager]
/// probe_interval_secs = 60
/// helper_command = "/usr/libexec/gridflow_gahp"
/// ```
///
/// All sections are optional and have reasonable defaults, so an empty file
/// is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub dagman: DagmanSection,

    #[serde(default)]
    pub gridmanager: GridmanagerSection,
}

/// Validated configuration. Only constructed through
/// `ConfigFile::try_from(RawConfigFile)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub dagman: DagmanSection,
    pub gridmanager: GridmanagerSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(dagman: DagmanSection, gridmanager: GridmanagerSection) -> Self {
        Self {
            dagman,
            gridmanager,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(DagmanSection::default(), GridmanagerSection::default())
    }
}

/// `[dagman]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DagmanSection {
    /// Maximum number of node jobs in the queue at once; 0 means unlimited.
    #[serde(default)]
    pub max_jobs: usize,

    /// Maximum number of concurrently running PRE scripts; 0 means unlimited.
    #[serde(default)]
    pub max_pre: usize,

    /// Maximum number of concurrently running POST scripts; 0 means unlimited.
    #[serde(default)]
    pub max_post: usize,

    /// Skip POST scripts for nodes whose job failed.
    #[serde(default)]
    pub no_post_fail: bool,

    /// How often a node's submission is retried before the node fails.
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,

    /// Fallback poll interval for the node event log.
    #[serde(default = "default_log_poll_interval_ms")]
    pub log_poll_interval_ms: u64,

    /// Use a filesystem watcher on the node event log in addition to polling.
    #[serde(default = "default_true")]
    pub watch_event_log: bool,

    #[serde(default = "default_submit_command")]
    pub submit_command: String,

    #[serde(default = "default_remove_command")]
    pub remove_command: String,

    /// Highest rescue DAG number that will be written or searched for.
    #[serde(default = "default_max_rescue_num")]
    pub max_rescue_num: u32,
}

fn default_max_submit_attempts() -> u32 {
    6
}

fn default_log_poll_interval_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_submit_command() -> String {
    "condor_submit".to_string()
}

fn default_remove_command() -> String {
    "condor_rm".to_string()
}

fn default_max_rescue_num() -> u32 {
    100
}

impl Default for DagmanSection {
    fn default() -> Self {
        Self {
            max_jobs: 0,
            max_pre: 0,
            max_post: 0,
            no_post_fail: false,
            max_submit_attempts: default_max_submit_attempts(),
            log_poll_interval_ms: default_log_poll_interval_ms(),
            watch_event_log: default_true(),
            submit_command: default_submit_command(),
            remove_command: default_remove_command(),
            max_rescue_num: default_max_rescue_num(),
        }
    }
}

/// `[gridmanager]` section. All durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct GridmanagerSection {
    #[serde(default = "default_one")]
    pub max_submit_attempts: u32,

    /// Minimum spacing between two submit attempts of the same job.
    #[serde(default = "default_five_minutes")]
    pub submit_interval_secs: u64,

    #[serde(default = "default_five_minutes")]
    pub probe_interval_secs: u64,

    /// Interval of periodic hold/release/remove policy evaluation.
    #[serde(default = "default_periodic_expr_interval_secs")]
    pub periodic_expr_interval_secs: u64,

    /// Timeout applied to every remote RPC. A timeout counts as a failure.
    #[serde(default = "default_five_minutes")]
    pub rpc_timeout_secs: u64,

    /// Credentials closer than this to expiry are treated as expired.
    #[serde(default = "default_min_proxy_lifetime_secs")]
    pub min_proxy_lifetime_secs: u64,

    #[serde(default = "default_proxy_refresh_interval_secs")]
    pub proxy_refresh_interval_secs: u64,

    /// Outstanding submit RPCs allowed per remote resource.
    #[serde(default = "default_max_submits_per_resource")]
    pub max_submits_per_resource: usize,

    /// Coalescing delay before a batched job-queue update.
    #[serde(default = "default_contact_schedd_delay_secs")]
    pub contact_schedd_delay_secs: u64,

    /// Interval of the job-queue discovery query.
    #[serde(default = "default_five_minutes")]
    pub schedd_poll_interval_secs: u64,

    /// When every resource has been down this long, restart the helpers.
    #[serde(default = "default_max_time_down_resources_secs")]
    pub max_time_down_resources_secs: u64,

    /// How long a callback for an unknown remote id is kept for retry.
    #[serde(default = "default_orphan_callback_window_secs")]
    pub orphan_callback_window_secs: u64,

    /// Remote job lifetime requested at submission (lifetime-extending backends).
    #[serde(default = "default_job_lifetime_secs")]
    pub job_lifetime_secs: u64,

    /// Extend the remote lifetime once it has been used up by this much.
    #[serde(default = "default_lifetime_refresh_margin_secs")]
    pub lifetime_refresh_margin_secs: u64,

    /// Resource downtime after which a failover-capable job moves on.
    #[serde(default = "default_failover_delay_secs")]
    pub failover_delay_secs: u64,

    /// Helper program used as the remote RPC transport.
    #[serde(default = "default_helper_command")]
    pub helper_command: String,
}

fn default_one() -> u32 {
    1
}

fn default_five_minutes() -> u64 {
    300
}

fn default_periodic_expr_interval_secs() -> u64 {
    30
}

fn default_min_proxy_lifetime_secs() -> u64 {
    180
}

fn default_proxy_refresh_interval_secs() -> u64 {
    600
}

fn default_max_submits_per_resource() -> usize {
    5
}

fn default_contact_schedd_delay_secs() -> u64 {
    5
}

fn default_max_time_down_resources_secs() -> u64 {
    900
}

fn default_orphan_callback_window_secs() -> u64 {
    10
}

fn default_job_lifetime_secs() -> u64 {
    12 * 60 * 60
}

fn default_lifetime_refresh_margin_secs() -> u64 {
    60 * 60
}

fn default_failover_delay_secs() -> u64 {
    600
}

fn default_helper_command() -> String {
    "gridflow_gahp".to_string()
}

impl Default for GridmanagerSection {
    fn default() -> Self {
        Self {
            max_submit_attempts: default_one(),
            submit_interval_secs: default_five_minutes(),
            probe_interval_secs: default_five_minutes(),
            periodic_expr_interval_secs: default_periodic_expr_interval_secs(),
            rpc_timeout_secs: default_five_minutes(),
            min_proxy_lifetime_secs: default_min_proxy_lifetime_secs(),
            proxy_refresh_interval_secs: default_proxy_refresh_interval_secs(),
            max_submits_per_resource: default_max_submits_per_resource(),
            contact_schedd_delay_secs: default_contact_schedd_delay_secs(),
            schedd_poll_interval_secs: default_five_minutes(),
            max_time_down_resources_secs: default_max_time_down_resources_secs(),
            orphan_callback_window_secs: default_orphan_callback_window_secs(),
            job_lifetime_secs: default_job_lifetime_secs(),
            lifetime_refresh_margin_secs: default_lifetime_refresh_margin_secs(),
            failover_delay_secs: default_failover_delay_secs(),
            helper_command: default_helper_command(),
        }
    }
}
