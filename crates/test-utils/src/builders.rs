#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::Path;

use gridflow::dag::{parse_dag_text, DagEngine, DagOptions};
use gridflow::grid::ad::attr;
use gridflow::grid::{AdValue, JobAd, LocalStatus};

/// Builder for DAG description text and engines.
#[derive(Debug, Default)]
pub struct DagBuilder {
    text: String,
    options: DagOptions,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `JOB <name> <name>.sub`
    pub fn job(mut self, name: &str) -> Self {
        let _ = writeln!(self.text, "JOB {name} {name}.sub");
        self
    }

    pub fn done_job(mut self, name: &str) -> Self {
        let _ = writeln!(self.text, "JOB {name} {name}.sub DONE");
        self
    }

    pub fn edge(mut self, parent: &str, child: &str) -> Self {
        let _ = writeln!(self.text, "PARENT {parent} CHILD {child}");
        self
    }

    pub fn retry(mut self, name: &str, count: u32) -> Self {
        let _ = writeln!(self.text, "RETRY {name} {count}");
        self
    }

    pub fn script(mut self, kind: &str, name: &str, command: &str) -> Self {
        let _ = writeln!(self.text, "SCRIPT {kind} {name} {command}");
        self
    }

    pub fn line(mut self, line: &str) -> Self {
        self.text.push_str(line);
        self.text.push('\n');
        self
    }

    pub fn max_jobs(mut self, n: usize) -> Self {
        self.options.max_jobs = n;
        self
    }

    pub fn max_submit_attempts(mut self, n: u32) -> Self {
        self.options.max_submit_attempts = n;
        self
    }

    /// The DAG file contents.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn build(self) -> DagEngine {
        let mut engine = DagEngine::new(self.options);
        parse_dag_text(&mut engine, &self.text, Path::new("test.dag"), Path::new(""))
            .expect("Failed to build valid DAG from builder");
        engine
    }
}

/// Builder for grid job ads as the queue hands them to the gridmanager.
#[derive(Debug, Clone)]
pub struct JobAdBuilder {
    ad: JobAd,
}

impl JobAdBuilder {
    /// An idle job `cluster.proc` on `grid_resource`.
    pub fn new(cluster: i64, proc: i64, grid_resource: &str) -> Self {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, cluster);
        ad.set(attr::PROC_ID, proc);
        ad.set(attr::JOB_STATUS, LocalStatus::Idle.code());
        ad.set(attr::GRID_RESOURCE, grid_resource);
        Self { ad }
    }

    pub fn without_grid_resource(cluster: i64, proc: i64) -> Self {
        let mut ad = JobAd::new();
        ad.set(attr::CLUSTER_ID, cluster);
        ad.set(attr::PROC_ID, proc);
        ad.set(attr::JOB_STATUS, LocalStatus::Idle.code());
        Self { ad }
    }

    pub fn status(mut self, status: LocalStatus) -> Self {
        self.ad.set(attr::JOB_STATUS, status.code());
        self
    }

    pub fn proxy(mut self, path: &str, expiration: i64) -> Self {
        self.ad.set(attr::X509_USER_PROXY, path);
        self.ad.set(attr::X509_USER_PROXY_EXPIRATION, expiration);
        self
    }

    pub fn user_log(mut self, path: &str) -> Self {
        self.ad.set(attr::USER_LOG, path);
        self
    }

    pub fn remote_id(mut self, id: &str) -> Self {
        self.ad.set(attr::GRID_JOB_ID, id);
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<AdValue>) -> Self {
        self.ad.set(name, value);
        self
    }

    /// The ad with no attribute marked dirty.
    pub fn build(mut self) -> JobAd {
        self.ad.clear_dirty();
        self.ad
    }
}
