// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! The tools historically take single-dash, mixed-case long options
//! (`-MaxJobs 4`, `-Dag file`). [`normalize_legacy_args`] rewrites those to
//! the lowercase `--` form clap understands, so both spellings work.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `condor_dagman`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "condor_dagman",
    version,
    about = "Run a DAG of jobs, recovering from the recovery log after a crash.",
    long_about = None
)]
pub struct DagmanArgs {
    /// Debug verbosity 0..=7.
    #[arg(long = "debug", value_name = "LEVEL")]
    pub debug: Option<u8>,

    /// Logging level; overrides `-Debug`.
    #[arg(long = "log-level", value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Lock file; its presence at startup means a previous run crashed.
    ///
    /// Default: `<primary dag>.lock`.
    #[arg(long = "lockfile", value_name = "PATH")]
    pub lockfile: Option<PathBuf>,

    /// DAG description file. May be repeated; all files form one DAG.
    #[arg(long = "dag", value_name = "PATH", required = true)]
    pub dag: Vec<PathBuf>,

    /// Explicit rescue DAG output path.
    #[arg(long = "rescue", value_name = "PATH")]
    pub rescue: Option<PathBuf>,

    #[arg(long = "maxjobs", value_name = "N")]
    pub max_jobs: Option<usize>,

    #[arg(long = "maxpre", value_name = "N")]
    pub max_pre: Option<usize>,

    #[arg(long = "maxpost", value_name = "N")]
    pub max_post: Option<usize>,

    /// Skip the POST script when the node job failed.
    #[arg(long = "nopostfail")]
    pub no_post_fail: bool,

    /// Node event log. Default: `<primary dag>.nodes.log`.
    #[arg(long = "condorlog", value_name = "PATH")]
    pub condor_log: Option<PathBuf>,

    /// Recovery log. Default: `<primary dag>.recovery.log`.
    #[arg(long = "recoverylog", value_name = "PATH")]
    pub recovery_log: Option<PathBuf>,

    /// Path to the config file (TOML).
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run the newest rescue DAG instead of the primary one.
    #[arg(long = "autorescue", value_name = "0|1", default_value = "0", value_parser = parse_switch, action = clap::ArgAction::Set)]
    pub auto_rescue: bool,

    /// Run this rescue DAG number.
    #[arg(long = "dorescuefrom", value_name = "N", default_value_t = 0)]
    pub do_rescue_from: u32,

    /// Resolve submit files and scripts relative to each DAG file.
    #[arg(long = "usedagdir")]
    pub use_dag_dir: bool,

    /// Write the rescue DAG as `<dag>.rescue` instead of numbering it.
    #[arg(long = "oldrescue", value_name = "0|1", default_value = "0", value_parser = parse_switch, action = clap::ArgAction::Set)]
    pub old_rescue: bool,

    /// Accepted for compatibility with scheduler-universe submission.
    #[arg(short = 'p', hide = true, value_name = "PORT")]
    pub port: Option<String>,

    #[arg(short = 'f', hide = true)]
    pub foreground: bool,

    #[arg(short = 'l', hide = true, value_name = "DIR")]
    pub log_dir: Option<String>,
}

impl DagmanArgs {
    /// Effective log level: `--log-level` wins over `-Debug`.
    pub fn effective_log_level(&self) -> Option<LogLevel> {
        self.log_level.or(self.debug.map(LogLevel::from_debug_level))
    }

    /// The first `-Dag` file names every derived file.
    pub fn primary_dag(&self) -> Option<&PathBuf> {
        self.dag.first()
    }
}

/// Command-line arguments for `condor_submit_dag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "condor_submit_dag",
    version,
    about = "Check a DAG and write the submit description that runs it under condor_dagman.",
    long_about = None
)]
pub struct SubmitDagArgs {
    /// Overwrite existing output files.
    #[arg(long = "force")]
    pub force: bool,

    #[arg(long = "maxjobs", value_name = "N")]
    pub max_jobs: Option<usize>,

    #[arg(long = "maxpre", value_name = "N")]
    pub max_pre: Option<usize>,

    #[arg(long = "maxpost", value_name = "N")]
    pub max_post: Option<usize>,

    /// Notification setting for the DAGMan job.
    #[arg(long = "notification", value_name = "WHEN")]
    pub notification: Option<String>,

    #[arg(long = "usedagdir")]
    pub use_dag_dir: bool,

    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Extra line appended to the generated submit description.
    #[arg(long = "append", value_name = "LINE")]
    pub append: Vec<String>,

    #[arg(long = "oldrescue", value_name = "0|1", default_value = "0", value_parser = parse_switch, action = clap::ArgAction::Set)]
    pub old_rescue: bool,

    #[arg(long = "autorescue", value_name = "0|1", default_value = "1", value_parser = parse_switch, action = clap::ArgAction::Set)]
    pub auto_rescue: bool,

    #[arg(long = "dorescuefrom", value_name = "N", default_value_t = 0)]
    pub do_rescue_from: u32,

    /// Rewrite an existing submit description even without `-force`.
    #[arg(long = "update_submit")]
    pub update_submit: bool,

    /// Copy the current environment into the submit description.
    #[arg(long = "import_env")]
    pub import_env: bool,

    /// Accepted for compatibility; nested DAGs are not descended into.
    #[arg(long = "no_recurse")]
    pub no_recurse: bool,

    #[arg(long = "debug", value_name = "LEVEL")]
    pub debug: Option<u8>,

    /// Write the submit description but do not submit it.
    #[arg(long = "no_submit")]
    pub no_submit: bool,

    /// DAG description files.
    #[arg(value_name = "DAGFILE", required = true)]
    pub dag_files: Vec<PathBuf>,
}

/// Command-line arguments for `condor_gridmanager`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "condor_gridmanager",
    version,
    about = "Manage grid-universe jobs from a job queue until none are left.",
    long_about = None
)]
pub struct GridmanagerArgs {
    /// Job queue file (TOML).
    #[arg(long = "queue", value_name = "PATH")]
    pub queue: PathBuf,

    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(long = "debug", value_name = "LEVEL")]
    pub debug: Option<u8>,

    #[arg(long = "log-level", value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

impl GridmanagerArgs {
    pub fn effective_log_level(&self) -> Option<LogLevel> {
        self.log_level.or(self.debug.map(LogLevel::from_debug_level))
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a numeric `-Debug` verbosity onto a level.
    pub fn from_debug_level(level: u8) -> Self {
        match level {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 | 3 => LogLevel::Info,
            4 | 5 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(format!("expected 0 or 1, got '{other}'")),
    }
}

/// Rewrite `-LongOption` into `--longoption`.
///
/// Only single-dash arguments longer than two characters whose second
/// character is a letter are touched, so `-p 0`, `-f` and negative numbers
/// pass through unchanged. The program name is never rewritten.
pub fn normalize_legacy_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let arg: OsString = arg.into();
            if i == 0 {
                return arg;
            }
            match arg.to_str() {
                Some(s) if is_legacy_long(s) => OsString::from(format!("-{}", s.to_lowercase())),
                _ => arg,
            }
        })
        .collect()
}

fn is_legacy_long(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('-')
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && s.len() > 2
}

/// Parse `condor_dagman` arguments from the process command line.
pub fn parse_dagman() -> DagmanArgs {
    DagmanArgs::parse_from(normalize_legacy_args(std::env::args_os()))
}

pub fn parse_submit_dag() -> SubmitDagArgs {
    SubmitDagArgs::parse_from(normalize_legacy_args(std::env::args_os()))
}

pub fn parse_gridmanager() -> GridmanagerArgs {
    GridmanagerArgs::parse_from(normalize_legacy_args(std::env::args_os()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dagman(args: &[&str]) -> DagmanArgs {
        DagmanArgs::try_parse_from(normalize_legacy_args(args.iter().copied())).unwrap()
    }

    #[test]
    fn legacy_spelling_is_accepted() {
        let args = dagman(&[
            "condor_dagman",
            "-p",
            "0",
            "-f",
            "-l",
            ".",
            "-Debug",
            "3",
            "-Lockfile",
            "d.dag.lock",
            "-AutoRescue",
            "1",
            "-DoRescueFrom",
            "0",
            "-Dag",
            "d.dag",
            "-MaxJobs",
            "4",
            "-NoPostFail",
        ]);
        assert_eq!(args.dag, vec![PathBuf::from("d.dag")]);
        assert_eq!(args.max_jobs, Some(4));
        assert!(args.no_post_fail);
        assert!(args.auto_rescue);
        assert_eq!(args.lockfile, Some(PathBuf::from("d.dag.lock")));
        assert_eq!(args.effective_log_level(), Some(LogLevel::Info));
    }

    #[test]
    fn modern_spelling_and_repeated_dags() {
        let args = dagman(&["condor_dagman", "--dag", "a.dag", "--dag", "b.dag"]);
        assert_eq!(args.dag.len(), 2);
        assert_eq!(args.primary_dag(), Some(&PathBuf::from("a.dag")));
        assert!(!args.old_rescue);
    }

    #[test]
    fn short_flags_and_values_untouched() {
        let out = normalize_legacy_args(["x", "-f", "-1", "--dag", "-Dag"]);
        assert_eq!(out, vec!["x", "-f", "-1", "--dag", "--dag"]);
    }

    #[test]
    fn submit_dag_switches() {
        let args = SubmitDagArgs::try_parse_from(normalize_legacy_args([
            "condor_submit_dag",
            "-force",
            "-oldrescue",
            "1",
            "-append",
            "+Owner = \"me\"",
            "my.dag",
        ]))
        .unwrap();
        assert!(args.force);
        assert!(args.old_rescue);
        assert!(args.auto_rescue);
        assert_eq!(args.append, vec!["+Owner = \"me\"".to_string()]);
        assert_eq!(args.dag_files, vec![PathBuf::from("my.dag")]);
    }

    #[test]
    fn bad_switch_value_is_rejected() {
        let res = DagmanArgs::try_parse_from(normalize_legacy_args([
            "condor_dagman",
            "-Dag",
            "d.dag",
            "-AutoRescue",
            "yes",
        ]));
        assert!(res.is_err());
    }

    #[test]
    fn debug_levels_map_onto_tracing_levels() {
        assert_eq!(LogLevel::from_debug_level(0), LogLevel::Error);
        assert_eq!(LogLevel::from_debug_level(5), LogLevel::Debug);
        assert_eq!(LogLevel::from_debug_level(7), LogLevel::Trace);
    }
}
