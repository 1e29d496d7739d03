// src/dagman.rs

//! Startup of a `condor_dagman` run.
//!
//! Everything between argument parsing and the event loop lives here:
//! deriving file names from the primary DAG, choosing between the primary
//! and a rescue DAG, taking the lock file, and either replaying the recovery
//! log (after a crash) or starting a fresh one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cli::DagmanArgs;
use crate::config::DagmanSection;
use crate::dag::rescue::{find_last_rescue, next_rescue_path, numbered_rescue_path, old_style_rescue_path};
use crate::dag::{load_dag_files, DagEngine, DagOptions, RecoveryLog};
use crate::engine::RescueTarget;
use crate::errors::{GridflowError, Result};
use crate::fs::FileSystem;
use crate::userlog::EventLogReader;

/// Files a run reads and writes, derived from the primary DAG unless given
/// on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub primary: PathBuf,
    pub lock: PathBuf,
    pub recovery_log: PathBuf,
    pub event_log: PathBuf,
}

impl RunPaths {
    pub fn from_args(args: &DagmanArgs) -> Result<Self> {
        let primary = args
            .primary_dag()
            .cloned()
            .ok_or_else(|| GridflowError::ConfigError("no DAG file given".to_string()))?;
        Ok(Self {
            lock: args
                .lockfile
                .clone()
                .unwrap_or_else(|| with_suffix(&primary, ".lock")),
            recovery_log: args
                .recovery_log
                .clone()
                .unwrap_or_else(|| with_suffix(&primary, ".recovery.log")),
            event_log: args
                .condor_log
                .clone()
                .unwrap_or_else(|| with_suffix(&primary, ".nodes.log")),
            primary,
        })
    }
}

/// `path` with `suffix` appended to its file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Command-line throttles win over the config file.
pub fn apply_overrides(cfg: &mut DagmanSection, args: &DagmanArgs) {
    if let Some(n) = args.max_jobs {
        cfg.max_jobs = n;
    }
    if let Some(n) = args.max_pre {
        cfg.max_pre = n;
    }
    if let Some(n) = args.max_post {
        cfg.max_post = n;
    }
    if args.no_post_fail {
        cfg.no_post_fail = true;
    }
}

/// The DAG files to parse: an explicitly requested rescue DAG, the newest
/// rescue DAG under auto-rescue, or the files on the command line.
///
/// A rescue DAG is complete, so it replaces every `-Dag` file.
pub fn select_dag_files(
    fs: &dyn FileSystem,
    args: &DagmanArgs,
    paths: &RunPaths,
    max_rescue: u32,
) -> Result<Vec<PathBuf>> {
    if args.do_rescue_from > 0 {
        let path = numbered_rescue_path(&paths.primary, args.do_rescue_from);
        if !fs.is_file(&path) {
            return Err(GridflowError::ConfigError(format!(
                "rescue DAG {:?} requested with -DoRescueFrom does not exist",
                path
            )));
        }
        info!(path = ?path, "running requested rescue DAG");
        return Ok(vec![path]);
    }

    if args.auto_rescue {
        if let Some((n, path)) = find_last_rescue(fs, &paths.primary, max_rescue)? {
            info!(number = n, path = ?path, "auto-rescue: running newest rescue DAG");
            return Ok(vec![path]);
        }
        if args.old_rescue {
            let path = old_style_rescue_path(&paths.primary);
            if fs.is_file(&path) {
                info!(path = ?path, "auto-rescue: running old-style rescue DAG");
                return Ok(vec![path]);
            }
        }
    }

    Ok(args.dag.clone())
}

/// Where this run's rescue DAG goes if one is needed.
pub fn rescue_target(
    fs: &dyn FileSystem,
    args: &DagmanArgs,
    paths: &RunPaths,
    files: &[PathBuf],
    max_rescue: u32,
) -> Result<RescueTarget> {
    let path = match &args.rescue {
        Some(p) => p.clone(),
        None if args.old_rescue => old_style_rescue_path(&paths.primary),
        None => next_rescue_path(fs, &paths.primary, max_rescue)?,
    };
    Ok(RescueTarget {
        path,
        sources: files.to_vec(),
    })
}

/// A run ready for the event loop.
#[derive(Debug)]
pub struct PreparedRun {
    pub engine: DagEngine,
    pub recovery: RecoveryLog,
    pub reader: EventLogReader,
    pub rescue: RescueTarget,
    pub paths: RunPaths,
    /// A lock file from an earlier run was found.
    pub recovery_mode: bool,
}

/// Load the DAG and bring the recovery log and the lock file into the state
/// the event loop expects.
///
/// In recovery mode the recovery log is replayed and the event log is read
/// from its start. Otherwise the recovery log is truncated and begins with
/// the initialization records, and events already in the event log belong
/// to an earlier run.
pub fn prepare(
    fs: Arc<dyn FileSystem>,
    args: &DagmanArgs,
    cfg: &DagmanSection,
) -> Result<PreparedRun> {
    let paths = RunPaths::from_args(args)?;
    let recovery_mode = fs.exists(&paths.lock);
    if recovery_mode {
        warn!(lock = ?paths.lock, "lock file found; running in recovery mode");
    }

    let files = select_dag_files(fs.as_ref(), args, &paths, cfg.max_rescue_num)?;
    let loaded = load_dag_files(
        fs.as_ref(),
        &files,
        args.use_dag_dir,
        DagOptions::from_config(cfg),
    )?;
    let mut engine = loaded.engine;
    engine.check_acyclic()?;
    info!(nodes = engine.len(), files = ?loaded.files, "DAG loaded");

    let rescue = rescue_target(fs.as_ref(), args, &paths, &loaded.files, cfg.max_rescue_num)?;
    let recovery = RecoveryLog::new(Arc::clone(&fs), paths.recovery_log.clone());
    let mut reader = EventLogReader::new(Arc::clone(&fs), paths.event_log.clone());

    if recovery_mode {
        let contents = recovery.read_all()?;
        for w in &contents.warnings {
            warn!(path = ?paths.recovery_log, "{w}");
        }
        let report = engine.replay(&contents.records, &loaded.digest);
        for w in &report.warnings {
            warn!("{w}");
        }
        info!(applied = report.applied, "recovery log replayed");
    } else {
        fs.write(&paths.lock, format!("{}\n", std::process::id()).as_bytes())
            .map_err(|e| GridflowError::Lock(format!("cannot create {:?}: {e:#}", paths.lock)))?;
        recovery.reset()?;
        for record in engine.initial_records(&loaded.digest) {
            recovery.append(&record)?;
        }
        reader.skip_to_end();
    }

    Ok(PreparedRun {
        engine,
        recovery,
        reader,
        rescue,
        paths,
        recovery_mode,
    })
}

/// Remove the lock file once the run is over.
pub fn release_lock(fs: &dyn FileSystem, lock: &Path) {
    if !fs.exists(lock) {
        return;
    }
    if let Err(e) = fs.remove_file(lock) {
        warn!(lock = ?lock, error = %e, "failed to remove lock file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::normalize_legacy_args;
    use crate::dag::RecoveryRecord;
    use crate::fs::mock::MockFileSystem;
    use clap::Parser;

    fn args(extra: &[&str]) -> DagmanArgs {
        let mut argv = vec!["condor_dagman", "-Dag", "w/d.dag"];
        argv.extend_from_slice(extra);
        DagmanArgs::try_parse_from(normalize_legacy_args(argv)).unwrap()
    }

    #[test]
    fn derived_paths_follow_the_primary_dag() {
        let paths = RunPaths::from_args(&args(&["-Lockfile", "x.lock"])).unwrap();
        assert_eq!(paths.lock, PathBuf::from("x.lock"));
        assert_eq!(paths.recovery_log, PathBuf::from("w/d.dag.recovery.log"));
        assert_eq!(paths.event_log, PathBuf::from("w/d.dag.nodes.log"));
    }

    #[test]
    fn cli_throttles_override_config() {
        let mut cfg = DagmanSection::default();
        cfg.max_pre = 7;
        apply_overrides(&mut cfg, &args(&["-MaxJobs", "3", "-NoPostFail"]));
        assert_eq!(cfg.max_jobs, 3);
        assert_eq!(cfg.max_pre, 7);
        assert!(cfg.no_post_fail);
    }

    #[test]
    fn auto_rescue_picks_the_newest_rescue() {
        let fs = MockFileSystem::new();
        fs.add_file("w/d.dag", "JOB A a.sub\n");
        fs.add_file("w/d.dag.rescue001", "JOB A a.sub\n");
        fs.add_file("w/d.dag.rescue002", "JOB A a.sub DONE\n");

        let a = args(&["-AutoRescue", "1"]);
        let paths = RunPaths::from_args(&a).unwrap();
        let files = select_dag_files(&fs, &a, &paths, 100).unwrap();
        assert_eq!(files, vec![PathBuf::from("w/d.dag.rescue002")]);

        let a = args(&["-AutoRescue", "0"]);
        assert_eq!(
            select_dag_files(&fs, &a, &paths, 100).unwrap(),
            vec![PathBuf::from("w/d.dag")]
        );

        let a = args(&["-DoRescueFrom", "1"]);
        assert_eq!(
            select_dag_files(&fs, &a, &paths, 100).unwrap(),
            vec![PathBuf::from("w/d.dag.rescue001")]
        );
        let a = args(&["-DoRescueFrom", "9"]);
        assert!(select_dag_files(&fs, &a, &paths, 100).is_err());
    }

    #[test]
    fn rescue_output_path_options() {
        let fs = MockFileSystem::new();
        fs.add_file("w/d.dag.rescue001", "");
        let files = vec![PathBuf::from("w/d.dag")];

        let a = args(&[]);
        let paths = RunPaths::from_args(&a).unwrap();
        let t = rescue_target(&fs, &a, &paths, &files, 100).unwrap();
        assert_eq!(t.path, PathBuf::from("w/d.dag.rescue002"));
        assert_eq!(t.sources, files);

        let a = args(&["-OldRescue", "1"]);
        let t = rescue_target(&fs, &a, &paths, &files, 100).unwrap();
        assert_eq!(t.path, PathBuf::from("w/d.dag.rescue"));

        let a = args(&["-Rescue", "out.rescue"]);
        let t = rescue_target(&fs, &a, &paths, &files, 100).unwrap();
        assert_eq!(t.path, PathBuf::from("out.rescue"));
    }

    #[test]
    fn fresh_run_takes_the_lock_and_starts_the_recovery_log() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("w/d.dag", "JOB A a.sub\nJOB B b.sub\nPARENT A CHILD B\n");
        fs.add_file("w/d.dag.recovery.log", "stale\n");

        let run = prepare(fs.clone(), &args(&[]), &DagmanSection::default()).unwrap();
        assert!(!run.recovery_mode);
        assert!(fs.exists(Path::new("w/d.dag.lock")));

        let contents = run.recovery.read_all().unwrap();
        assert!(matches!(
            contents.records.first(),
            Some(RecoveryRecord::Initialize { node_count: 2, .. })
        ));
        assert_eq!(contents.records.last(), Some(&RecoveryRecord::DoneInitialize));

        release_lock(fs.as_ref(), &run.paths.lock);
        assert!(!fs.exists(Path::new("w/d.dag.lock")));
    }

    #[test]
    fn existing_lock_replays_the_recovery_log() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("w/d.dag", "JOB A a.sub\nJOB B b.sub\nPARENT A CHILD B\n");
        let first = prepare(fs.clone(), &args(&[]), &DagmanSection::default()).unwrap();
        first.recovery.append(&RecoveryRecord::SubmitJob { node: 0 }).unwrap();

        let run = prepare(fs.clone(), &args(&[]), &DagmanSection::default()).unwrap();
        assert!(run.recovery_mode);
        let a = run.engine.node_by_name("A").unwrap();
        assert_eq!(a.status(), crate::dag::NodeStatus::Submitted);
    }

    #[test]
    fn cyclic_dag_is_rejected() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("w/d.dag", "JOB A a.sub\nJOB B b.sub\nPARENT A CHILD B\nPARENT B CHILD A\n");
        let err = prepare(fs.clone(), &args(&[]), &DagmanSection::default()).unwrap_err();
        assert!(matches!(err, GridflowError::DagCycle(_)));
        assert!(!fs.exists(Path::new("w/d.dag.lock")));
    }
}
