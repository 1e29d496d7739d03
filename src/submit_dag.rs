// src/submit_dag.rs

//! `condor_submit_dag`: check a DAG and write the scheduler-universe submit
//! description that runs `condor_dagman` on it.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cli::SubmitDagArgs;
use crate::config::CONFIG_FILE_ENV;
use crate::dag::rescue::old_style_rescue_path;
use crate::dag::{load_dag_files, DagOptions};
use crate::dagman::with_suffix;
use crate::errors::{GridflowError, Result};
use crate::exec::submit::parse_submit_output;
use crate::fs::FileSystem;
use crate::logging::DAGMAN_LOG_ENV;
use crate::types::CondorId;

/// Debug level handed to `condor_dagman` when `-debug` is not given.
pub const DEFAULT_DAGMAN_DEBUG: u8 = 3;

/// Files generated for (or by) a submitted DAG, all named after the primary
/// DAG file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitFiles {
    pub primary: PathBuf,
    pub submit_file: PathBuf,
    pub lib_out: PathBuf,
    pub lib_err: PathBuf,
    pub dagman_log: PathBuf,
    pub debug_log: PathBuf,
    pub lock: PathBuf,
}

impl SubmitFiles {
    pub fn for_primary(primary: &Path) -> Self {
        Self {
            primary: primary.to_path_buf(),
            submit_file: with_suffix(primary, ".condor.sub"),
            lib_out: with_suffix(primary, ".lib.out"),
            lib_err: with_suffix(primary, ".lib.err"),
            dagman_log: with_suffix(primary, ".dagman.log"),
            debug_log: with_suffix(primary, ".dagman.out"),
            lock: with_suffix(primary, ".lock"),
        }
    }

    /// Outputs of an earlier submission that `-force` clears away.
    fn previous_outputs(&self) -> [&Path; 4] {
        [
            &self.lib_out,
            &self.lib_err,
            &self.dagman_log,
            &self.debug_log,
        ]
    }
}

/// Everything that must hold before a submit description is written.
///
/// - every DAG file exists, parses and is acyclic;
/// - without `-force`, no submit description exists (unless
///   `-update_submit`) and no output of an earlier run is in the way;
/// - without auto-rescue, an old-style rescue DAG must not be silently
///   ignored.
pub fn preflight(fs: &dyn FileSystem, args: &SubmitDagArgs, files: &SubmitFiles) -> Result<()> {
    for dag in &args.dag_files {
        if !fs.is_file(dag) {
            return Err(GridflowError::ConfigError(format!(
                "DAG file {:?} does not exist",
                dag
            )));
        }
    }
    let loaded = load_dag_files(
        fs,
        &args.dag_files,
        args.use_dag_dir,
        DagOptions::default(),
    )?;
    loaded.engine.check_acyclic()?;
    debug!(nodes = loaded.engine.len(), "DAG checked");

    if args.force {
        return Ok(());
    }

    if fs.exists(&files.submit_file) && !args.update_submit {
        return Err(GridflowError::ConfigError(format!(
            "file {:?} already exists; use -force or -update_submit to overwrite it",
            files.submit_file
        )));
    }
    if !args.update_submit {
        for path in files.previous_outputs() {
            if fs.exists(path) {
                return Err(GridflowError::ConfigError(format!(
                    "file {:?} already exists; use -force to overwrite it",
                    path
                )));
            }
        }
    }

    let old_rescue = old_style_rescue_path(&files.primary);
    if !args.auto_rescue && args.do_rescue_from == 0 && fs.exists(&old_rescue) {
        return Err(GridflowError::ConfigError(format!(
            "rescue DAG {:?} exists; submit it instead, enable -autorescue, or use -force",
            old_rescue
        )));
    }
    Ok(())
}

/// Remove outputs of an earlier submission (for `-force`).
pub fn clear_previous_outputs(fs: &dyn FileSystem, files: &SubmitFiles) -> Result<()> {
    for path in files.previous_outputs() {
        if fs.exists(path) {
            fs.remove_file(path)?;
            debug!(path = ?path, "removed previous output");
        }
    }
    Ok(())
}

/// Render the submit description.
pub fn render_submit_file(args: &SubmitDagArgs, files: &SubmitFiles, dagman: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Filename: {}", files.submit_file.display());
    let _ = writeln!(
        out,
        "# Generated by condor_submit_dag {}",
        args.dag_files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );
    let _ = writeln!(out, "universe\t= scheduler");
    let _ = writeln!(out, "executable\t= {}", dagman.display());
    if args.import_env {
        let _ = writeln!(out, "getenv\t\t= True");
    }
    let _ = writeln!(out, "output\t\t= {}", files.lib_out.display());
    let _ = writeln!(out, "error\t\t= {}", files.lib_err.display());
    let _ = writeln!(out, "log\t\t= {}", files.dagman_log.display());
    let _ = writeln!(out, "remove_kill_sig\t= SIGUSR1");
    let _ = writeln!(
        out,
        "on_exit_remove\t= ( ExitSignal =?= 11 || (ExitCode =!= UNDEFINED && ExitCode >=0 && ExitCode <= 2))"
    );
    let _ = writeln!(out, "copy_to_spool\t= False");
    let _ = writeln!(out, "arguments\t= \"{}\"", dagman_arguments(args, files).join(" "));

    let mut env = vec![
        format!("{DAGMAN_LOG_ENV}={}", files.debug_log.display()),
        "_CONDOR_MAX_DAGMAN_LOG=0".to_string(),
    ];
    if let Some(config) = &args.config {
        env.push(format!("{CONFIG_FILE_ENV}={}", config.display()));
    }
    let _ = writeln!(out, "environment\t= {}", env.join(";"));

    let notification = args.notification.as_deref().unwrap_or("never");
    let _ = writeln!(out, "notification\t= {notification}");
    for line in &args.append {
        let _ = writeln!(out, "{line}");
    }
    let _ = writeln!(out, "queue");
    out
}

/// Argument vector for `condor_dagman`, already quoted for the submit
/// description.
fn dagman_arguments(args: &SubmitDagArgs, files: &SubmitFiles) -> Vec<String> {
    let mut v: Vec<String> = vec!["-p".into(), "0".into(), "-f".into(), "-l".into(), ".".into()];
    let debug = args.debug.unwrap_or(DEFAULT_DAGMAN_DEBUG);
    v.extend(["-Debug".to_string(), debug.to_string()]);
    v.extend(["-Lockfile".to_string(), quote_arg(&files.lock)]);
    v.extend([
        "-AutoRescue".to_string(),
        u8::from(args.auto_rescue).to_string(),
    ]);
    v.extend(["-DoRescueFrom".to_string(), args.do_rescue_from.to_string()]);
    for dag in &args.dag_files {
        v.extend(["-Dag".to_string(), quote_arg(dag)]);
    }
    if let Some(n) = args.max_jobs {
        v.extend(["-MaxJobs".to_string(), n.to_string()]);
    }
    if let Some(n) = args.max_pre {
        v.extend(["-MaxPre".to_string(), n.to_string()]);
    }
    if let Some(n) = args.max_post {
        v.extend(["-MaxPost".to_string(), n.to_string()]);
    }
    if args.use_dag_dir {
        v.push("-UseDagDir".to_string());
    }
    if args.old_rescue {
        v.extend(["-OldRescue".to_string(), "1".to_string()]);
    }
    v
}

fn quote_arg(path: &Path) -> String {
    let s = path.display().to_string();
    if s.contains(char::is_whitespace) {
        format!("'{}'", s.replace('\'', "''"))
    } else {
        s
    }
}

/// Check, clear (with `-force`) and write the submit description. Returns
/// its path.
pub fn prepare(fs: &dyn FileSystem, args: &SubmitDagArgs, dagman: &Path) -> Result<SubmitFiles> {
    let primary = args
        .dag_files
        .first()
        .ok_or_else(|| GridflowError::ConfigError("no DAG file given".to_string()))?;
    let files = SubmitFiles::for_primary(primary);

    preflight(fs, args, &files)?;
    if args.force {
        clear_previous_outputs(fs, &files)?;
    }
    if args.no_recurse {
        debug!("-no_recurse given; nested DAGs are not inspected");
    }

    let text = render_submit_file(args, &files, dagman);
    fs.write(&files.submit_file, text.as_bytes())?;
    info!(path = ?files.submit_file, "submit description written");
    Ok(files)
}

/// Hand the submit description to `command`.
pub async fn submit(command: &str, submit_file: &Path) -> anyhow::Result<CondorId> {
    let output = Command::new(command)
        .arg(submit_file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("spawning '{command}'"))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        bail!(
            "'{command}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    match parse_submit_output(&stdout) {
        Some(id) => Ok(id),
        None => {
            warn!(output = %stdout.trim(), "no cluster id in submit output");
            bail!("could not find a cluster id in '{command}' output")
        }
    }
}
