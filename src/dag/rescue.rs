// src/dag/rescue.rs

//! Rescue DAG files.
//!
//! A rescue DAG is a complete, human-editable DAG description in which every
//! finished node is marked `DONE`. Running it resumes the work that was left
//! unfinished.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::Glob;
use tracing::{info, warn};

use crate::dag::engine::DagEngine;
use crate::dag::node::{NodeStatus, ScriptKind};
use crate::errors::{GridflowError, Result};
use crate::fs::FileSystem;

/// `<primary>.rescueNNN`
pub fn numbered_rescue_path(primary: &Path, n: u32) -> PathBuf {
    append_to_file_name(primary, &format!(".rescue{n:03}"))
}

/// `<primary>.rescue`
pub fn old_style_rescue_path(primary: &Path) -> PathBuf {
    append_to_file_name(primary, ".rescue")
}

fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Highest-numbered existing rescue file for `primary`, up to `max`.
pub fn find_last_rescue(
    fs: &dyn FileSystem,
    primary: &Path,
    max: u32,
) -> Result<Option<(u32, PathBuf)>> {
    let file_name = primary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| GridflowError::ConfigError(format!("DAG path {:?} has no file name", primary)))?;
    let dir = match primary.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let pattern = format!("{}.rescue[0-9][0-9][0-9]", globset::escape(&file_name));
    let matcher = Glob::new(&pattern)
        .map_err(|e| GridflowError::ConfigError(format!("rescue pattern '{pattern}': {e}")))?
        .compile_matcher();

    if !fs.exists(&dir) {
        return Ok(None);
    }

    let mut best: Option<u32> = None;
    for entry in fs.read_dir(&dir)? {
        let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !matcher.is_match(&name) {
            continue;
        }
        let Ok(n) = name[name.len() - 3..].parse::<u32>() else {
            continue;
        };
        if n == 0 || n > max {
            continue;
        }
        best = best.max(Some(n));
    }

    Ok(best.map(|n| (n, numbered_rescue_path(primary, n))))
}

/// Where the next rescue DAG for `primary` goes.
///
/// Once `max` is reached the last number is reused.
pub fn next_rescue_path(fs: &dyn FileSystem, primary: &Path, max: u32) -> Result<PathBuf> {
    let next = match find_last_rescue(fs, primary, max)? {
        Some((n, _)) if n >= max => {
            warn!(max, "maximum rescue DAG number reached; overwriting the last one");
            max
        }
        Some((n, _)) => n + 1,
        None => 1,
    };
    Ok(numbered_rescue_path(primary, next))
}

/// Render the rescue DAG for the engine's current state.
pub fn render_rescue(engine: &DagEngine, sources: &[PathBuf], created: DateTime<Utc>) -> String {
    let summary = engine.summary();
    let mut out = String::new();

    let sources: Vec<String> = sources.iter().map(|p| p.display().to_string()).collect();
    let _ = writeln!(out, "# Rescue DAG file, created after running");
    let _ = writeln!(out, "#   the {} DAG file", sources.join(", "));
    let _ = writeln!(out, "# Created {}", created.format("%m/%d/%Y %H:%M:%S UTC"));
    let _ = writeln!(out, "#");
    let _ = writeln!(out, "# Total number of Nodes: {}", summary.total);
    let _ = writeln!(out, "# Nodes premarked DONE: {}", summary.done);
    let _ = writeln!(out, "# Nodes that failed: {}", summary.failed);
    let failed: Vec<&str> = engine.failed_nodes().iter().map(|n| n.name()).collect();
    let _ = writeln!(out, "#   {}<ENDLIST>", failed.iter().map(|n| format!("{n},")).collect::<String>());
    out.push('\n');

    for node in engine.nodes() {
        let _ = write!(out, "JOB {} {}", node.name(), node.submit_file().display());
        if !node.dir().as_os_str().is_empty() {
            let _ = write!(out, " DIR {}", node.dir().display());
        }
        if node.status() == NodeStatus::Done {
            out.push_str(" DONE");
        }
        out.push('\n');

        for kind in [ScriptKind::Pre, ScriptKind::Post] {
            if let Some(script) = node.script(kind) {
                let _ = writeln!(out, "SCRIPT {kind} {} {script}", node.name());
            }
        }

        let remaining = node.retry_max().saturating_sub(node.retries());
        if node.retry_max() > 0 {
            let _ = write!(out, "RETRY {} {remaining}", node.name());
            if let Some(v) = node.retry_unless_exit() {
                let _ = write!(out, " UNLESS-EXIT {v}");
            }
            out.push('\n');
        }
    }

    let edges: Vec<(&str, Vec<&str>)> = engine
        .nodes()
        .iter()
        .filter(|n| !n.outgoing().is_empty())
        .map(|n| {
            let children = n
                .outgoing()
                .iter()
                .filter_map(|c| engine.node(*c).map(|c| c.name()))
                .collect();
            (n.name(), children)
        })
        .collect();
    if !edges.is_empty() {
        out.push('\n');
    }
    for (parent, children) in edges {
        let _ = writeln!(out, "PARENT {parent} CHILD {}", children.join(" "));
    }

    out
}

/// Write the rescue DAG to `path`.
pub fn write_rescue(
    fs: &dyn FileSystem,
    engine: &DagEngine,
    sources: &[PathBuf],
    path: &Path,
) -> Result<()> {
    let text = render_rescue(engine, sources, Utc::now());
    fs.write(path, text.as_bytes())?;
    let summary = engine.summary();
    info!(
        path = ?path,
        done = summary.done,
        failed = summary.failed,
        total = summary.total,
        "rescue DAG written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::engine::DagOptions;
    use crate::dag::parser::parse_dag_text;
    use crate::fs::mock::MockFileSystem;
    use crate::types::CondorId;

    #[test]
    fn numbered_paths() {
        assert_eq!(
            numbered_rescue_path(Path::new("dags/x.dag"), 7),
            PathBuf::from("dags/x.dag.rescue007")
        );
        assert_eq!(
            old_style_rescue_path(Path::new("x.dag")),
            PathBuf::from("x.dag.rescue")
        );
    }

    #[test]
    fn finds_highest_rescue_and_next_slot() {
        let fs = MockFileSystem::new();
        fs.add_file("w/x.dag", "JOB A a.sub\n");
        fs.add_file("w/x.dag.rescue001", "");
        fs.add_file("w/x.dag.rescue003", "");
        fs.add_file("w/x.dag.rescue", "");
        fs.add_file("w/y.dag.rescue009", "");

        let primary = Path::new("w/x.dag");
        let (n, path) = find_last_rescue(&fs, primary, 100).unwrap().unwrap();
        assert_eq!(n, 3);
        assert_eq!(path, PathBuf::from("w/x.dag.rescue003"));
        assert_eq!(
            next_rescue_path(&fs, primary, 100).unwrap(),
            PathBuf::from("w/x.dag.rescue004")
        );
        assert_eq!(
            next_rescue_path(&fs, primary, 3).unwrap(),
            PathBuf::from("w/x.dag.rescue003")
        );
    }

    #[test]
    fn rescue_reparses_with_done_nodes() {
        let text = "JOB A a.sub\nJOB B b.sub\nJOB C c.sub\nPARENT A CHILD B C\nRETRY B 2\nSCRIPT POST B post.sh $RETURN\n";
        let mut dag = DagEngine::new(DagOptions::default());
        parse_dag_text(&mut dag, text, Path::new("d.dag"), Path::new("")).unwrap();

        dag.run_ready_jobs();
        dag.assign_condor_id(0, CondorId::new(1, 0, 0));
        dag.job_terminated(0, 0);

        let rendered = render_rescue(&dag, &[PathBuf::from("d.dag")], Utc::now());
        assert!(rendered.contains("JOB A a.sub DONE\n"));
        assert!(rendered.contains("JOB B b.sub\n"));
        assert!(rendered.contains("RETRY B 2\n"));
        assert!(rendered.contains("SCRIPT POST B post.sh $RETURN\n"));

        let mut again = DagEngine::new(DagOptions::default());
        parse_dag_text(&mut again, &rendered, Path::new("d.dag.rescue001"), Path::new(""))
            .unwrap();
        assert_eq!(again.status_of("A"), Some(NodeStatus::Done));
        assert_eq!(again.status_of("B"), Some(NodeStatus::Ready));
        assert_eq!(again.status_of("C"), Some(NodeStatus::Ready));
    }
}
