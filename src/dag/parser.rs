// src/dag/parser.rs

//! DAG description parser.
//!
//! ```text
//! # comment
//! JOB A a.sub
//! JOB B b.sub DONE
//! JOB C c.sub DIR work/c
//! DEPENDENCY A B C
//! PARENT A B CHILD C
//! RETRY C 3 UNLESS-EXIT 2
//! SCRIPT PRE C setup.sh $JOB
//! SCRIPT POST C check.sh $JOB $RETURN
//! ```
//!
//! Keywords are case-insensitive. Several files can be merged into one
//! engine; node names must be unique across all of them.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::dag::engine::{DagEngine, DagOptions};
use crate::dag::node::{NodeId, NodeSpec, ScriptKind};
use crate::errors::{GridflowError, Result};
use crate::fs::FileSystem;

/// One or more DAG files loaded into a single engine.
#[derive(Debug, Clone)]
pub struct LoadedDag {
    pub engine: DagEngine,
    /// blake3 hex digest over the contents of every file, in order.
    pub digest: String,
    pub files: Vec<PathBuf>,
}

/// Parse `files` into one engine and fingerprint their contents.
///
/// With `use_dag_dir`, submit files and scripts of each file's nodes are
/// resolved relative to that file's directory.
pub fn load_dag_files(
    fs: &dyn FileSystem,
    files: &[PathBuf],
    use_dag_dir: bool,
    options: DagOptions,
) -> Result<LoadedDag> {
    let mut engine = DagEngine::new(options);
    let mut hasher = blake3::Hasher::new();

    for file in files {
        let text = fs.read_to_string(file).map_err(|e| {
            GridflowError::ConfigError(format!("cannot open DAG file {:?}: {e:#}", file))
        })?;
        hasher.update(text.as_bytes());
        let base_dir = if use_dag_dir {
            file.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            PathBuf::new()
        };
        parse_dag_text(&mut engine, &text, file, &base_dir)?;
    }

    debug!(nodes = engine.len(), files = files.len(), "DAG files parsed");
    Ok(LoadedDag {
        engine,
        digest: hasher.finalize().to_hex().to_string(),
        files: files.to_vec(),
    })
}

/// Parse one DAG description into `engine`.
///
/// `file` is only used for error messages; `base_dir` becomes the node
/// directory of every `JOB` without an explicit `DIR`.
pub fn parse_dag_text(
    engine: &mut DagEngine,
    text: &str,
    file: &Path,
    base_dir: &Path,
) -> Result<()> {
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let err = |message: String| GridflowError::Parse {
            file: file.to_path_buf(),
            line: idx + 1,
            message,
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let keyword = tokens[0].to_ascii_uppercase();
        let args = &tokens[1..];

        match keyword.as_str() {
            "JOB" => parse_job(engine, args, base_dir).map_err(err)?,
            "DEPENDENCY" => {
                if args.len() < 2 {
                    return Err(err("DEPENDENCY needs a parent and at least one child".into()));
                }
                let parent = resolve(engine, args[0]).map_err(err)?;
                for child in &args[1..] {
                    let child = resolve(engine, child).map_err(err)?;
                    engine
                        .add_dependency(parent, child)
                        .map_err(|e| err(e.to_string()))?;
                }
            }
            "PARENT" => {
                let split = args
                    .iter()
                    .position(|t| t.eq_ignore_ascii_case("CHILD"))
                    .ok_or_else(|| err("PARENT without CHILD".into()))?;
                let (parents, children) = (&args[..split], &args[split + 1..]);
                if parents.is_empty() || children.is_empty() {
                    return Err(err("PARENT ... CHILD ... needs nodes on both sides".into()));
                }
                for p in parents {
                    let p = resolve(engine, p).map_err(err)?;
                    for c in children {
                        let c = resolve(engine, c).map_err(err)?;
                        engine.add_dependency(p, c).map_err(|e| err(e.to_string()))?;
                    }
                }
            }
            "RETRY" => {
                let (node, max, unless) = parse_retry(engine, args).map_err(err)?;
                engine
                    .set_retry(node, max, unless)
                    .map_err(|e| err(e.to_string()))?;
            }
            "SCRIPT" => {
                if args.len() < 3 {
                    return Err(err("SCRIPT needs PRE|POST, a node and a command".into()));
                }
                let kind = match args[0].to_ascii_uppercase().as_str() {
                    "PRE" => ScriptKind::Pre,
                    "POST" => ScriptKind::Post,
                    other => return Err(err(format!("unknown script type '{other}'"))),
                };
                let node = resolve(engine, args[1]).map_err(err)?;
                engine
                    .set_script(node, kind, args[2..].join(" "))
                    .map_err(|e| err(e.to_string()))?;
            }
            other => return Err(err(format!("unknown keyword '{other}'"))),
        }
    }
    Ok(())
}

fn resolve(engine: &DagEngine, name: &str) -> std::result::Result<NodeId, String> {
    engine
        .node_id(name)
        .ok_or_else(|| format!("unknown node '{name}'"))
}

fn parse_job(
    engine: &mut DagEngine,
    args: &[&str],
    base_dir: &Path,
) -> std::result::Result<(), String> {
    let [name, submit, rest @ ..] = args else {
        return Err("JOB needs a name and a submit file".into());
    };

    let mut spec = NodeSpec::new(*name, *submit).in_dir(base_dir);
    let mut rest = rest.iter();
    while let Some(tok) = rest.next() {
        match tok.to_ascii_uppercase().as_str() {
            "DONE" => spec.done = true,
            "DIR" => {
                let dir = rest.next().ok_or("DIR needs a directory")?;
                spec.dir = PathBuf::from(*dir);
            }
            other => return Err(format!("unexpected token '{other}' in JOB")),
        }
    }

    engine.add_node(spec).map(|_| ()).map_err(|e| e.to_string())
}

fn parse_retry(
    engine: &DagEngine,
    args: &[&str],
) -> std::result::Result<(NodeId, u32, Option<i32>), String> {
    match args {
        [name, count] => Ok((resolve(engine, name)?, parse_count(count)?, None)),
        [name, count, kw, value] if kw.eq_ignore_ascii_case("UNLESS-EXIT") => {
            let value = value
                .parse::<i32>()
                .map_err(|_| format!("bad UNLESS-EXIT value '{value}'"))?;
            Ok((resolve(engine, name)?, parse_count(count)?, Some(value)))
        }
        _ => Err("RETRY needs a node, a count and optionally UNLESS-EXIT <value>".into()),
    }
}

fn parse_count(s: &str) -> std::result::Result<u32, String> {
    s.parse::<u32>()
        .map_err(|_| format!("bad retry count '{s}'"))
}
