// tests/submit_dag.rs

mod common;

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use gridflow::cli::{normalize_legacy_args, SubmitDagArgs};
use gridflow::config::DagmanSection;
use gridflow::dagman;
use gridflow::fs::{FileSystem, RealFileSystem};
use gridflow::submit_dag::{self, SubmitFiles};

use crate::common::{dagman_args, init_tracing};

type TestResult = Result<(), Box<dyn Error>>;

fn write_dag(dir: &Path) -> Result<PathBuf, Box<dyn Error>> {
    let dag = dir.join("diamond.dag");
    fs::write(
        &dag,
        "JOB A a.sub\nJOB B b.sub\nJOB C c.sub\nJOB D d.sub\n\
         PARENT A CHILD B C\nPARENT B C CHILD D\n",
    )?;
    Ok(dag)
}

fn submit_args(dag: &Path, extra: &[&str]) -> SubmitDagArgs {
    let dag = dag.to_string_lossy().into_owned();
    let mut argv: Vec<String> = vec!["condor_submit_dag".into()];
    argv.extend(extra.iter().map(|s| s.to_string()));
    argv.push(dag);
    SubmitDagArgs::try_parse_from(normalize_legacy_args(argv)).expect("valid arguments")
}

#[test]
fn submit_description_is_written_next_to_the_dag() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let dag = write_dag(tmp.path())?;

    let files = submit_dag::prepare(
        &RealFileSystem,
        &submit_args(&dag, &["-maxjobs", "4"]),
        Path::new("/usr/bin/condor_dagman"),
    )?;
    assert_eq!(files, SubmitFiles::for_primary(&dag));

    let text = fs::read_to_string(&files.submit_file)?;
    assert!(text.contains("-Dag"), "{text}");
    assert!(text.contains("diamond.dag"), "{text}");
    assert!(text.contains("-MaxJobs 4"), "{text}");
    assert!(text.trim_end().ends_with("queue"), "{text}");
    Ok(())
}

#[test]
fn resubmission_needs_force() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let dag = write_dag(tmp.path())?;
    let dagman = Path::new("condor_dagman");

    let files = submit_dag::prepare(&RealFileSystem, &submit_args(&dag, &[]), dagman)?;
    fs::write(&files.debug_log, "previous run\n")?;

    let again = submit_dag::prepare(&RealFileSystem, &submit_args(&dag, &[]), dagman);
    assert!(again.is_err(), "existing submit description must be kept");

    submit_dag::prepare(&RealFileSystem, &submit_args(&dag, &["-force"]), dagman)?;
    assert!(files.submit_file.exists());
    assert!(!files.debug_log.exists(), "-force clears earlier outputs");
    Ok(())
}

#[test]
fn cyclic_dag_is_refused_before_anything_is_written() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let dag = tmp.path().join("loop.dag");
    fs::write(&dag, "JOB A a.sub\nJOB B b.sub\nPARENT A CHILD B\nPARENT B CHILD A\n")?;

    let result = submit_dag::prepare(
        &RealFileSystem,
        &submit_args(&dag, &[]),
        Path::new("condor_dagman"),
    );
    assert!(result.is_err());
    assert!(!SubmitFiles::for_primary(&dag).submit_file.exists());
    Ok(())
}

#[test]
fn dagman_run_takes_and_releases_the_lock_on_disk() -> TestResult {
    init_tracing();
    let tmp = tempfile::tempdir()?;
    let dag = write_dag(tmp.path())?;
    let fs_dyn: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let args = dagman_args(&dag.to_string_lossy(), &[]);

    let run = dagman::prepare(Arc::clone(&fs_dyn), &args, &DagmanSection::default())?;
    assert!(!run.recovery_mode);
    assert!(run.paths.lock.exists());
    assert_eq!(run.engine.len(), 4);

    dagman::release_lock(fs_dyn.as_ref(), &run.paths.lock);
    assert!(!run.paths.lock.exists());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn submit_reads_the_cluster_from_the_submit_command() -> TestResult {
    use std::os::unix::fs::PermissionsExt;

    init_tracing();
    let tmp = tempfile::tempdir()?;
    let script = tmp.path().join("fake_submit");
    fs::write(
        &script,
        "#!/bin/sh\necho 'Submitting job(s).'\necho '1 job(s) submitted to cluster 4242.'\n",
    )?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

    let id = submit_dag::submit(&script.to_string_lossy(), &tmp.path().join("d.condor.sub")).await?;
    assert_eq!(id.cluster, 4242);

    let failing = tmp.path().join("failing_submit");
    fs::write(&failing, "#!/bin/sh\necho 'no schedd' >&2\nexit 1\n")?;
    fs::set_permissions(&failing, fs::Permissions::from_mode(0o755))?;
    let err = submit_dag::submit(&failing.to_string_lossy(), Path::new("x.sub"))
        .await
        .expect_err("non-zero exit must fail");
    assert!(err.to_string().contains("no schedd"), "{err:#}");
    Ok(())
}
