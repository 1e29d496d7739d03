// tests/dagman_runtime.rs

mod common;

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gridflow::dag::{RecoveryLog, RecoveryRecord};
use gridflow::engine::{RuntimeEvent, EXIT_ABORTED, EXIT_FAILED, EXIT_SUCCESS};
use gridflow::fs::mock::MockFileSystem;
use gridflow::fs::FileSystem;
use gridflow::types::CondorId;
use gridflow::userlog::{LogEvent, LogEventKind, Termination, UserLogWriter};
use gridflow_test_utils::fake_submitter::FakeOutcome;
use gridflow_test_utils::DagBuilder;

use crate::common::{dagman_args, init_tracing, prepare_dag, run_dag};

type TestResult = Result<(), Box<dyn Error>>;

const DAG: &str = "w/d.dag";

fn fs_with(text: &str) -> Arc<MockFileSystem> {
    let fs = Arc::new(MockFileSystem::new());
    fs.add_file(DAG, text);
    fs
}

#[tokio::test]
async fn chain_runs_to_completion() -> TestResult {
    init_tracing();
    let dag = DagBuilder::new()
        .job("A")
        .job("B")
        .job("C")
        .edge("A", "B")
        .edge("B", "C");
    let fs = fs_with(dag.text());
    let args = dagman_args(DAG, &[]);

    let run = prepare_dag(&fs, &args, |s| s).await;
    let (code, ledger, paths) = run_dag(&fs, run).await;

    assert_eq!(code, EXIT_SUCCESS);
    assert_eq!(ledger.lock().unwrap().submitted, vec!["A", "B", "C"]);
    assert!(!fs.exists(&paths.lock));
    assert!(!fs.exists(Path::new("w/d.dag.rescue001")));
    Ok(())
}

#[tokio::test]
async fn failed_node_writes_a_rescue_dag() -> TestResult {
    init_tracing();
    let dag = DagBuilder::new()
        .job("A")
        .job("B")
        .job("C")
        .edge("A", "B");
    let fs = fs_with(dag.text());
    let args = dagman_args(DAG, &[]);

    let run = prepare_dag(&fs, &args, |s| s.script("A", &[FakeOutcome::Exit(1)])).await;
    let (code, ledger, _) = run_dag(&fs, run).await;

    assert_eq!(code, EXIT_FAILED);
    let submitted = ledger.lock().unwrap().submitted.clone();
    assert!(!submitted.contains(&"B".to_string()));

    let rescue = fs
        .contents("w/d.dag.rescue001")
        .ok_or("rescue DAG not written")?;
    assert!(rescue.contains("JOB C C.sub DONE"), "{rescue}");
    assert!(rescue.lines().any(|l| l == "JOB A A.sub"), "{rescue}");
    assert!(rescue.lines().any(|l| l == "JOB B B.sub"), "{rescue}");
    assert!(rescue.contains("PARENT A CHILD B"), "{rescue}");
    Ok(())
}

#[tokio::test]
async fn failed_submission_is_undone_and_retried() -> TestResult {
    init_tracing();
    let fs = fs_with(DagBuilder::new().job("A").text());
    let args = dagman_args(DAG, &[]);

    let run = prepare_dag(&fs, &args, |s| s.script("A", &[FakeOutcome::SubmitFails])).await;
    let (code, ledger, paths) = run_dag(&fs, run).await;

    assert_eq!(code, EXIT_SUCCESS);
    assert_eq!(ledger.lock().unwrap().submitted, vec!["A", "A"]);
    let log = fs.contents(&paths.recovery_log).ok_or("no recovery log")?;
    let undo = log.find("UndoJob 0").ok_or("UndoJob missing")?;
    let second_submit = log.rfind("SubmitJob 0").ok_or("SubmitJob missing")?;
    assert!(undo < second_submit, "{log}");
    Ok(())
}

#[tokio::test]
async fn shutdown_removes_running_jobs_and_writes_a_rescue_dag() -> TestResult {
    init_tracing();
    let fs = fs_with(DagBuilder::new().job("A").job("B").edge("A", "B").text());
    let args = dagman_args(DAG, &[]);

    let run = prepare_dag(&fs, &args, |s| s.script("A", &[FakeOutcome::Hang])).await;
    let tx = run.tx.clone();
    let watched = Arc::clone(&run.ledger);

    let driver = async move {
        loop {
            if !watched.lock().unwrap().submitted.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(RuntimeEvent::ShutdownRequested)
            .await
            .expect("runtime still listening");
    };
    let ((code, ledger, _), ()) = tokio::join!(run_dag(&fs, run), driver);

    assert_eq!(code, EXIT_ABORTED);
    assert_eq!(ledger.lock().unwrap().removed, vec![CondorId::new(100, 0, 0)]);
    let rescue = fs
        .contents("w/d.dag.rescue001")
        .ok_or("rescue DAG not written")?;
    assert!(
        rescue
            .lines()
            .filter(|l| l.starts_with("JOB "))
            .all(|l| !l.ends_with(" DONE")),
        "{rescue}"
    );
    Ok(())
}

#[tokio::test]
async fn restart_after_crash_does_not_resubmit_logged_jobs() -> TestResult {
    init_tracing();
    let dag = DagBuilder::new()
        .job("A")
        .job("B")
        .job("C")
        .edge("A", "B");
    let fs = fs_with(dag.text());
    let args = dagman_args(DAG, &[]);

    // First run: A was submitted and got its id; the crash hit between
    // C's SubmitJob record and its job id.
    let first = prepare_dag(&fs, &args, |s| s).await;
    assert!(!first.recovery_mode);
    let a = CondorId::new(100, 0, 0);
    let c = CondorId::new(101, 0, 0);
    {
        let fs_dyn: Arc<dyn FileSystem> = fs.clone();
        let recovery = RecoveryLog::new(Arc::clone(&fs_dyn), &first.paths.recovery_log);
        recovery.append(&RecoveryRecord::SubmitJob { node: 0 })?;
        recovery.append(&RecoveryRecord::SetCondorId { node: 0, id: a })?;
        recovery.append(&RecoveryRecord::SubmitJob { node: 2 })?;

        let log = UserLogWriter::new(fs_dyn, &first.paths.event_log);
        log.write(&LogEvent::at(a, LogEventKind::Submit { node: Some("A".into()) }, 0))?;
        log.write(&LogEvent::at(c, LogEventKind::Submit { node: Some("C".into()) }, 0))?;
        log.write(&LogEvent::at(a, LogEventKind::Terminated(Termination::Normal(0)), 0))?;
        log.write(&LogEvent::at(c, LogEventKind::Terminated(Termination::Normal(0)), 0))?;
    }
    drop(first);

    let second = prepare_dag(&fs, &args, |s| s.starting_at(200)).await;
    assert!(second.recovery_mode);
    let (code, ledger, paths) = run_dag(&fs, second).await;

    assert_eq!(code, EXIT_SUCCESS);
    assert_eq!(ledger.lock().unwrap().submitted, vec!["B"]);
    assert!(!fs.exists(&paths.lock));
    let log = fs.contents(&paths.recovery_log).ok_or("no recovery log")?;
    assert!(log.contains("SetCondorID 2 101 0 0"), "{log}");
    Ok(())
}

#[tokio::test]
async fn restart_ignores_events_of_an_earlier_failed_attempt() -> TestResult {
    init_tracing();
    let fs = fs_with(DagBuilder::new().job("A").retry("A", 2).text());
    let args = dagman_args(DAG, &[]);

    // First attempt failed and was retried; the crash hit before the
    // retry's job id reached the recovery log.
    let first = prepare_dag(&fs, &args, |s| s).await;
    let failed = CondorId::new(100, 0, 0);
    let retry = CondorId::new(101, 0, 0);
    {
        let fs_dyn: Arc<dyn FileSystem> = fs.clone();
        let recovery = RecoveryLog::new(Arc::clone(&fs_dyn), &first.paths.recovery_log);
        recovery.append(&RecoveryRecord::SubmitJob { node: 0 })?;
        recovery.append(&RecoveryRecord::SetCondorId { node: 0, id: failed })?;
        recovery.append(&RecoveryRecord::TerminateJob {
            node: 0,
            return_value: 1,
        })?;
        recovery.append(&RecoveryRecord::SubmitJob { node: 0 })?;

        let log = UserLogWriter::new(fs_dyn, &first.paths.event_log);
        log.write(&LogEvent::at(failed, LogEventKind::Submit { node: Some("A".into()) }, 0))?;
        log.write(&LogEvent::at(failed, LogEventKind::Terminated(Termination::Normal(1)), 0))?;
        log.write(&LogEvent::at(retry, LogEventKind::Submit { node: Some("A".into()) }, 0))?;
        log.write(&LogEvent::at(retry, LogEventKind::Terminated(Termination::Normal(0)), 0))?;
    }
    drop(first);

    let second = prepare_dag(&fs, &args, |s| s.starting_at(200)).await;
    assert!(second.recovery_mode);
    let (code, ledger, paths) = run_dag(&fs, second).await;

    assert_eq!(code, EXIT_SUCCESS);
    assert!(ledger.lock().unwrap().submitted.is_empty(), "A must not be resubmitted");
    let log = fs.contents(&paths.recovery_log).ok_or("no recovery log")?;
    assert_eq!(log.matches("SetCondorID 0 100 0 0").count(), 1, "{log}");
    assert_eq!(log.matches("TerminateJob 0 1").count(), 1, "{log}");
    assert!(log.contains("SetCondorID 0 101 0 0"), "{log}");
    assert!(log.contains("TerminateJob 0 0"), "{log}");
    Ok(())
}
