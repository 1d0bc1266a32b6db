//! BDD step definitions for backup runs.

use std::time::Duration;

use backhaul::test_support::{output, rsync_stats};
use backhaul::{Run, RunStatus};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{BackupContext, BackupOutcome, seed_job};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a client \"{name}\" with a job backing up \"{source}\"")]
fn client_with_job(mut backup_context: BackupContext, name: String, source: String) -> BackupContext {
    backup_context.job = Some(seed_job(&backup_context.service, &name, &source));
    backup_context
}

#[given("rsync reports {files:u64} files totalling {bytes:u64} bytes")]
fn rsync_reports(backup_context: BackupContext, files: u64, bytes: u64) -> BackupContext {
    backup_context
        .runner
        .on_match("--stats", output(Some(0), rsync_stats(files, bytes), ""));
    backup_context
}

#[given("rsync exits with status {code:i32}")]
fn rsync_exits(backup_context: BackupContext, code: i32) -> BackupContext {
    backup_context.runner.on_match(
        "--stats",
        output(Some(code), "", "rsync error: some files could not be transferred"),
    );
    backup_context
}

#[given("the client has been deleted")]
fn client_deleted(backup_context: BackupContext) -> BackupContext {
    let job = backup_context
        .job
        .unwrap_or_else(|| panic!("test setup requires a job"));
    let client = backup_context
        .service
        .job(job)
        .unwrap_or_else(|err| panic!("job should exist: {err}"))
        .client_id;
    backup_context
        .service
        .delete_client(client)
        .unwrap_or_else(|err| panic!("client should delete: {err}"));
    backup_context
}

#[when("the job is run")]
fn run_job(mut backup_context: BackupContext) -> BackupContext {
    let job = backup_context
        .job
        .unwrap_or_else(|| panic!("test setup requires a job"));
    backup_context.gate.open();
    let service = backup_context.service.clone();
    let result = backup_context
        .runtime
        .block_on(async move { service.run_now(job).await });
    backup_context.outcome = Some(match result {
        Ok(run) => BackupOutcome::Finished(run),
        Err(err) => BackupOutcome::Rejected(err.kind()),
    });
    backup_context
}

#[when("the job is triggered again while its first transfer is in flight")]
fn trigger_twice(mut backup_context: BackupContext) -> BackupContext {
    let job = backup_context
        .job
        .unwrap_or_else(|| panic!("test setup requires a job"));
    let service = backup_context.service.clone();
    let gate = backup_context.gate.clone();
    let outcome = backup_context.runtime.block_on(async move {
        let first = service
            .trigger_run(job)
            .unwrap_or_else(|err| panic!("first trigger should start: {err}"));
        gate.wait_for_entries(1).await;
        let second = service.trigger_run(job).err().map(|err| err.kind());
        gate.open();
        while service.engine().is_running(job) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let finished = service
            .list_history(job, None)
            .unwrap_or_else(|err| panic!("history should load: {err}"))
            .into_iter()
            .find(|run| run.id == first.id);
        BackupOutcome::Contended {
            second,
            first: finished,
        }
    });
    backup_context.outcome = Some(outcome);
    backup_context
}

fn finished(backup_context: &BackupContext) -> Result<&Run, StepError> {
    match backup_context.outcome.as_ref() {
        Some(BackupOutcome::Finished(run)) => Ok(run),
        other => Err(StepError::Assertion(format!(
            "expected a finished run, got {other:?}"
        ))),
    }
}

#[then("the run completes with {files:u64} files and {bytes:u64} bytes")]
fn run_completes(backup_context: &BackupContext, files: u64, bytes: u64) -> Result<(), StepError> {
    let run = finished(backup_context)?;
    if run.status == RunStatus::Completed && run.file_count == files && run.size_bytes == bytes {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected completed run with {files} files and {bytes} bytes, got {run:?}"
        )))
    }
}

#[then("the snapshot directory exists")]
fn snapshot_exists(backup_context: &BackupContext) -> Result<(), StepError> {
    let run = finished(backup_context)?;
    match run.snapshot_path.as_ref() {
        Some(path) if path.is_dir() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an existing snapshot directory, got {other:?}"
        ))),
    }
}

#[then("the run fails mentioning \"{text}\"")]
fn run_fails(backup_context: &BackupContext, text: String) -> Result<(), StepError> {
    let run = finished(backup_context)?;
    let mentions = run
        .error
        .as_deref()
        .is_some_and(|message| message.contains(&text));
    if run.status == RunStatus::Failed && mentions {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failed run mentioning {text}, got {run:?}"
        )))
    }
}

#[then("the attempt is rejected with \"{kind}\"")]
fn attempt_rejected(backup_context: &BackupContext, kind: String) -> Result<(), StepError> {
    match backup_context.outcome.as_ref() {
        Some(BackupOutcome::Rejected(actual)) if actual.as_str() == kind => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected rejection {kind}, got {other:?}"
        ))),
    }
}

#[then("the second attempt is rejected with \"{kind}\"")]
fn second_rejected(backup_context: &BackupContext, kind: String) -> Result<(), StepError> {
    match backup_context.outcome.as_ref() {
        Some(BackupOutcome::Contended {
            second: Some(actual),
            ..
        }) if actual.as_str() == kind => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected second attempt to fail with {kind}, got {other:?}"
        ))),
    }
}

#[then("the first run still completes")]
fn first_completes(backup_context: &BackupContext) -> Result<(), StepError> {
    match backup_context.outcome.as_ref() {
        Some(BackupOutcome::Contended {
            first: Some(run), ..
        }) if run.status == RunStatus::Completed => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected the first run to complete, got {other:?}"
        ))),
    }
}

#[then("no remote command was executed")]
fn nothing_executed(backup_context: &BackupContext) -> Result<(), StepError> {
    let invocations = backup_context.runner.invocations();
    if invocations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no commands, got {:?}",
            backup_context.runner.command_strings()
        )))
    }
}

