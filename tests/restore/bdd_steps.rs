//! BDD step definitions for restores.

use backhaul::RestoreOptions;
use backhaul::test_support::{output, rsync_stats};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{RestoreContext, RestoreOutcome, back_up};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a completed backup of \"{source}\"")]
fn completed_backup(mut restore_context: RestoreContext, source: String) -> RestoreContext {
    restore_context
        .runner
        .on_match("--stats", output(Some(0), rsync_stats(2, 512), ""));
    restore_context.run = Some(back_up(&restore_context, &source));
    restore_context
}

#[given("a failed backup of \"{source}\"")]
fn failed_backup(mut restore_context: RestoreContext, source: String) -> RestoreContext {
    restore_context.runner.on_match(
        "--stats",
        output(Some(12), "", "rsync error: error in rsync protocol data stream"),
    );
    restore_context.run = Some(back_up(&restore_context, &source));
    restore_context
}

fn restore(mut restore_context: RestoreContext, destination: Option<&str>) -> RestoreContext {
    let run = restore_context
        .run
        .unwrap_or_else(|| panic!("test setup requires a backup"));
    restore_context.commands_before_restore = restore_context.runner.invocations().len();
    restore_context.outcome = Some(
        match restore_context
            .service
            .restore(run, destination, RestoreOptions::default())
        {
            Ok(report) => RestoreOutcome::Reported(report),
            Err(err) => RestoreOutcome::Rejected(err.kind()),
        },
    );
    restore_context
}

#[when("I restore it to \"{destination}\"")]
fn restore_to(restore_context: RestoreContext, destination: String) -> RestoreContext {
    restore(restore_context, Some(&destination))
}

#[when("I restore it to its original location")]
fn restore_in_place(restore_context: RestoreContext) -> RestoreContext {
    restore(restore_context, None)
}

#[then("the restore succeeds")]
fn restore_succeeds(restore_context: &RestoreContext) -> Result<(), StepError> {
    match restore_context.outcome.as_ref() {
        Some(RestoreOutcome::Reported(report)) if report.success => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a successful restore, got {other:?}"
        ))),
    }
}

#[then("the restore is rejected with \"{kind}\"")]
fn restore_rejected(restore_context: &RestoreContext, kind: String) -> Result<(), StepError> {
    match restore_context.outcome.as_ref() {
        Some(RestoreOutcome::Rejected(actual)) if actual.as_str() == kind => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected rejection {kind}, got {other:?}"
        ))),
    }
}

#[then("no rsync push was attempted")]
fn no_push(restore_context: &RestoreContext) -> Result<(), StepError> {
    let after = restore_context.runner.invocations().len();
    if after == restore_context.commands_before_restore {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no further commands, got {:?}",
            restore_context.runner.command_strings()
        )))
    }
}

#[then("rsync pushed the snapshot to \"{target}\"")]
fn pushed_to(restore_context: &RestoreContext, target: String) -> Result<(), StepError> {
    let expected = format!("backup@files.example.test:{target}");
    let push = restore_context
        .runner
        .invocations()
        .into_iter()
        .skip(restore_context.commands_before_restore)
        .find(|call| call.has_arg(&expected));
    match push {
        Some(call) if !call.has_arg("--delete") => Ok(()),
        Some(call) => Err(StepError::Assertion(format!(
            "restore must not delete client files: {}",
            call.command_string()
        ))),
        None => Err(StepError::Assertion(format!(
            "expected a push to {expected}, got {:?}",
            restore_context.runner.command_strings()
        ))),
    }
}
