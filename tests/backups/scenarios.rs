//! BDD scenarios for backup runs.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BackupContext, backup_context};

#[scenario(
    path = "tests/features/backups.feature",
    name = "Record the totals of a successful backup"
)]
fn scenario_successful_backup(backup_context: BackupContext) {
    drop(backup_context);
}

#[scenario(
    path = "tests/features/backups.feature",
    name = "Refuse a second run while one is active"
)]
fn scenario_single_active_run(backup_context: BackupContext) {
    drop(backup_context);
}

#[scenario(
    path = "tests/features/backups.feature",
    name = "Fail jobs whose client was deleted"
)]
fn scenario_dangling_client(backup_context: BackupContext) {
    drop(backup_context);
}

#[scenario(
    path = "tests/features/backups.feature",
    name = "Record rsync failures on the run"
)]
fn scenario_rsync_failure(backup_context: BackupContext) {
    drop(backup_context);
}
