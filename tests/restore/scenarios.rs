//! BDD scenarios for restores.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RestoreContext, restore_context};

#[scenario(
    path = "tests/features/restore.feature",
    name = "Reject destinations containing shell metacharacters"
)]
fn scenario_reject_metacharacters(restore_context: RestoreContext) {
    drop(restore_context);
}

#[scenario(
    path = "tests/features/restore.feature",
    name = "Restore to the original source path by default"
)]
fn scenario_restore_in_place(restore_context: RestoreContext) {
    drop(restore_context);
}

#[scenario(
    path = "tests/features/restore.feature",
    name = "Restore to an alternative directory"
)]
fn scenario_restore_elsewhere(restore_context: RestoreContext) {
    drop(restore_context);
}

#[scenario(
    path = "tests/features/restore.feature",
    name = "Refuse to restore a failed backup"
)]
fn scenario_refuse_failed_backup(restore_context: RestoreContext) {
    drop(restore_context);
}
