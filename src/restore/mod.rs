//! Copies a stored snapshot back onto its client.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::catalogue::{Catalogue, CatalogueError};
use crate::model::{RunId, RunStatus};
use crate::session::{Connector, SessionError, verify_elevation};
use crate::transfer::{Mirror, Push, TransferError, TransferStats};

/// Characters refused in restore destinations.
pub const FORBIDDEN_CHARACTERS: &[char] = &[';', '&', '|', '`', '$', '\n', '\r'];

/// Errors raised before or while restoring.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RestoreError {
    /// Raised when the destination path fails validation.
    #[error("invalid restore destination {path:?}: {reason}")]
    InvalidDestination {
        /// Rejected destination.
        path: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Raised when the run did not complete successfully.
    #[error("run {run} is {status} and cannot be restored")]
    NotRestorable {
        /// Requested run.
        run: RunId,
        /// Its current status.
        status: RunStatus,
    },
    /// Raised when the run's snapshot directory is gone.
    #[error("snapshot for run {run} is missing")]
    MissingSnapshot {
        /// Requested run.
        run: RunId,
    },
    /// Raised when the run, its job, or its client cannot be resolved.
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    /// Raised when connecting to or verifying the client fails.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Raised when rsync cannot be started or its connection fails.
    #[error(transparent)]
    Transfer(TransferError),
}

/// Restore behaviour switches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RestoreOptions {
    /// Preview the copy with `rsync --dry-run`.
    pub dry_run: bool,
}

/// Outcome of a restore that reached rsync.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RestoreReport {
    /// Whether rsync finished successfully.
    pub success: bool,
    /// Human readable summary or the rsync diagnostic.
    pub message: String,
    /// Destination on the client.
    pub destination: Utf8PathBuf,
    /// Totals reported by rsync on success.
    pub stats: Option<TransferStats>,
}

/// Checks a restore destination and returns it as a path.
///
/// # Errors
///
/// Returns [`RestoreError::InvalidDestination`] when the path is not
/// absolute or contains any of [`FORBIDDEN_CHARACTERS`].
pub fn validate_destination(path: &str) -> Result<Utf8PathBuf, RestoreError> {
    let reject = |reason: String| RestoreError::InvalidDestination {
        path: path.to_owned(),
        reason,
    };
    if !path.starts_with('/') {
        return Err(reject(String::from("path must be absolute")));
    }
    if let Some(found) = path.chars().find(|ch| FORBIDDEN_CHARACTERS.contains(ch)) {
        return Err(reject(format!("path must not contain {found:?}")));
    }
    Ok(Utf8PathBuf::from(path))
}

/// Pushes completed snapshots back to clients.
#[derive(Clone, Debug)]
pub struct Restorer {
    catalogue: Arc<Catalogue>,
    connector: Connector,
    mirror: Mirror,
}

impl Restorer {
    /// Creates a restorer.
    #[must_use]
    pub const fn new(catalogue: Arc<Catalogue>, connector: Connector, mirror: Mirror) -> Self {
        Self {
            catalogue,
            connector,
            mirror,
        }
    }

    /// Restores the snapshot of `run` to `destination`, or to the job's
    /// source path when no destination is given. The run record is never
    /// modified.
    ///
    /// A non-zero rsync status produces a report with `success == false`;
    /// every earlier failure is an error and nothing is copied.
    ///
    /// # Errors
    ///
    /// Returns [`RestoreError::InvalidDestination`] before any lookup or
    /// connection, then [`RestoreError::NotRestorable`],
    /// [`RestoreError::MissingSnapshot`], catalogue errors for a missing
    /// run, job or client, session errors (including failed elevation), or
    /// [`RestoreError::Transfer`] for rsync transport failures.
    pub fn restore(
        &self,
        run_id: RunId,
        destination: Option<&str>,
        options: RestoreOptions,
    ) -> Result<RestoreReport, RestoreError> {
        let requested = destination
            .filter(|text| !text.is_empty())
            .map(validate_destination)
            .transpose()?;

        let run = self.catalogue.run(run_id)?;
        if run.status != RunStatus::Completed {
            return Err(RestoreError::NotRestorable {
                run: run_id,
                status: run.status,
            });
        }
        let snapshot = run
            .snapshot_path
            .filter(|path| path.is_dir())
            .ok_or(RestoreError::MissingSnapshot { run: run_id })?;
        let (job, client) = self.catalogue.resolve_job(run.job_id)?;
        let target = match requested {
            Some(path) => path,
            None => validate_destination(job.source_path.as_str())?,
        };

        if client.elevated {
            let session = self.connector.open(&client)?;
            verify_elevation(&session)?;
            session.close();
        }

        info!(run_id = %run_id, client_id = %client.id, destination = %target, dry_run = options.dry_run, "restoring snapshot");
        let outcome = self.mirror.push(
            &client,
            Push {
                snapshot: &snapshot,
                destination: &target,
                dry_run: options.dry_run,
            },
        );
        match outcome {
            Ok(report) => {
                let verb = if options.dry_run { "would restore" } else { "restored" };
                let mut message = format!("{verb} run {run_id} to {}:{target}", client.name);
                if let Some(warning) = report.warning {
                    message.push_str("; ");
                    message.push_str(&warning);
                }
                Ok(RestoreReport {
                    success: true,
                    message,
                    destination: target,
                    stats: Some(report.stats),
                })
            }
            Err(TransferError::Failed { detail, status, .. }) => {
                warn!(run_id = %run_id, status, "restore failed");
                Ok(RestoreReport {
                    success: false,
                    message: format!("rsync exited with status {status}: {detail}"),
                    destination: target,
                    stats: None,
                })
            }
            Err(TransferError::Session(err)) => Err(RestoreError::Session(err)),
            Err(err) => Err(RestoreError::Transfer(err)),
        }
    }
}
