//! Execution attempts and their lifecycle.

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, RunId};

/// Lifecycle state of a run.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Dispatched and waiting for a worker.
    Pending,
    /// Transfer in progress.
    Running,
    /// Finished successfully, possibly with warnings.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl RunStatus {
    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` when the lifecycle permits moving to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }

    /// Lowercase label used in output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a job.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Run {
    /// Catalogue identifier.
    pub id: RunId,
    /// Job this run belongs to.
    pub job_id: JobId,
    /// Lifecycle state.
    pub status: RunStatus,
    /// Dispatch time.
    pub start_time: DateTime<Utc>,
    /// Time the run became terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Total size of the stored snapshot in bytes.
    pub size_bytes: u64,
    /// Number of regular files in the stored snapshot.
    pub file_count: u64,
    /// Diagnostic text for failed runs.
    pub error: Option<String>,
    /// Diagnostic text for runs that completed with warnings.
    pub warning: Option<String>,
    /// Local directory holding the snapshot.
    pub snapshot_path: Option<Utf8PathBuf>,
}

impl Run {
    pub(crate) const fn pending(id: RunId, job_id: JobId, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id,
            status: RunStatus::Pending,
            start_time,
            end_time: None,
            size_bytes: 0,
            file_count: 0,
            error: None,
            warning: None,
            snapshot_path: None,
        }
    }

    /// Returns `true` when the run is pending or running.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Terminal outcome applied to a run in one atomic update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunCompletion {
    /// `Completed` or `Failed`.
    pub status: RunStatus,
    /// Time the run finished.
    pub end_time: DateTime<Utc>,
    /// Total stored bytes.
    pub size_bytes: u64,
    /// Stored regular files.
    pub file_count: u64,
    /// Failure diagnostic.
    pub error: Option<String>,
    /// Warning diagnostic.
    pub warning: Option<String>,
    /// Snapshot directory written by the transfer, if one was attempted.
    pub snapshot_path: Option<Utf8PathBuf>,
}

impl RunCompletion {
    /// Builds a failed completion carrying `error`.
    #[must_use]
    pub const fn failed(end_time: DateTime<Utc>, error: String) -> Self {
        Self {
            status: RunStatus::Failed,
            end_time,
            size_bytes: 0,
            file_count: 0,
            error: Some(error),
            warning: None,
            snapshot_path: None,
        }
    }
}
