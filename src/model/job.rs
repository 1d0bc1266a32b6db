//! Backup job definitions.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClientId, JobId, ValidationError, require_text};
use crate::schedule::CronSchedule;

/// A backup definition bound to one client and one source path.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Job {
    /// Catalogue identifier.
    pub id: JobId,
    /// Display name.
    pub name: String,
    /// Owning client.
    pub client_id: ClientId,
    /// Absolute path on the client to back up.
    pub source_path: Utf8PathBuf,
    /// Optional five-field schedule.
    pub schedule: Option<CronSchedule>,
    /// Disabled jobs are never scheduled but can still be triggered manually.
    pub enabled: bool,
    /// Time of the most recent dispatch, regardless of outcome.
    pub last_run: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Returns the schedule when the job is enabled and scheduled.
    #[must_use]
    pub fn active_schedule(&self) -> Option<&CronSchedule> {
        self.schedule.as_ref().filter(|_| self.enabled)
    }
}

/// Input for creating a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewJob {
    /// Display name.
    pub name: String,
    /// Owning client; must exist.
    pub client_id: ClientId,
    /// Absolute path on the client.
    pub source_path: Utf8PathBuf,
    /// Optional five-field schedule.
    pub schedule: Option<CronSchedule>,
    /// Whether the scheduler should consider the job.
    pub enabled: bool,
}

impl NewJob {
    pub(crate) fn into_job(self, id: JobId, now: DateTime<Utc>) -> Result<Job, ValidationError> {
        Ok(Job {
            id,
            name: require_text(&self.name, "name")?,
            client_id: self.client_id,
            source_path: validate_source_path(&self.source_path)?,
            schedule: self.schedule,
            enabled: self.enabled,
            last_run: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Typed partial update for a job. Only populated fields change.
///
/// `schedule` distinguishes "leave unchanged" (`None`) from "clear"
/// (`Some(None)`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New owning client; must exist.
    pub client_id: Option<ClientId>,
    /// New source path.
    pub source_path: Option<Utf8PathBuf>,
    /// New schedule, or `Some(None)` to remove it.
    pub schedule: Option<Option<CronSchedule>>,
    /// New enabled flag.
    pub enabled: Option<bool>,
}

impl JobUpdate {
    /// Returns `true` when no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.client_id.is_none()
            && self.source_path.is_none()
            && self.schedule.is_none()
            && self.enabled.is_none()
    }

    pub(crate) fn apply(self, job: &Job, now: DateTime<Utc>) -> Result<Job, ValidationError> {
        let mut updated = job.clone();
        if let Some(name) = self.name {
            updated.name = require_text(&name, "name")?;
        }
        if let Some(client_id) = self.client_id {
            updated.client_id = client_id;
        }
        if let Some(path) = self.source_path {
            updated.source_path = validate_source_path(&path)?;
        }
        if let Some(schedule) = self.schedule {
            updated.schedule = schedule;
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        updated.updated_at = now;
        Ok(updated)
    }
}

fn validate_source_path(path: &Utf8Path) -> Result<Utf8PathBuf, ValidationError> {
    if !path.is_absolute() {
        return Err(ValidationError::new("source_path", "must be absolute"));
    }
    if path.as_str().contains(['\n', '\r', '\0']) {
        return Err(ValidationError::new(
            "source_path",
            "must not contain control characters",
        ));
    }
    Ok(path.to_path_buf())
}
