//! Client registry: the store of clients, jobs, and runs.
//!
//! All mutations happen under one mutex. When the catalogue is backed by a
//! file, each mutation is applied to a draft copy of the tables, persisted,
//! and only then published, so a failed write leaves memory and disk in
//! agreement. Run outcomes are the exception: they are published first so
//! a failed write cannot leave a finished run looking active.
//!
//! One process at a time may write a catalogue file. The writer holds an
//! exclusive lock on `<file>.lock` for as long as the catalogue is open;
//! other processes can still open the file read-only.

use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{
    Client, ClientId, ClientUpdate, Job, JobId, JobUpdate, NewClient, NewJob, Run, RunCompletion,
    RunId, RunStatus, ValidationError,
};

mod state;
mod store;

use state::CatalogueState;
use store::{SnapshotFile, WriterLock};

/// Detail recorded on runs found unfinished when a catalogue is reopened.
pub const INTERRUPTED_DETAIL: &str = "interrupted: the service stopped before the run finished";

/// Errors raised by catalogue operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CatalogueError {
    /// Raised when a client id does not exist.
    #[error("client {id} not found")]
    ClientNotFound {
        /// Requested id.
        id: ClientId,
    },
    /// Raised when a job id does not exist.
    #[error("job {id} not found")]
    JobNotFound {
        /// Requested id.
        id: JobId,
    },
    /// Raised when a run id does not exist.
    #[error("run {id} not found")]
    RunNotFound {
        /// Requested id.
        id: RunId,
    },
    /// Raised when a job points at a client that no longer exists.
    #[error("job {job} references missing client {client}")]
    Referential {
        /// Job holding the dangling reference.
        job: JobId,
        /// Client id that could not be resolved.
        client: ClientId,
    },
    /// Raised when a job already has a pending or running run.
    #[error("job {job} already has active run {run}")]
    AlreadyRunning {
        /// Job that was triggered.
        job: JobId,
        /// Run currently holding the job.
        run: RunId,
    },
    /// Raised when a run status change breaks the lifecycle.
    #[error("run {run} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Run being updated.
        run: RunId,
        /// Current status.
        from: RunStatus,
        /// Requested status.
        to: RunStatus,
    },
    /// Raised when record input fails validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Raised when the catalogue file cannot be read or written.
    #[error("catalogue storage error at {path}: {message}")]
    Storage {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// Raised when another process holds the writer lock.
    #[error("catalogue {path} is locked by another backhaul process")]
    Locked {
        /// Path of the catalogue file.
        path: Utf8PathBuf,
    },
    /// Raised when a read-only catalogue is asked to change.
    #[error("catalogue {path} is open read-only")]
    ReadOnly {
        /// Path of the catalogue file.
        path: Utf8PathBuf,
    },
    /// Raised when the catalogue file exists but cannot be decoded.
    #[error("catalogue file {path} is corrupt: {message}")]
    Corrupt {
        /// Path of the catalogue file.
        path: Utf8PathBuf,
        /// Decoder error text.
        message: String,
    },
}

/// Aggregate counts for dashboards.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Statistics {
    /// Registered clients.
    pub clients: usize,
    /// Defined jobs.
    pub jobs: usize,
    /// Jobs with the enabled flag set.
    pub enabled_jobs: usize,
    /// Runs of any status.
    pub runs: usize,
    /// Completed runs.
    pub successful_runs: usize,
    /// Failed runs.
    pub failed_runs: usize,
    /// Sum of `size_bytes` across completed runs.
    pub total_stored_bytes: u64,
}

/// A completed run joined with the names of its job and client.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BackupRecord {
    /// The completed run.
    pub run: Run,
    /// Name of the job, if it still exists.
    pub job_name: Option<String>,
    /// Name of the client, if it still exists.
    pub client_name: Option<String>,
}

/// Where mutations go once applied in memory.
#[derive(Debug)]
enum Backing {
    Memory,
    Writer {
        file: SnapshotFile,
        _lock: WriterLock,
    },
    ReadOnly(SnapshotFile),
}

impl Backing {
    const fn file(&self) -> Option<&SnapshotFile> {
        match self {
            Self::Memory => None,
            Self::Writer { file, .. } | Self::ReadOnly(file) => Some(file),
        }
    }

    /// File to persist into, or an error when writes are refused.
    fn writable(&self) -> Result<Option<&SnapshotFile>, CatalogueError> {
        match self {
            Self::Memory => Ok(None),
            Self::Writer { file, .. } => Ok(Some(file)),
            Self::ReadOnly(file) => Err(CatalogueError::ReadOnly {
                path: file.path().to_path_buf(),
            }),
        }
    }
}

/// Thread-safe store of clients, jobs, and runs.
#[derive(Debug)]
pub struct Catalogue {
    state: Mutex<CatalogueState>,
    backing: Backing,
}

impl Catalogue {
    /// Creates an empty catalogue that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(CatalogueState::default()),
            backing: Backing::Memory,
        }
    }

    /// Opens (or creates) a catalogue persisted at `path` for writing.
    ///
    /// The writer lock is taken before anything is read and held until the
    /// catalogue is dropped. Runs left pending or running by a previous
    /// process are marked failed with [`INTERRUPTED_DETAIL`] and an end time
    /// of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::Locked`] when another process is writing
    /// the catalogue, or [`CatalogueError::Storage`] or
    /// [`CatalogueError::Corrupt`] when the file cannot be read, decoded, or
    /// rewritten.
    pub fn open(path: &Utf8Path, now: DateTime<Utc>) -> Result<Self, CatalogueError> {
        let file = SnapshotFile::new(path);
        let lock = file.lock_exclusive()?;
        let mut state = file.load()?.unwrap_or_default();

        let mut recovered = 0_usize;
        for run in state.runs.values_mut().filter(|run| run.is_active()) {
            warn!(run_id = %run.id, job_id = %run.job_id, status = %run.status, "failing run interrupted by restart");
            run.status = RunStatus::Failed;
            run.end_time = Some(now);
            run.error = Some(String::from(INTERRUPTED_DETAIL));
            recovered += 1;
        }
        file.save(&state)?;
        info!(path = %file.path(), clients = state.clients.len(), jobs = state.jobs.len(), recovered, "catalogue opened");

        Ok(Self {
            state: Mutex::new(state),
            backing: Backing::Writer { file, _lock: lock },
        })
    }

    /// Opens the catalogue at `path` for reading only.
    ///
    /// No lock is taken and nothing is written: active runs are reported as
    /// recorded, and a missing file reads as an empty catalogue. Every
    /// mutation fails with [`CatalogueError::ReadOnly`].
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::Storage`] or [`CatalogueError::Corrupt`]
    /// when the file cannot be read or decoded.
    pub fn open_read_only(path: &Utf8Path) -> Result<Self, CatalogueError> {
        let file = SnapshotFile::new(path);
        let state = file.load()?.unwrap_or_default();
        debug!(path = %file.path(), runs = state.runs.len(), "catalogue opened read-only");
        Ok(Self {
            state: Mutex::new(state),
            backing: Backing::ReadOnly(file),
        })
    }

    /// Location of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8Path> {
        self.backing.file().map(SnapshotFile::path)
    }

    /// Returns `true` when mutations are refused.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(self.backing, Backing::ReadOnly(_))
    }

    fn lock(&self) -> MutexGuard<'_, CatalogueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogueState) -> T) -> T {
        f(&self.lock())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut CatalogueState) -> Result<T, CatalogueError>,
    ) -> Result<T, CatalogueError> {
        let target = self.backing.writable()?;
        let mut guard = self.lock();
        let mut draft = guard.clone();
        let value = f(&mut draft)?;
        if let Some(file) = target {
            file.save(&draft)?;
        }
        *guard = draft;
        Ok(value)
    }

    /// Applies `f` and publishes the result before persisting it. A failed
    /// write is still returned, but memory keeps the change.
    fn publish<T>(
        &self,
        f: impl FnOnce(&mut CatalogueState) -> Result<T, CatalogueError>,
    ) -> Result<T, CatalogueError> {
        let target = self.backing.writable()?;
        let mut guard = self.lock();
        let mut draft = guard.clone();
        let value = f(&mut draft)?;
        *guard = draft;
        if let Some(file) = target {
            file.save(&guard)?;
        }
        Ok(value)
    }

    // -- clients ---------------------------------------------------------

    /// Registers a client.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::Validation`] for invalid input or
    /// [`CatalogueError::Storage`] when persisting fails.
    pub fn add_client(&self, input: NewClient, now: DateTime<Utc>) -> Result<Client, CatalogueError> {
        self.mutate(|state| {
            let id = state.allocate_client_id();
            let client = input.into_client(id, now)?;
            state.clients.insert(id, client.clone());
            Ok(client)
        })
    }

    /// Applies a partial update to a client.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::ClientNotFound`], a validation error, or a
    /// storage error.
    pub fn update_client(
        &self,
        id: ClientId,
        update: ClientUpdate,
        now: DateTime<Utc>,
    ) -> Result<Client, CatalogueError> {
        self.mutate(|state| {
            let updated = update.apply(state.client(id)?, now)?;
            state.clients.insert(id, updated.clone());
            Ok(updated)
        })
    }

    /// Removes a client. Its jobs are kept and fail with a referential
    /// error until repointed or deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::ClientNotFound`] or a storage error.
    pub fn delete_client(&self, id: ClientId) -> Result<Client, CatalogueError> {
        self.mutate(|state| {
            state
                .clients
                .remove(&id)
                .ok_or(CatalogueError::ClientNotFound { id })
        })
    }

    /// Fetches one client.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::ClientNotFound`] when absent.
    pub fn client(&self, id: ClientId) -> Result<Client, CatalogueError> {
        self.read(|state| state.client(id).cloned())
    }

    /// Lists all clients ordered by id.
    #[must_use]
    pub fn clients(&self) -> Vec<Client> {
        self.read(|state| state.clients.values().cloned().collect())
    }

    // -- jobs ------------------------------------------------------------

    /// Creates a job bound to an existing client.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::ClientNotFound`] when the client does not
    /// exist, a validation error, or a storage error.
    pub fn add_job(&self, input: NewJob, now: DateTime<Utc>) -> Result<Job, CatalogueError> {
        self.mutate(|state| {
            state.client(input.client_id)?;
            let id = state.allocate_job_id();
            let job = input.into_job(id, now)?;
            state.jobs.insert(id, job.clone());
            Ok(job)
        })
    }

    /// Applies a partial update to a job. A new client reference must
    /// resolve.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::JobNotFound`],
    /// [`CatalogueError::ClientNotFound`], a validation error, or a storage
    /// error.
    pub fn update_job(
        &self,
        id: JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, CatalogueError> {
        self.mutate(|state| {
            if let Some(client_id) = update.client_id {
                state.client(client_id)?;
            }
            let updated = update.apply(state.job(id)?, now)?;
            state.jobs.insert(id, updated.clone());
            Ok(updated)
        })
    }

    /// Removes a job. Its runs stay in the history.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::JobNotFound`], [`CatalogueError::AlreadyRunning`]
    /// while a run is active, or a storage error.
    pub fn delete_job(&self, id: JobId) -> Result<Job, CatalogueError> {
        self.mutate(|state| {
            if let Some(run) = state.active_run(id) {
                return Err(CatalogueError::AlreadyRunning { job: id, run: run.id });
            }
            state.jobs.remove(&id).ok_or(CatalogueError::JobNotFound { id })
        })
    }

    /// Fetches one job.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::JobNotFound`] when absent.
    pub fn job(&self, id: JobId) -> Result<Job, CatalogueError> {
        self.read(|state| state.job(id).cloned())
    }

    /// Lists all jobs ordered by id.
    #[must_use]
    pub fn jobs(&self) -> Vec<Job> {
        self.read(|state| state.jobs.values().cloned().collect())
    }

    /// Lists enabled jobs that carry a schedule.
    #[must_use]
    pub fn scheduled_jobs(&self) -> Vec<Job> {
        self.read(|state| {
            state
                .jobs
                .values()
                .filter(|job| job.active_schedule().is_some())
                .cloned()
                .collect()
        })
    }

    /// Resolves a job and its owning client.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::JobNotFound`] or
    /// [`CatalogueError::Referential`].
    pub fn resolve_job(&self, id: JobId) -> Result<(Job, Client), CatalogueError> {
        self.read(|state| {
            let job = state.job(id)?;
            let client = state.owning_client(job)?;
            Ok((job.clone(), client.clone()))
        })
    }

    // -- runs ------------------------------------------------------------

    /// Creates a pending run for `job` and stamps its last-run time, unless
    /// the job is unresolvable or already has an active run.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::JobNotFound`],
    /// [`CatalogueError::Referential`], [`CatalogueError::AlreadyRunning`],
    /// or a storage error.
    pub fn begin_run(&self, job: JobId, now: DateTime<Utc>) -> Result<Run, CatalogueError> {
        self.mutate(|state| {
            state.owning_client(state.job(job)?)?;
            if let Some(active) = state.active_run(job) {
                return Err(CatalogueError::AlreadyRunning {
                    job,
                    run: active.id,
                });
            }

            let id = state.allocate_run_id();
            let run = Run::pending(id, job, now);
            state.runs.insert(id, run.clone());
            if let Some(record) = state.jobs.get_mut(&job) {
                record.last_run = Some(now);
            }
            Ok(run)
        })
    }

    /// Moves a pending run to running.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::RunNotFound`],
    /// [`CatalogueError::InvalidTransition`], or a storage error.
    pub fn mark_running(&self, id: RunId) -> Result<Run, CatalogueError> {
        self.mutate(|state| {
            let run = transition(state, id, RunStatus::Running)?;
            Ok(run.clone())
        })
    }

    /// Applies a terminal outcome to a run in one update.
    ///
    /// The outcome is kept in memory even when writing it to disk fails, so
    /// the job can run again; the next successful write persists it.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::RunNotFound`],
    /// [`CatalogueError::InvalidTransition`], or a storage error.
    pub fn complete_run(
        &self,
        id: RunId,
        completion: RunCompletion,
    ) -> Result<Run, CatalogueError> {
        self.publish(|state| {
            let run = transition(state, id, completion.status)?;
            run.end_time = Some(completion.end_time);
            run.size_bytes = completion.size_bytes;
            run.file_count = completion.file_count;
            run.error = completion.error;
            run.warning = completion.warning;
            run.snapshot_path = completion.snapshot_path;
            Ok(run.clone())
        })
    }

    /// Fetches one run.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::RunNotFound`] when absent.
    pub fn run(&self, id: RunId) -> Result<Run, CatalogueError> {
        self.read(|state| state.run(id).cloned())
    }

    /// Returns the active run of `job`, if any.
    #[must_use]
    pub fn active_run(&self, job: JobId) -> Option<Run> {
        self.read(|state| state.active_run(job).cloned())
    }

    /// Lists up to `limit` runs of `job`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogueError::JobNotFound`] when the job does not exist.
    pub fn history(&self, job: JobId, limit: usize) -> Result<Vec<Run>, CatalogueError> {
        self.read(|state| {
            state.job(job)?;
            Ok(state.runs_for(job).take(limit).cloned().collect())
        })
    }

    /// Lists up to `limit` completed runs across all jobs, newest first.
    #[must_use]
    pub fn backups(&self, limit: usize) -> Vec<BackupRecord> {
        self.read(|state| {
            state
                .runs
                .values()
                .rev()
                .filter(|run| run.status == RunStatus::Completed)
                .take(limit)
                .map(|run| {
                    let job = state.jobs.get(&run.job_id);
                    BackupRecord {
                        run: run.clone(),
                        job_name: job.map(|record| record.name.clone()),
                        client_name: job
                            .and_then(|record| state.clients.get(&record.client_id))
                            .map(|client| client.name.clone()),
                    }
                })
                .collect()
        })
    }

    /// Snapshot directory of the newest completed run of `job`.
    #[must_use]
    pub fn latest_snapshot(&self, job: JobId) -> Option<Utf8PathBuf> {
        self.read(|state| {
            state
                .runs_for(job)
                .filter(|run| run.status == RunStatus::Completed)
                .find_map(|run| run.snapshot_path.clone())
        })
    }

    /// Computes aggregate counts.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.read(|state| {
            let mut stats = Statistics {
                clients: state.clients.len(),
                jobs: state.jobs.len(),
                enabled_jobs: state.jobs.values().filter(|job| job.enabled).count(),
                runs: state.runs.len(),
                ..Statistics::default()
            };
            for run in state.runs.values() {
                match run.status {
                    RunStatus::Completed => {
                        stats.successful_runs += 1;
                        stats.total_stored_bytes =
                            stats.total_stored_bytes.saturating_add(run.size_bytes);
                    }
                    RunStatus::Failed => stats.failed_runs += 1,
                    RunStatus::Pending | RunStatus::Running => {}
                }
            }
            stats
        })
    }
}

fn transition(
    state: &mut CatalogueState,
    id: RunId,
    next: RunStatus,
) -> Result<&mut Run, CatalogueError> {
    let run = state
        .runs
        .get_mut(&id)
        .ok_or(CatalogueError::RunNotFound { id })?;
    if !run.status.can_transition_to(next) {
        return Err(CatalogueError::InvalidTransition {
            run: id,
            from: run.status,
            to: next,
        });
    }
    run.status = next;
    Ok(run)
}
