//! Execution of backup runs.
//!
//! [`Engine::trigger`] performs every admission check synchronously, records
//! a pending run, and returns at once. The transfer itself waits for a slot
//! in the bounded worker pool and then runs on Tokio's blocking threads,
//! because every step shells out to `ssh` or `rsync`.

use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalogue::{Catalogue, CatalogueError};
use crate::clock::Clock;
use crate::model::{JobId, Run, RunCompletion, RunId, RunStatus};
use crate::scheduler::{DispatchOutcome, Dispatcher, run_blocking};
use crate::session::{Connector, SessionError, verify_elevation};
use crate::storage::{SnapshotStore, StorageError};
use crate::transfer::{Mirror, Pull, TransferError};

mod locks;

pub use locks::{JobLease, JobLocks};

/// Worker pool size used when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Errors raised while dispatching or executing a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Raised when a catalogue lookup or update fails, including missing
    /// jobs and jobs whose client no longer exists.
    #[error(transparent)]
    Catalogue(CatalogueError),
    /// Raised when the job already has an active run.
    #[error("job {job} is already running")]
    AlreadyRunning {
        /// Job that was triggered.
        job: JobId,
        /// Active run, when it is already recorded.
        run: Option<RunId>,
    },
    /// Raised when connecting to or verifying the client fails.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Raised when the rsync pull fails.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// Raised when local snapshot storage cannot be prepared or measured.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Raised when a run is triggered outside a Tokio runtime.
    #[error("runs can only be dispatched from within a Tokio runtime")]
    NoRuntime,
    /// Raised when the worker task ends without recording an outcome.
    #[error("worker for run {run} stopped unexpectedly: {message}")]
    Worker {
        /// Run whose worker stopped.
        run: RunId,
        /// Join error text.
        message: String,
    },
}

impl From<CatalogueError> for EngineError {
    fn from(err: CatalogueError) -> Self {
        match err {
            CatalogueError::AlreadyRunning { job, run } => Self::AlreadyRunning {
                job,
                run: Some(run),
            },
            other => Self::Catalogue(other),
        }
    }
}

/// A dispatched run and the task driving it.
#[derive(Debug)]
pub struct Dispatch {
    /// The run as recorded at dispatch, still pending.
    pub run: Run,
    /// Resolves to the run in its terminal state.
    pub handle: JoinHandle<Run>,
}

/// Everything a run needs, shared between the caller and worker tasks.
struct Shared {
    catalogue: Arc<Catalogue>,
    connector: Connector,
    mirror: Mirror,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    locks: JobLocks,
    pool: Arc<Semaphore>,
}

/// Runs backups on a bounded worker pool with per-job exclusion.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.shared.store)
            .field("available_workers", &self.shared.pool.available_permits())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine. A `pool_size` of zero is treated as one.
    #[must_use]
    pub fn new(
        catalogue: Arc<Catalogue>,
        connector: Connector,
        mirror: Mirror,
        store: SnapshotStore,
        clock: Arc<dyn Clock>,
        pool_size: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                catalogue,
                connector,
                mirror,
                store,
                clock,
                locks: JobLocks::new(),
                pool: Arc::new(Semaphore::new(pool_size.max(1))),
            }),
        }
    }

    /// Catalogue the engine records runs in.
    #[must_use]
    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.shared.catalogue
    }

    /// Snapshot layout the engine writes into.
    #[must_use]
    pub fn store(&self) -> &SnapshotStore {
        &self.shared.store
    }

    /// Returns `true` while `job` holds the in-process run lock.
    #[must_use]
    pub fn is_running(&self, job: JobId) -> bool {
        self.shared.locks.is_held(job)
    }

    /// Starts a run of `job` and returns without waiting for it.
    ///
    /// The job and its client are resolved before anything else, so a
    /// dangling client reference fails here without spawning a process.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Catalogue`] for a missing job or client,
    /// [`EngineError::AlreadyRunning`] when the job has an active run, or
    /// [`EngineError::NoRuntime`] outside a Tokio runtime.
    pub fn trigger(&self, job: JobId) -> Result<Dispatch, EngineError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let shared = &self.shared;
        shared.catalogue.resolve_job(job)?;

        let lease = shared
            .locks
            .try_acquire(job)
            .ok_or_else(|| EngineError::AlreadyRunning {
                job,
                run: shared.catalogue.active_run(job).map(|run| run.id),
            })?;
        let run = shared.catalogue.begin_run(job, shared.clock.now())?;
        info!(job_id = %job, run_id = %run.id, "run dispatched");

        let handle = runtime.spawn(execute(Arc::clone(shared), run.id, lease));
        Ok(Dispatch { run, handle })
    }

    /// Starts a run of `job` and waits for its terminal state.
    ///
    /// # Errors
    ///
    /// As for [`Engine::trigger`], plus [`EngineError::Worker`] when the
    /// worker task panics.
    pub async fn run_now(&self, job: JobId) -> Result<Run, EngineError> {
        let dispatch = self.trigger(job)?;
        let run = dispatch.run.id;
        dispatch.handle.await.map_err(|err| EngineError::Worker {
            run,
            message: err.to_string(),
        })
    }
}

impl Dispatcher for Engine {
    type Error = EngineError;

    fn dispatch(&self, job: JobId) -> Result<DispatchOutcome, Self::Error> {
        match self.trigger(job) {
            Ok(dispatch) => Ok(DispatchOutcome::Started(dispatch.run.id)),
            Err(EngineError::AlreadyRunning { .. }) => Ok(DispatchOutcome::Busy),
            Err(err) => Err(err),
        }
    }
}

async fn execute(shared: Arc<Shared>, run: RunId, lease: JobLease) -> Run {
    let job = lease.job();
    let completion = admit_and_perform(&shared, run, job).await;
    let status = completion.status;
    let finished = run_blocking(|| shared.catalogue.complete_run(run, completion));
    drop(lease);
    match finished {
        Ok(record) => {
            log_outcome(&record);
            record
        }
        Err(err) => {
            error!(job_id = %job, run_id = %run, error = %err, "could not record run outcome");
            shared.catalogue.run(run).unwrap_or_else(|_| {
                let mut fallback = Run::pending(run, job, shared.clock.now());
                fallback.status = status;
                fallback
            })
        }
    }
}

/// Waits for a worker slot, marks the run running, and performs the
/// transfer on a blocking thread.
async fn admit_and_perform(shared: &Arc<Shared>, run: RunId, job: JobId) -> RunCompletion {
    let permit = match Arc::clone(&shared.pool).acquire_owned().await {
        Ok(permit) => permit,
        Err(err) => return RunCompletion::failed(shared.clock.now(), err.to_string()),
    };
    let running = match run_blocking(|| shared.catalogue.mark_running(run)) {
        Ok(running) => running,
        Err(err) => return RunCompletion::failed(shared.clock.now(), err.to_string()),
    };
    info!(job_id = %job, run_id = %run, "run admitted");

    let worker = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        let completion = perform(&worker, &running);
        drop(permit);
        completion
    })
    .await
    .unwrap_or_else(|err| {
        RunCompletion::failed(shared.clock.now(), format!("worker panicked: {err}"))
    })
}

fn log_outcome(run: &Run) {
    match (run.status, run.warning.as_deref()) {
        (RunStatus::Completed, None) => {
            info!(job_id = %run.job_id, run_id = %run.id, files = run.file_count, bytes = run.size_bytes, "run completed");
        }
        (RunStatus::Completed, Some(warning)) => {
            warn!(job_id = %run.job_id, run_id = %run.id, files = run.file_count, warning, "run completed with warnings");
        }
        _ => {
            warn!(job_id = %run.job_id, run_id = %run.id, error = run.error.as_deref().unwrap_or_default(), "run failed");
        }
    }
}

/// Runs the blocking part of a backup and converts any failure into a
/// failed completion.
fn perform(shared: &Shared, run: &Run) -> RunCompletion {
    let snapshot = shared
        .store
        .snapshot_dir(run.job_id, run.id, run.start_time);
    match transfer(shared, run, &snapshot) {
        Ok(completion) => completion,
        Err(err) => {
            let mut failed = RunCompletion::failed(shared.clock.now(), err.to_string());
            failed.snapshot_path = snapshot.is_dir().then_some(snapshot);
            failed
        }
    }
}

fn transfer(shared: &Shared, run: &Run, snapshot: &Utf8Path) -> Result<RunCompletion, EngineError> {
    let (job, client) = shared.catalogue.resolve_job(run.job_id)?;
    if client.elevated {
        let session = shared.connector.open(&client)?;
        let banner = verify_elevation(&session)?;
        debug!(run_id = %run.id, banner, "elevation verified");
        session.close();
    }

    shared.store.prepare(snapshot)?;
    let previous = shared
        .catalogue
        .latest_snapshot(job.id)
        .filter(|path| path.is_dir());
    let report = shared.mirror.pull(
        &client,
        Pull {
            source: &job.source_path,
            destination: snapshot,
            link_dest: previous.as_deref(),
        },
    )?;

    let (file_count, size_bytes) = match (report.stats.regular_files, report.stats.total_bytes) {
        (Some(files), Some(bytes)) => (files, bytes),
        _ => {
            debug!(run_id = %run.id, "rsync statistics incomplete; measuring snapshot");
            let measure = shared.store.measure(snapshot)?;
            (measure.regular_files, measure.total_bytes)
        }
    };

    Ok(RunCompletion {
        status: RunStatus::Completed,
        end_time: shared.clock.now(),
        size_bytes,
        file_count,
        error: None,
        warning: report.warning,
        snapshot_path: Some(snapshot.to_path_buf()),
    })
}
