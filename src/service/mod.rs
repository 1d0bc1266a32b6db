//! The service facade consumed by the CLI and by any outer API layer.

use std::sync::Arc;

use thiserror::Error;

use crate::browse::{BrowseError, Browser, Listing};
use crate::catalogue::{BackupRecord, Catalogue, CatalogueError, Statistics};
use crate::clock::{Clock, SystemClock};
use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::{BackhaulConfig, ConfigError};
use crate::engine::{Engine, EngineError};
use crate::error::ErrorKind;
use crate::model::{
    Client, ClientId, ClientUpdate, Job, JobId, JobUpdate, NewClient, NewJob, Run, RunId,
};
use crate::restore::{RestoreError, RestoreOptions, RestoreReport, Restorer};
use crate::scheduler::Scheduler;
use crate::session::{ConnectionReport, Connector, SessionError};
use crate::storage::{SnapshotEntry, SnapshotStore, StorageError};
use crate::transfer::Mirror;

/// Completed runs returned by [`Backhaul::list_backups`] when no limit is
/// given.
pub const DEFAULT_BACKUP_LIMIT: usize = 100;

/// Scheduler wired to the catalogue and the execution engine.
pub type BackhaulScheduler = Scheduler<Arc<Catalogue>, Engine, Arc<dyn Clock>>;

/// Errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A catalogue operation failed.
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    /// Dispatching or running a backup failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Connecting to a client failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Browsing a client failed.
    #[error(transparent)]
    Browse(#[from] BrowseError),
    /// Restoring a snapshot failed.
    #[error(transparent)]
    Restore(#[from] RestoreError),
    /// Reading a stored snapshot failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The run never produced a snapshot.
    #[error("run {run} has no stored snapshot")]
    NoSnapshot {
        /// Requested run.
        run: RunId,
    },
}

impl ServiceError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Validation,
            Self::Catalogue(err) => err.kind(),
            Self::Engine(err) => err.kind(),
            Self::Session(err) => err.kind(),
            Self::Browse(err) => err.kind(),
            Self::Restore(err) => err.kind(),
            Self::Storage(err) => err.kind(),
            Self::NoSnapshot { .. } => ErrorKind::NotFound,
        }
    }
}

/// Backup orchestration service.
#[derive(Clone)]
pub struct Backhaul {
    catalogue: Arc<Catalogue>,
    engine: Engine,
    connector: Connector,
    browser: Browser,
    restorer: Restorer,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    config: BackhaulConfig,
}

impl std::fmt::Debug for Backhaul {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backhaul")
            .field("data_dir", &self.config.data_dir)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Backhaul {
    /// Opens the service described by `config`, spawning real processes and
    /// reading the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] for invalid settings or
    /// [`ServiceError::Catalogue`] when the catalogue cannot be opened.
    pub fn open(config: BackhaulConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let catalogue = Catalogue::open(&config.catalogue_path(), clock.now())?;
        Ok(Self::assemble(
            config,
            Arc::new(catalogue),
            Arc::new(ProcessCommandRunner),
            clock,
        ))
    }

    /// Opens the service without taking the catalogue's writer lock, for
    /// commands that only inspect state or talk to clients.
    ///
    /// Interrupted runs are left as recorded and every catalogue mutation,
    /// including triggering a run, fails with a storage error.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] for invalid settings or
    /// [`ServiceError::Catalogue`] when the catalogue cannot be read.
    pub fn open_read_only(config: BackhaulConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let catalogue = Catalogue::open_read_only(&config.catalogue_path())?;
        Ok(Self::assemble(
            config,
            Arc::new(catalogue),
            Arc::new(ProcessCommandRunner),
            Arc::new(SystemClock),
        ))
    }

    /// Wires the service from explicit collaborators.
    #[must_use]
    pub fn assemble(
        config: BackhaulConfig,
        catalogue: Arc<Catalogue>,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let transport = config.transport();
        let connector = Connector::new(transport.clone(), Arc::clone(&runner));
        let mirror = Mirror::new(config.rsync_bin.clone(), transport, runner);
        let store = SnapshotStore::new(&config.data_dir);
        let engine = Engine::new(
            Arc::clone(&catalogue),
            connector.clone(),
            mirror.clone(),
            store.clone(),
            Arc::clone(&clock),
            config.worker_pool_size,
        );
        Self {
            browser: Browser::new(connector.clone()),
            restorer: Restorer::new(Arc::clone(&catalogue), connector.clone(), mirror),
            catalogue,
            engine,
            connector,
            store,
            clock,
            config,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &BackhaulConfig {
        &self.config
    }

    /// Execution engine shared by scheduled and manual runs.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    // -- clients ---------------------------------------------------------

    /// Registers a client.
    ///
    /// # Errors
    ///
    /// Returns validation or storage errors.
    pub fn add_client(&self, input: NewClient) -> Result<Client, ServiceError> {
        Ok(self.catalogue.add_client(input, self.clock.now())?)
    }

    /// Updates the named fields of a client.
    ///
    /// # Errors
    ///
    /// Returns not-found, validation, or storage errors.
    pub fn update_client(&self, id: ClientId, update: ClientUpdate) -> Result<Client, ServiceError> {
        Ok(self.catalogue.update_client(id, update, self.clock.now())?)
    }

    /// Removes a client, leaving its jobs to fail referentially.
    ///
    /// # Errors
    ///
    /// Returns not-found or storage errors.
    pub fn delete_client(&self, id: ClientId) -> Result<Client, ServiceError> {
        Ok(self.catalogue.delete_client(id)?)
    }

    /// Fetches one client.
    ///
    /// # Errors
    ///
    /// Returns a not-found error.
    pub fn client(&self, id: ClientId) -> Result<Client, ServiceError> {
        Ok(self.catalogue.client(id)?)
    }

    /// Lists clients.
    #[must_use]
    pub fn clients(&self) -> Vec<Client> {
        self.catalogue.clients()
    }

    // -- jobs ------------------------------------------------------------

    /// Creates a job.
    ///
    /// # Errors
    ///
    /// Returns not-found (missing client), validation, or storage errors.
    pub fn add_job(&self, input: NewJob) -> Result<Job, ServiceError> {
        Ok(self.catalogue.add_job(input, self.clock.now())?)
    }

    /// Updates the named fields of a job.
    ///
    /// # Errors
    ///
    /// Returns not-found, validation, or storage errors.
    pub fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job, ServiceError> {
        Ok(self.catalogue.update_job(id, update, self.clock.now())?)
    }

    /// Removes a job. Refused while it has an active run.
    ///
    /// # Errors
    ///
    /// Returns not-found, already-running, or storage errors.
    pub fn delete_job(&self, id: JobId) -> Result<Job, ServiceError> {
        Ok(self.catalogue.delete_job(id)?)
    }

    /// Fetches one job.
    ///
    /// # Errors
    ///
    /// Returns a not-found error.
    pub fn job(&self, id: JobId) -> Result<Job, ServiceError> {
        Ok(self.catalogue.job(id)?)
    }

    /// Lists jobs.
    #[must_use]
    pub fn jobs(&self) -> Vec<Job> {
        self.catalogue.jobs()
    }

    // -- runs ------------------------------------------------------------

    /// Starts a run and returns it while still pending. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns not-found, referential, or already-running errors.
    pub fn trigger_run(&self, job: JobId) -> Result<Run, ServiceError> {
        Ok(self.engine.trigger(job)?.run)
    }

    /// Runs a job and waits for its terminal state.
    ///
    /// # Errors
    ///
    /// As for [`Backhaul::trigger_run`].
    pub async fn run_now(&self, job: JobId) -> Result<Run, ServiceError> {
        Ok(self.engine.run_now(job).await?)
    }

    /// Lists runs of `job`, newest first, up to `limit` or the configured
    /// history limit.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown jobs.
    pub fn list_history(&self, job: JobId, limit: Option<usize>) -> Result<Vec<Run>, ServiceError> {
        let cap = limit.unwrap_or(self.config.history_limit);
        Ok(self.catalogue.history(job, cap)?)
    }

    /// Lists completed runs across all jobs, newest first.
    #[must_use]
    pub fn list_backups(&self, limit: Option<usize>) -> Vec<BackupRecord> {
        self.catalogue
            .backups(limit.unwrap_or(DEFAULT_BACKUP_LIMIT))
    }

    /// Lists the files stored in the snapshot of `run`.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for unknown runs or runs without a
    /// snapshot, or storage errors while walking it.
    pub fn backup_files(&self, run: RunId) -> Result<Vec<SnapshotEntry>, ServiceError> {
        let record = self.catalogue.run(run)?;
        let snapshot = record
            .snapshot_path
            .ok_or(ServiceError::NoSnapshot { run })?;
        Ok(self.store.list(&snapshot)?)
    }

    /// Copies the snapshot of `run` back to its client.
    ///
    /// # Errors
    ///
    /// See [`Restorer::restore`].
    pub fn restore(
        &self,
        run: RunId,
        destination: Option<&str>,
        options: RestoreOptions,
    ) -> Result<RestoreReport, ServiceError> {
        Ok(self.restorer.restore(run, destination, options)?)
    }

    // -- remote ----------------------------------------------------------

    /// Lists a directory on a client.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown clients, or browse errors.
    pub fn browse(&self, client: ClientId, path: Option<&str>) -> Result<Listing, ServiceError> {
        let record = self.catalogue.client(client)?;
        Ok(self.browser.list(&record, path)?)
    }

    /// Connects to a client and reports its system and elevation status.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown clients, or session errors.
    pub fn test_connection(&self, client: ClientId) -> Result<ConnectionReport, ServiceError> {
        let record = self.catalogue.client(client)?;
        Ok(self.connector.test_connection(&record)?)
    }

    /// Aggregate counts.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.catalogue.statistics()
    }

    /// Builds a scheduler dispatching into this service's engine.
    #[must_use]
    pub fn scheduler(&self) -> BackhaulScheduler {
        Scheduler::new(
            Arc::clone(&self.catalogue),
            self.engine.clone(),
            Arc::clone(&self.clock),
            self.config.tick_interval(),
        )
    }
}
