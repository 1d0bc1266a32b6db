//! Core library for the Backhaul backup orchestrator.
//!
//! Backhaul keeps a catalogue of remote clients and backup jobs, pulls each
//! job's source path over `rsync` into a dated snapshot that hard-links
//! unchanged files against the previous one, and runs jobs on cron
//! schedules or on demand. Snapshots can be listed, browsed, and pushed back
//! to their client.

pub mod browse;
pub mod catalogue;
pub mod clock;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod restore;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod storage;
pub mod test_support;
pub mod transfer;

pub use browse::{BrowseError, Browser, Listing, RemoteEntry};
pub use catalogue::{BackupRecord, Catalogue, CatalogueError, Statistics};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{BackhaulConfig, ConfigError};
pub use engine::{Dispatch, Engine, EngineError};
pub use error::ErrorKind;
pub use model::{
    AuthMethod, Client, ClientId, ClientUpdate, Job, JobId, JobUpdate, NewClient, NewJob, Run,
    RunId, RunStatus,
};
pub use restore::{RestoreError, RestoreOptions, RestoreReport, Restorer};
pub use schedule::CronSchedule;
pub use scheduler::{DispatchOutcome, Dispatcher, JobSource, Scheduler, TickReport};
pub use service::{Backhaul, BackhaulScheduler, ServiceError};
pub use session::{ConnectionReport, Connector, SessionError, SshTransport};
pub use storage::{SnapshotEntry, SnapshotStore, StorageError};
pub use transfer::{Mirror, TransferError, TransferStats};
