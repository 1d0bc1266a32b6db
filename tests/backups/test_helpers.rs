//! Shared fixtures for backup BDD scenarios.

use std::sync::Arc;

use backhaul::test_support::{Gate, GatedRunner, ScriptedRunner, reference_time};
use backhaul::{
    AuthMethod, Backhaul, BackhaulConfig, Catalogue, ErrorKind, JobId, ManualClock, NewClient,
    NewJob, Run,
};
use camino::Utf8PathBuf;
use rstest::fixture;
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Result of the step under test.
#[derive(Clone, Debug)]
pub enum BackupOutcome {
    /// The run reached a terminal state.
    Finished(Run),
    /// The engine refused to start the run.
    Rejected(ErrorKind),
    /// A second trigger was attempted while the first run was in flight.
    Contended {
        second: Option<ErrorKind>,
        first: Option<Run>,
    },
}

#[derive(Clone, Debug)]
pub struct BackupContext {
    pub _data: Arc<TempDir>,
    pub runtime: Arc<Runtime>,
    pub runner: ScriptedRunner,
    pub gate: Gate,
    pub service: Backhaul,
    pub job: Option<JobId>,
    pub outcome: Option<BackupOutcome>,
}

#[fixture]
pub fn backup_context() -> BackupContext {
    let data = TempDir::new().unwrap_or_else(|err| panic!("tempdir should be created: {err}"));
    let config = BackhaulConfig::with_data_dir(
        Utf8PathBuf::from_path_buf(data.path().to_path_buf())
            .unwrap_or_else(|path| panic!("tempdir should be UTF-8: {}", path.display())),
    );
    let catalogue = Catalogue::open(&config.catalogue_path(), reference_time())
        .unwrap_or_else(|err| panic!("catalogue should open: {err}"));
    let runtime = Runtime::new().unwrap_or_else(|err| panic!("runtime should start: {err}"));
    let runner = ScriptedRunner::new();
    let gate = Gate::new();
    let service = Backhaul::assemble(
        config,
        Arc::new(catalogue),
        Arc::new(GatedRunner::new(runner.clone(), "--stats", gate.clone())),
        Arc::new(ManualClock::new(reference_time())),
    );
    BackupContext {
        _data: Arc::new(data),
        runtime: Arc::new(runtime),
        runner,
        gate,
        service,
        job: None,
        outcome: None,
    }
}

/// Registers a key-authenticated client and a job for `source`.
pub fn seed_job(service: &Backhaul, client_name: &str, source: &str) -> JobId {
    let client = service
        .add_client(NewClient {
            name: client_name.to_owned(),
            host: String::from("files.example.test"),
            port: None,
            username: String::from("backup"),
            auth: AuthMethod::Key {
                key_path: Utf8PathBuf::from("/srv/backhaul/keys/id_ed25519"),
            },
            elevated: false,
        })
        .unwrap_or_else(|err| panic!("client should register: {err}"));
    service
        .add_job(NewJob {
            name: format!("{client_name}-files"),
            client_id: client.id,
            source_path: Utf8PathBuf::from(source),
            schedule: None,
            enabled: true,
        })
        .unwrap_or_else(|err| panic!("job should register: {err}"))
        .id
}
