//! Shared fixtures for restore BDD scenarios.

use std::sync::Arc;

use backhaul::test_support::{ScriptedRunner, reference_time};
use backhaul::{
    AuthMethod, Backhaul, BackhaulConfig, Catalogue, ErrorKind, ManualClock, NewClient, NewJob,
    RestoreReport, RunId,
};
use camino::Utf8PathBuf;
use rstest::fixture;
use tempfile::TempDir;
use tokio::runtime::Runtime;

#[derive(Clone, Debug)]
pub enum RestoreOutcome {
    Reported(RestoreReport),
    Rejected(ErrorKind),
}

#[derive(Clone, Debug)]
pub struct RestoreContext {
    pub _data: Arc<TempDir>,
    pub runtime: Arc<Runtime>,
    pub runner: ScriptedRunner,
    pub service: Backhaul,
    pub run: Option<RunId>,
    pub commands_before_restore: usize,
    pub outcome: Option<RestoreOutcome>,
}

#[fixture]
pub fn restore_context() -> RestoreContext {
    let data = TempDir::new().unwrap_or_else(|err| panic!("tempdir should be created: {err}"));
    let config = BackhaulConfig::with_data_dir(
        Utf8PathBuf::from_path_buf(data.path().to_path_buf())
            .unwrap_or_else(|path| panic!("tempdir should be UTF-8: {}", path.display())),
    );
    let catalogue = Catalogue::open(&config.catalogue_path(), reference_time())
        .unwrap_or_else(|err| panic!("catalogue should open: {err}"));
    let runner = ScriptedRunner::new();
    let service = Backhaul::assemble(
        config,
        Arc::new(catalogue),
        Arc::new(runner.clone()),
        Arc::new(ManualClock::new(reference_time())),
    );
    RestoreContext {
        _data: Arc::new(data),
        runtime: Arc::new(
            Runtime::new().unwrap_or_else(|err| panic!("runtime should start: {err}")),
        ),
        runner,
        service,
        run: None,
        commands_before_restore: 0,
        outcome: None,
    }
}

/// Registers a client and job for `source`, runs it once, and returns the
/// run identifier.
pub fn back_up(context: &RestoreContext, source: &str) -> RunId {
    let client = context
        .service
        .add_client(NewClient {
            name: String::from("web"),
            host: String::from("files.example.test"),
            port: None,
            username: String::from("backup"),
            auth: AuthMethod::Key {
                key_path: Utf8PathBuf::from("/srv/backhaul/keys/id_ed25519"),
            },
            elevated: false,
        })
        .unwrap_or_else(|err| panic!("client should register: {err}"));
    let job = context
        .service
        .add_job(NewJob {
            name: String::from("site"),
            client_id: client.id,
            source_path: Utf8PathBuf::from(source),
            schedule: None,
            enabled: true,
        })
        .unwrap_or_else(|err| panic!("job should register: {err}"))
        .id;
    let service = context.service.clone();
    context
        .runtime
        .block_on(async move { service.run_now(job).await })
        .unwrap_or_else(|err| panic!("backup should run: {err}"))
        .id
}
