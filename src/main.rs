//! Binary entry point for the Backhaul CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backhaul::{
    Backhaul, BackhaulConfig, ClientId, ErrorKind, JobId, RestoreOptions, RunId, RunStatus,
    ServiceError,
};

mod cli;

use cli::{Cli, Command};

/// Environment variable holding the tracing filter directives.
const LOG_ENV: &str = "BACKHAUL_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl CliError {
    const fn kind(&self) -> ErrorKind {
        match self {
            Self::Service(err) => err.kind(),
            Self::Encode(_) | Self::Output(_) => ErrorKind::Internal,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

fn load_config(data_dir: Option<String>) -> Result<BackhaulConfig, CliError> {
    let mut config = BackhaulConfig::load_without_cli_args().map_err(ServiceError::from)?;
    if let Some(dir) = data_dir {
        config.data_dir = Utf8PathBuf::from(dir);
    }
    Ok(config)
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = load_config(cli.data_dir)?;
    let service = if writes_catalogue(&cli.command) {
        Backhaul::open(config)?
    } else {
        Backhaul::open_read_only(config)?
    };
    let mut stdout = io::stdout();
    match cli.command {
        Command::Serve => Ok(serve(&service).await),
        Command::Run { job } => {
            let run = service.run_now(JobId::new(job)).await?;
            emit(&mut stdout, &run)?;
            Ok(i32::from(run.status == RunStatus::Failed))
        }
        Command::History { job, limit } => {
            emit(&mut stdout, &service.list_history(JobId::new(job), limit)?)?;
            Ok(0)
        }
        Command::Backups { limit } => {
            emit(&mut stdout, &service.list_backups(limit))?;
            Ok(0)
        }
        Command::Files { run } => {
            emit(&mut stdout, &service.backup_files(RunId::new(run))?)?;
            Ok(0)
        }
        Command::Restore {
            run,
            destination,
            dry_run,
        } => {
            let report = service.restore(
                RunId::new(run),
                destination.as_deref(),
                RestoreOptions { dry_run },
            )?;
            emit(&mut stdout, &report)?;
            Ok(i32::from(!report.success))
        }
        Command::Browse { client, path } => {
            emit(
                &mut stdout,
                &service.browse(ClientId::new(client), path.as_deref())?,
            )?;
            Ok(0)
        }
        Command::TestConnection { client } => {
            emit(&mut stdout, &service.test_connection(ClientId::new(client))?)?;
            Ok(0)
        }
        Command::Stats => {
            emit(&mut stdout, &service.statistics())?;
            Ok(0)
        }
    }
}

/// Commands that record runs need the catalogue's writer lock; the rest
/// open it read-only so they can run beside `serve`.
const fn writes_catalogue(command: &Command) -> bool {
    matches!(command, Command::Serve | Command::Run { .. })
}

async fn serve(service: &Backhaul) -> i32 {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping scheduler");
                shutdown_tx.send(true).ok();
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for interrupts");
                // Holding the sender keeps the scheduler alive.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    let mut scheduler = service.scheduler();
    scheduler.run(shutdown_rx).await;
    0
}

fn emit(mut target: impl Write, value: &impl Serialize) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut target, value)?;
    writeln!(target)?;
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{}: {err}", err.kind()).ok();
}
