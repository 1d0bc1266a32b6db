//! Command-line interface definitions for the `backhaul` binary.
//!
//! Kept free of crate types so the build script can include this file to
//! render the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `backhaul` binary.
#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    about = "Scheduled, incremental rsync backups of remote hosts",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Directory holding the catalogue and snapshots; overrides
    /// `BACKHAUL_DATA_DIR` and `backhaul.toml`.
    #[arg(long, global = true, value_name = "DIR")]
    pub(crate) data_dir: Option<String>,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `backhaul`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run the scheduler until interrupted.
    #[command(name = "serve")]
    Serve,
    /// Back up one job now and wait for the result.
    #[command(name = "run")]
    Run {
        /// Job identifier.
        job: u64,
    },
    /// Show recent runs of a job, newest first.
    #[command(name = "history")]
    History {
        /// Job identifier.
        job: u64,
        /// Maximum number of runs to show.
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Show completed backups across all jobs.
    #[command(name = "backups")]
    Backups {
        /// Maximum number of backups to show.
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// List the files stored by a run.
    #[command(name = "files")]
    Files {
        /// Run identifier.
        run: u64,
    },
    /// Copy a stored snapshot back to its client.
    #[command(name = "restore")]
    Restore {
        /// Run identifier.
        run: u64,
        /// Absolute destination on the client; defaults to the job's
        /// source path.
        #[arg(long, value_name = "PATH")]
        destination: Option<String>,
        /// Show what would change without writing.
        #[arg(long)]
        dry_run: bool,
    },
    /// List a directory on a client.
    #[command(name = "browse")]
    Browse {
        /// Client identifier.
        client: u64,
        /// Absolute path to list; defaults to `/`.
        path: Option<String>,
    },
    /// Check that a client is reachable and, if required, that passwordless
    /// sudo is configured.
    #[command(name = "test-connection")]
    TestConnection {
        /// Client identifier.
        client: u64,
    },
    /// Show aggregate counts.
    #[command(name = "stats")]
    Stats,
}
