//! Mirrored copies between a client and local snapshot storage using the
//! system `rsync` over the configured `ssh` transport.

use std::sync::Arc;

use camino::Utf8Path;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::command::{CommandLine, CommandOutput, CommandRunner, RunnerError};
use crate::model::Client;
use crate::session::{SessionError, SshTransport, classify_transport_failure};

mod stats;

pub use stats::TransferStats;

/// Paths never worth keeping in a backup.
pub const TRANSIENT_EXCLUDES: &[&str] = &[
    "*.tmp",
    "*.swp",
    "*~",
    ".cache/",
    "lost+found/",
    ".Trash-*/",
];

/// `rsync` exit status meaning some source files vanished mid-transfer.
pub const RSYNC_VANISHED: i32 = 24;

/// Prefix rsync puts on the line explaining a non-zero exit.
const RSYNC_ERROR_MARKER: &str = "rsync error:";

/// Errors raised by a transfer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// Raised when the underlying `ssh` connection fails.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Raised when `rsync` exits with a failure status.
    #[error("rsync exited with status {status}: {detail}")]
    Failed {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Human readable exit status.
        status: String,
        /// Redacted diagnostic output.
        detail: String,
    },
    /// Raised when the local `rsync` or `sshpass` process cannot start.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Successful transfer summary.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TransferReport {
    /// Totals parsed from `--stats`.
    pub stats: TransferStats,
    /// Set when rsync finished with a tolerated partial-transfer status.
    pub warning: Option<String>,
}

/// Direction-specific inputs for a pull from a client.
#[derive(Clone, Copy, Debug)]
pub struct Pull<'a> {
    /// Absolute directory on the client.
    pub source: &'a Utf8Path,
    /// Local snapshot directory to fill.
    pub destination: &'a Utf8Path,
    /// Previous snapshot used as a hard-link reference.
    pub link_dest: Option<&'a Utf8Path>,
}

/// Direction-specific inputs for a push back to a client.
#[derive(Clone, Copy, Debug)]
pub struct Push<'a> {
    /// Local snapshot directory to copy from.
    pub snapshot: &'a Utf8Path,
    /// Absolute directory on the client to copy into.
    pub destination: &'a Utf8Path,
    /// Preview the changes without writing.
    pub dry_run: bool,
}

/// Builds and runs `rsync` invocations.
#[derive(Clone)]
pub struct Mirror {
    rsync_bin: String,
    transport: SshTransport,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("rsync_bin", &self.rsync_bin)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Mirror {
    /// Creates a mirror.
    #[must_use]
    pub const fn new(
        rsync_bin: String,
        transport: SshTransport,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            rsync_bin,
            transport,
            runner,
        }
    }

    /// Builds the command that mirrors `pull.source` on `client` into
    /// `pull.destination`, propagating deletions.
    #[must_use]
    pub fn pull_command(&self, client: &Client, pull: Pull<'_>) -> CommandLine {
        let mut command = self
            .base_command(client)
            .arg("--delete")
            .args(
                TRANSIENT_EXCLUDES
                    .iter()
                    .map(|pattern| format!("--exclude={pattern}")),
            );
        if let Some(reference) = pull.link_dest {
            command = command.arg(format!("--link-dest={reference}"));
        }
        command
            .arg(format!("{}:{}", client.login(), with_trailing_slash(pull.source)))
            .arg(with_trailing_slash(pull.destination))
    }

    /// Builds the command that copies `push.snapshot` back onto `client`.
    /// Files on the client that are absent from the snapshot are kept.
    #[must_use]
    pub fn push_command(&self, client: &Client, push: Push<'_>) -> CommandLine {
        let mut command = self.base_command(client);
        if push.dry_run {
            command = command.arg("--dry-run");
        }
        command
            .arg(with_trailing_slash(push.snapshot))
            .arg(format!("{}:{}", client.login(), push.destination))
    }

    /// Runs a pull.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Session`] for transport failures,
    /// [`TransferError::Failed`] for any other non-zero rsync status except
    /// [`RSYNC_VANISHED`], or [`TransferError::Runner`].
    pub fn pull(&self, client: &Client, pull: Pull<'_>) -> Result<TransferReport, TransferError> {
        self.execute(client, &self.pull_command(client, pull))
    }

    /// Runs a push.
    ///
    /// # Errors
    ///
    /// As for [`Mirror::pull`].
    pub fn push(&self, client: &Client, push: Push<'_>) -> Result<TransferReport, TransferError> {
        self.execute(client, &self.push_command(client, push))
    }

    fn base_command(&self, client: &Client) -> CommandLine {
        let mut command = self
            .transport
            .launcher(client, &self.rsync_bin)
            .args(["-a", "--stats", "--protect-args"])
            .arg("-e")
            .arg(self.transport.rsync_shell(client));
        if client.elevated {
            command = command.arg("--rsync-path=sudo rsync");
        }
        command
    }

    fn execute(
        &self,
        client: &Client,
        command: &CommandLine,
    ) -> Result<TransferReport, TransferError> {
        debug!(client_id = %client.id, command = %command.display_string(), "running rsync");
        let output = self.runner.run(command)?;
        interpret(client, &output)
    }
}

fn interpret(client: &Client, output: &CommandOutput) -> Result<TransferReport, TransferError> {
    let stats = TransferStats::parse(&output.stdout);
    match output.code {
        Some(0) => Ok(TransferReport {
            stats,
            warning: None,
        }),
        Some(RSYNC_VANISHED) => Ok(TransferReport {
            stats,
            warning: Some(format!(
                "some source files vanished during transfer: {}",
                client.redact(&output.diagnostic())
            )),
        }),
        code => {
            // rsync reports its own failures; sshpass exits silently.
            let via_sshpass = client.auth.password().is_some()
                && !output.stderr.contains(RSYNC_ERROR_MARKER);
            if let Some(err) = classify_transport_failure(client, output, via_sshpass) {
                return Err(err.into());
            }
            Err(TransferError::Failed {
                code,
                status: code.map_or_else(|| String::from("unknown"), |value| value.to_string()),
                detail: client.redact(&output.diagnostic()),
            })
        }
    }
}

fn with_trailing_slash(path: &Utf8Path) -> String {
    let text = path.as_str();
    if text.ends_with('/') {
        text.to_owned()
    } else {
        format!("{text}/")
    }
}

#[cfg(test)]
mod tests;
