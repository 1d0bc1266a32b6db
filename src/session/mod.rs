//! Authenticated remote command sessions over the system `ssh` client.
//!
//! A [`Connector`] opens a [`Session`] per operation by running a no-op probe
//! to prove the credentials work. Sessions are never pooled; each remote
//! command is its own `ssh` invocation sharing the same options.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::command::{CommandLine, CommandOutput, CommandRunner, RunnerError};
use crate::model::Client;

mod ssh;

pub use ssh::{HostKeyPolicy, SSHPASS_ENV, SshTransport, classify_transport_failure};

/// Remote command used to prove a session can be established.
pub const PROBE_COMMAND: &str = "true";
/// Remote command used to check for passwordless `sudo rsync`.
pub const ELEVATION_PROBE: &str = "sudo -n rsync --version";
/// Remote command used to describe the client system.
pub const SYSTEM_INFO_COMMAND: &str = "uname -a";

/// Errors raised while opening or using a session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when the client rejects the configured credentials.
    #[error("authentication failed for {login}: {detail}")]
    Auth {
        /// `user@host` that was attempted.
        login: String,
        /// Redacted diagnostic from `ssh`.
        detail: String,
    },
    /// Raised when the host cannot be reached or the connection drops.
    #[error("cannot reach {host}:{port}: {detail}")]
    Network {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Redacted diagnostic from `ssh`.
        detail: String,
    },
    /// Raised when host identity verification refuses the connection.
    #[error("host key for {host} was rejected: {detail}")]
    HostKeyRejected {
        /// Target host.
        host: String,
        /// Redacted diagnostic from `ssh`.
        detail: String,
    },
    /// Raised when the client is flagged for elevation but `sudo rsync`
    /// cannot run without a password.
    #[error("{remediation} (probe output: {detail})")]
    SudoMisconfigured {
        /// Remote user lacking the sudo rule.
        username: String,
        /// Instructions for fixing the sudoers configuration.
        remediation: String,
        /// Redacted probe diagnostic.
        detail: String,
    },
    /// Raised when the local `ssh` or `sshpass` process cannot start.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Builds the operator guidance attached to [`SessionError::SudoMisconfigured`].
#[must_use]
pub fn sudo_remediation(username: &str) -> String {
    format!(
        "passwordless sudo for rsync is not configured for {username}; \
         add `{username} ALL=(ALL) NOPASSWD: /usr/bin/rsync` to /etc/sudoers using visudo"
    )
}

/// Outcome of the elevation check performed by [`Connector::test_connection`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ElevationVerdict {
    /// Whether `sudo -n rsync` succeeded.
    pub available: bool,
    /// Version banner on success, remediation and diagnostic otherwise.
    pub detail: String,
}

/// Result of [`Connector::test_connection`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConnectionReport {
    /// Output of `uname -a` on the client.
    pub system_info: String,
    /// Present when the client is flagged for elevation.
    pub elevation: Option<ElevationVerdict>,
}

/// Opens sessions using a shared transport configuration and command runner.
#[derive(Clone)]
pub struct Connector {
    transport: SshTransport,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Creates a connector.
    #[must_use]
    pub const fn new(transport: SshTransport, runner: Arc<dyn CommandRunner>) -> Self {
        Self { transport, runner }
    }

    /// Transport settings in use.
    #[must_use]
    pub const fn transport(&self) -> &SshTransport {
        &self.transport
    }

    /// Command runner in use.
    #[must_use]
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Authenticates to `client` and returns a session bound to it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Auth`], [`SessionError::Network`],
    /// [`SessionError::HostKeyRejected`], or [`SessionError::Runner`].
    pub fn open(&self, client: &Client) -> Result<Session, SessionError> {
        let session = Session {
            connector: self.clone(),
            client: client.clone(),
        };
        let probe = session.exec(PROBE_COMMAND)?;
        if !probe.is_success() {
            return Err(SessionError::Network {
                host: client.host.clone(),
                port: client.port,
                detail: client.redact(&probe.diagnostic()),
            });
        }
        debug!(client_id = %client.id, login = %client.login(), "session opened");
        Ok(session)
    }

    /// Opens a session, reads system information, and checks elevation when
    /// the client requires it. Elevation problems are reported in the
    /// verdict rather than as an error.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Connector::open`] or from running
    /// [`SYSTEM_INFO_COMMAND`].
    pub fn test_connection(&self, client: &Client) -> Result<ConnectionReport, SessionError> {
        let session = self.open(client)?;
        let uname = session.exec(SYSTEM_INFO_COMMAND)?;
        let elevation = if client.elevated {
            Some(match verify_elevation(&session) {
                Ok(banner) => ElevationVerdict {
                    available: true,
                    detail: banner,
                },
                Err(err) => ElevationVerdict {
                    available: false,
                    detail: err.to_string(),
                },
            })
        } else {
            None
        };
        session.close();
        info!(client_id = %client.id, elevated = client.elevated, "connection test succeeded");
        Ok(ConnectionReport {
            system_info: uname.stdout.trim().to_owned(),
            elevation,
        })
    }
}

/// An authenticated channel to one client.
#[derive(Clone, Debug)]
pub struct Session {
    connector: Connector,
    client: Client,
}

impl Session {
    /// Client this session is bound to.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Transport settings used by this session.
    #[must_use]
    pub const fn transport(&self) -> &SshTransport {
        &self.connector.transport
    }

    /// Builds the command line for `remote_command` without running it.
    #[must_use]
    pub fn command_line(&self, remote_command: &str) -> CommandLine {
        self.connector
            .transport
            .remote_command(&self.client, remote_command)
    }

    /// Runs one remote command. A non-zero remote exit status is returned as
    /// output; only transport failures become errors. Captured text has the
    /// client's password scrubbed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Auth`], [`SessionError::Network`],
    /// [`SessionError::HostKeyRejected`], or [`SessionError::Runner`].
    pub fn exec(&self, remote_command: &str) -> Result<CommandOutput, SessionError> {
        let command = self.command_line(remote_command);
        debug!(client_id = %self.client.id, command = %command.display_string(), "running remote command");
        let output = self.connector.runner.run(&command)?;
        let via_sshpass = self.client.auth.password().is_some();
        if let Some(err) = classify_transport_failure(&self.client, &output, via_sshpass) {
            return Err(err);
        }
        Ok(CommandOutput {
            code: output.code,
            stdout: self.client.redact(&output.stdout),
            stderr: self.client.redact(&output.stderr),
        })
    }

    /// Ends the session. Every command already ran in its own `ssh`
    /// process, so nothing remains open.
    pub fn close(self) {
        debug!(client_id = %self.client.id, "session closed");
    }
}

/// Checks that `sudo rsync` runs without a password prompt on the session's
/// client and returns the rsync version banner.
///
/// # Errors
///
/// Returns [`SessionError::SudoMisconfigured`] when the probe fails for any
/// reason other than a transport error, including when sudo asks for a
/// password.
pub fn verify_elevation(session: &Session) -> Result<String, SessionError> {
    let output = session.exec(ELEVATION_PROBE)?;
    let banner = output.stdout.lines().next().unwrap_or_default().trim();
    if output.is_success() && output.stdout.to_lowercase().contains("rsync") {
        return Ok(banner.to_owned());
    }

    let username = session.client.username.clone();
    Err(SessionError::SudoMisconfigured {
        remediation: sudo_remediation(&username),
        username,
        detail: output.diagnostic(),
    })
}
