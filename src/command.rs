//! External process seam shared by the session and transfer layers.
//!
//! Every `ssh`, `sshpass`, and `rsync` invocation is described as a
//! [`CommandLine`] and executed through a [`CommandRunner`], so tests can
//! substitute scripted runners without spawning processes.

use std::ffi::OsString;
use std::fmt;
use std::process::Command;

use thiserror::Error;

use crate::model::Secret;

/// Program, argument vector, and environment for one process invocation.
///
/// Arguments are passed to the OS verbatim and are never interpreted by a
/// shell on the local side.
#[derive(Clone, Eq, PartialEq)]
pub struct CommandLine {
    program: String,
    args: Vec<OsString>,
    env: Vec<(String, Secret)>,
}

impl CommandLine {
    /// Starts a command line for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments in order.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable holding secret material.
    #[must_use]
    pub fn secret_env(mut self, key: impl Into<String>, value: Secret) -> Self {
        self.env.push((key.into(), value));
        self
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument vector.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Names of environment variables set for the invocation.
    pub fn env_keys(&self) -> impl Iterator<Item = &str> {
        self.env.iter().map(|(key, _)| key.as_str())
    }

    /// Renders a shell-like string for logs and assertions. Environment
    /// values are never included.
    #[must_use]
    pub fn display_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLine")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env_keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns stderr when present, otherwise stdout, trimmed.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_owned()
        } else {
            stderr.to_owned()
        }
    }
}

/// Errors raised before a command produced any output.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
///
/// Runners are shared between the scheduler, worker pool, and request
/// handlers, so implementations must be thread-safe.
pub trait CommandRunner: Send + Sync {
    /// Runs `command`, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started.
    fn run(&self, command: &CommandLine) -> Result<CommandOutput, RunnerError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, command: &CommandLine) -> Result<CommandOutput, RunnerError> {
        let mut process = Command::new(command.program());
        process.args(command.arguments());
        for (key, value) in &command.env {
            process.env(key, value.expose());
        }

        let output = process.output().map_err(|err| RunnerError::Spawn {
            program: command.program().to_owned(),
            message: err.to_string(),
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
