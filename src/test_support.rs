//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandLine, CommandOutput, CommandRunner, RunnerError};
use crate::model::{AuthMethod, Client, ClientId, Secret};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Names of environment variables set for the process.
    pub env_keys: Vec<String>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns `true` when any argument equals `value`.
    #[must_use]
    pub fn has_arg(&self, value: &str) -> bool {
        self.args.iter().any(|arg| arg == value)
    }
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<(String, CommandOutput)>,
    queue: VecDeque<Result<CommandOutput, RunnerError>>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner for deterministic command outcomes without
/// spawning processes.
///
/// Rules registered with [`ScriptedRunner::on_match`] answer every command
/// whose rendered text contains the rule's needle. Commands matching no rule
/// consume queued responses in FIFO order. Clones share one script.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.script).invocations.clone()
    }

    /// Returns the rendered command strings recorded so far.
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Answers every command containing `needle` with `output`.
    pub fn on_match(&self, needle: &str, output: CommandOutput) {
        lock(&self.script).rules.push((needle.to_owned(), output));
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code with no output.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.script).queue.push_back(Ok(output(code, stdout, stderr)));
    }

    /// Pushes a spawn failure.
    pub fn push_spawn_failure(&self, program: &str) {
        lock(&self.script).queue.push_back(Err(RunnerError::Spawn {
            program: program.to_owned(),
            message: String::from("No such file or directory (os error 2)"),
        }));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &CommandLine) -> Result<CommandOutput, RunnerError> {
        let rendered = command.display_string();
        let mut script = lock(&self.script);
        script.invocations.push(CommandInvocation {
            program: command.program().to_owned(),
            args: command.arguments().to_vec(),
            env_keys: command.env_keys().map(str::to_owned).collect(),
        });

        if let Some((_, matched)) = script
            .rules
            .iter()
            .find(|(needle, _)| rendered.contains(needle.as_str()))
        {
            return Ok(matched.clone());
        }
        script
            .queue
            .pop_front()
            .unwrap_or_else(|| {
                Err(RunnerError::Spawn {
                    program: command.program().to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
    }
}

/// Builds a [`CommandOutput`].
#[must_use]
pub fn output(code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

/// Renders the tail of `rsync --stats` output for the given totals.
#[must_use]
pub fn rsync_stats(regular_files: u64, total_bytes: u64) -> String {
    let dirs = 1;
    format!(
        "\nNumber of files: {total} (reg: {regular_files}, dir: {dirs})\n\
         Number of created files: {regular_files}\n\
         Total file size: {total_bytes} bytes\n\
         Total transferred file size: {total_bytes} bytes\n\
         \nsent 120 bytes  received 4,096 bytes  8,432.00 bytes/sec\n",
        total = regular_files + dirs,
    )
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// Latch that holds matching commands until released.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    state: Arc<(Mutex<GateState>, Condvar)>,
}

impl Gate {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands that have reached the gate.
    #[must_use]
    pub fn entered(&self) -> usize {
        lock(&self.state.0).entered
    }

    /// Releases every held and future command.
    pub fn open(&self) {
        let (mutex, condvar) = &*self.state;
        lock(mutex).open = true;
        condvar.notify_all();
    }

    fn pass(&self) {
        let (mutex, condvar) = &*self.state;
        let mut guard = lock(mutex);
        guard.entered += 1;
        while !guard.open {
            guard = condvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Polls until at least `count` commands reached the gate.
    pub async fn wait_for_entries(&self, count: usize) {
        while self.entered() < count {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

/// Runner that blocks commands containing `needle` at a [`Gate`] before
/// delegating to a [`ScriptedRunner`].
#[derive(Clone, Debug)]
pub struct GatedRunner {
    inner: ScriptedRunner,
    needle: String,
    gate: Gate,
}

impl GatedRunner {
    /// Wraps `inner`, holding commands that contain `needle`.
    #[must_use]
    pub fn new(inner: ScriptedRunner, needle: &str, gate: Gate) -> Self {
        Self {
            inner,
            needle: needle.to_owned(),
            gate,
        }
    }
}

impl CommandRunner for GatedRunner {
    fn run(&self, command: &CommandLine) -> Result<CommandOutput, RunnerError> {
        if command.display_string().contains(&self.needle) {
            self.gate.pass();
        }
        self.inner.run(command)
    }
}

/// Fixed reference instant used by tests.
#[must_use]
pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 1, 30, 0)
        .single()
        .unwrap_or_default()
}

/// Builds a key-authenticated client record.
#[must_use]
pub fn key_client(id: u64, elevated: bool) -> Client {
    client_with(
        id,
        AuthMethod::Key {
            key_path: Utf8PathBuf::from("/srv/backhaul/keys/id_ed25519"),
        },
        elevated,
    )
}

/// Builds a password-authenticated client record.
#[must_use]
pub fn password_client(id: u64, password: &str) -> Client {
    client_with(
        id,
        AuthMethod::Password {
            password: Secret::new(password),
        },
        false,
    )
}

fn client_with(id: u64, auth: AuthMethod, elevated: bool) -> Client {
    Client {
        id: ClientId::new(id),
        name: format!("client-{id}"),
        host: String::from("files.example.test"),
        port: 2222,
        username: String::from("backup"),
        auth,
        elevated,
        created_at: reference_time(),
        updated_at: reference_time(),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
