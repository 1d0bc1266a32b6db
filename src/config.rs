//! Service configuration loaded via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::session::{HostKeyPolicy, SshTransport};

/// Default directory holding the catalogue, snapshots, and known hosts.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/backhaul";
/// File name of the catalogue inside the data directory.
pub const CATALOGUE_FILE: &str = "catalogue.json";
/// File name of the ssh known hosts file inside the data directory.
pub const KNOWN_HOSTS_FILE: &str = "known_hosts";

/// Settings merged from defaults, `backhaul.toml`, and `BACKHAUL_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BACKHAUL",
    discovery(
        app_name = "backhaul",
        env_var = "BACKHAUL_CONFIG_PATH",
        config_file_name = "backhaul.toml",
        dotfile_name = ".backhaul.toml",
        project_file_name = "backhaul.toml"
    )
)]
pub struct BackhaulConfig {
    /// Root of all persisted state.
    #[ortho_config(default = Utf8PathBuf::from(DEFAULT_DATA_DIR))]
    pub data_dir: Utf8PathBuf,
    /// `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// `sshpass` executable used for password clients.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Refuse hosts whose key is not already known. Overrides
    /// `accept_new_host_keys`.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Remember unknown hosts on first use and refuse ones whose key has
    /// changed. When neither toggle is set, changed keys are accepted.
    #[ortho_config(default = false)]
    pub accept_new_host_keys: bool,
    /// Known hosts file; defaults to `<data_dir>/known_hosts`.
    pub known_hosts_file: Option<Utf8PathBuf>,
    /// ssh connection timeout.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Pause between scheduler ticks.
    #[ortho_config(default = 30)]
    pub tick_interval_secs: u64,
    /// Maximum concurrent transfers.
    #[ortho_config(default = 4)]
    pub worker_pool_size: usize,
    /// Runs returned by history queries when no limit is given.
    #[ortho_config(default = 50)]
    pub history_limit: usize,
}

impl Default for BackhaulConfig {
    fn default() -> Self {
        Self {
            data_dir: Utf8PathBuf::from(DEFAULT_DATA_DIR),
            rsync_bin: String::from("rsync"),
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            strict_host_key_checking: false,
            accept_new_host_keys: false,
            known_hosts_file: None,
            connect_timeout_secs: 10,
            tick_interval_secs: 30,
            worker_pool_size: 4,
            history_limit: 50,
        }
    }
}

impl BackhaulConfig {
    /// Loads configuration from files and environment without parsing CLI
    /// arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("backhaul")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Creates a default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Path of the catalogue file.
    #[must_use]
    pub fn catalogue_path(&self) -> Utf8PathBuf {
        self.data_dir.join(CATALOGUE_FILE)
    }

    /// Effective known hosts file.
    #[must_use]
    pub fn known_hosts_path(&self) -> Utf8PathBuf {
        self.known_hosts_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(KNOWN_HOSTS_FILE))
    }

    /// Pause between scheduler ticks.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// ssh transport settings derived from this configuration.
    #[must_use]
    pub fn transport(&self) -> SshTransport {
        SshTransport {
            ssh_bin: self.ssh_bin.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            known_hosts_file: self.known_hosts_path(),
            host_key_policy: HostKeyPolicy::from_settings(
                self.strict_host_key_checking,
                self.accept_new_host_keys,
            ),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }

    /// Checks values the loader cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the environment variable and
    /// TOML key to fix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_text(self.data_dir.as_str(), "data directory", "data_dir")?;
        require_text(&self.rsync_bin, "rsync executable", "rsync_bin")?;
        require_text(&self.ssh_bin, "ssh executable", "ssh_bin")?;
        require_text(&self.sshpass_bin, "sshpass executable", "sshpass_bin")?;
        require_positive(self.connect_timeout_secs, "connection timeout", "connect_timeout_secs")?;
        require_positive(self.tick_interval_secs, "scheduler tick interval", "tick_interval_secs")?;
        require_positive(count(self.worker_pool_size), "worker pool size", "worker_pool_size")?;
        require_positive(count(self.history_limit), "history limit", "history_limit")?;
        if !self.data_dir.is_absolute() {
            return Err(invalid("data directory must be an absolute path", "data_dir"));
        }
        Ok(())
    }
}

fn count(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn invalid(problem: &str, key: &str) -> ConfigError {
    ConfigError::Invalid(format!(
        "{problem}: set BACKHAUL_{} or {key} in backhaul.toml",
        key.to_uppercase()
    ))
}

fn require_text(value: &str, description: &str, key: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(&format!("missing {description}"), key));
    }
    Ok(())
}

fn require_positive(value: u64, description: &str, key: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(&format!("{description} must be greater than zero"), key));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when a setting has an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Raised when the loader fails to merge sources.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
