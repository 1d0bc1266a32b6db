//! `ssh` argument construction and transport error classification.

use camino::Utf8PathBuf;
use shell_escape::unix::escape;

use crate::command::{CommandLine, CommandOutput};
use crate::model::{AuthMethod, Client};

use super::SessionError;

/// Environment variable `sshpass -e` reads the password from.
pub const SSHPASS_ENV: &str = "SSHPASS";

/// Exit status `ssh` uses for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;
/// `sshpass` exit status for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// `sshpass` exit status for an unknown host key it refused to confirm.
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;

const AUTH_MARKERS: [&str; 3] = [
    "permission denied",
    "too many authentication failures",
    "no supported authentication methods",
];
const HOST_KEY_MARKERS: [&str; 3] = [
    "host key verification failed",
    "remote host identification has changed",
    "no matching host key",
];

/// How unknown or changed host identities are treated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HostKeyPolicy {
    /// Any identity is accepted, including one that changed since it was
    /// first seen. Nothing is recorded, since OpenSSH refuses password
    /// authentication to a host whose recorded key no longer matches.
    #[default]
    AcceptAny,
    /// Trust on first use: unknown identities are accepted and remembered,
    /// changed identities are rejected.
    AcceptNew,
    /// Only identities already present in the known-hosts file are accepted.
    Strict,
}

impl HostKeyPolicy {
    /// Maps the configuration toggles onto a policy. `strict` wins when both
    /// are set.
    #[must_use]
    pub const fn from_settings(strict: bool, accept_new: bool) -> Self {
        match (strict, accept_new) {
            (true, _) => Self::Strict,
            (false, true) => Self::AcceptNew,
            (false, false) => Self::AcceptAny,
        }
    }

    const fn option_value(self) -> &'static str {
        match self {
            Self::AcceptAny => "no",
            Self::AcceptNew => "accept-new",
            Self::Strict => "yes",
        }
    }
}

/// Known-hosts target used when identities are not recorded.
const DISCARD_KNOWN_HOSTS: &str = "/dev/null";

/// Settings shared by every `ssh` invocation, including those `rsync`
/// makes on our behalf.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTransport {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `sshpass` executable used for password clients.
    pub sshpass_bin: String,
    /// Known-hosts file consulted and updated by `ssh` unless the policy
    /// accepts any identity.
    pub known_hosts_file: Utf8PathBuf,
    /// Host identity policy.
    pub host_key_policy: HostKeyPolicy,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl SshTransport {
    /// Options placed before the destination on every `ssh` command line.
    #[must_use]
    pub fn ssh_options(&self, client: &Client) -> Vec<String> {
        let mut args = vec![
            String::from("-p"),
            client.port.to_string(),
            String::from("-o"),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            String::from("-o"),
            format!(
                "StrictHostKeyChecking={}",
                self.host_key_policy.option_value()
            ),
            String::from("-o"),
            format!("UserKnownHostsFile={}", self.known_hosts_target()),
        ];

        match &client.auth {
            AuthMethod::Key { key_path } => {
                args.extend([
                    String::from("-i"),
                    key_path.to_string(),
                    String::from("-o"),
                    String::from("BatchMode=yes"),
                    String::from("-o"),
                    String::from("IdentitiesOnly=yes"),
                    String::from("-o"),
                    String::from("PreferredAuthentications=publickey"),
                ]);
            }
            AuthMethod::Password { .. } => {
                args.extend([
                    String::from("-o"),
                    String::from("BatchMode=no"),
                    String::from("-o"),
                    String::from("PubkeyAuthentication=no"),
                    String::from("-o"),
                    String::from("PreferredAuthentications=password,keyboard-interactive"),
                    String::from("-o"),
                    String::from("NumberOfPasswordPrompts=1"),
                ]);
            }
        }
        args
    }

    /// Known-hosts file handed to `ssh` under the current policy.
    #[must_use]
    pub fn known_hosts_target(&self) -> &str {
        match self.host_key_policy {
            HostKeyPolicy::AcceptAny => DISCARD_KNOWN_HOSTS,
            HostKeyPolicy::AcceptNew | HostKeyPolicy::Strict => self.known_hosts_file.as_str(),
        }
    }

    /// Starts a command line for `program`, wrapped in `sshpass -e` for
    /// password clients so the secret travels only in the environment.
    #[must_use]
    pub fn launcher(&self, client: &Client, program: &str) -> CommandLine {
        match client.auth.password() {
            Some(password) => CommandLine::new(self.sshpass_bin.clone())
                .arg("-e")
                .arg(program)
                .secret_env(SSHPASS_ENV, password.clone()),
            None => CommandLine::new(program),
        }
    }

    /// Builds an `ssh` invocation that runs `remote_command` on the client.
    ///
    /// `remote_command` is handed to the remote login shell verbatim; callers
    /// escape any untrusted parts.
    #[must_use]
    pub fn remote_command(&self, client: &Client, remote_command: &str) -> CommandLine {
        self.launcher(client, &self.ssh_bin)
            .args(self.ssh_options(client))
            .arg(client.login())
            .arg(remote_command)
    }

    /// Renders the remote shell string passed to `rsync -e`.
    #[must_use]
    pub fn rsync_shell(&self, client: &Client) -> String {
        let mut parts = vec![escape(self.ssh_bin.as_str().into()).into_owned()];
        parts.extend(
            self.ssh_options(client)
                .iter()
                .map(|arg| escape(arg.as_str().into()).into_owned()),
        );
        parts.join(" ")
    }
}

/// Maps transport-level failures to typed errors. Returns `None` when the
/// output does not indicate an authentication, host-key, or network failure.
///
/// `via_sshpass` selects the interpretation of `sshpass` exit codes.
#[must_use]
pub fn classify_transport_failure(
    client: &Client,
    output: &CommandOutput,
    via_sshpass: bool,
) -> Option<SessionError> {
    let detail = client.redact(&output.diagnostic());
    let lowered = detail.to_lowercase();

    let ssh_failed = output.code == Some(SSH_TRANSPORT_FAILURE);

    if (ssh_failed && HOST_KEY_MARKERS.iter().any(|marker| lowered.contains(marker)))
        || (via_sshpass && output.code == Some(SSHPASS_HOST_KEY_UNKNOWN))
    {
        return Some(SessionError::HostKeyRejected {
            host: client.host.clone(),
            detail,
        });
    }
    if (via_sshpass && output.code == Some(SSHPASS_BAD_PASSWORD))
        || (ssh_failed && AUTH_MARKERS.iter().any(|marker| lowered.contains(marker)))
    {
        return Some(SessionError::Auth {
            login: client.login(),
            detail,
        });
    }
    if ssh_failed || output.code.is_none() {
        return Some(SessionError::Network {
            host: client.host.clone(),
            port: client.port,
            detail,
        });
    }
    None
}
