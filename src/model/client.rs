//! Remote backup targets and their credentials.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClientId, Secret, ValidationError, require_text};

/// SSH port used when a client does not specify one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How the server authenticates to a client. Exactly one method is ever set.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication, fed to `ssh` through `sshpass`.
    Password {
        /// Login password.
        password: Secret,
    },
    /// Private key authentication.
    Key {
        /// Path to the private key on the server.
        key_path: Utf8PathBuf,
    },
}

impl AuthMethod {
    /// Builds an auth method from loosely-typed API input.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] unless exactly one of `password` and
    /// `key_path` is supplied and non-blank.
    pub fn from_parts(
        password: Option<Secret>,
        key_path: Option<Utf8PathBuf>,
    ) -> Result<Self, ValidationError> {
        let password_value = password.filter(|secret| !secret.is_blank());
        let key_value = key_path.filter(|path| !path.as_str().trim().is_empty());
        match (password_value, key_value) {
            (Some(secret), None) => Ok(Self::Password { password: secret }),
            (None, Some(path)) => Ok(Self::Key { key_path: path }),
            (Some(_), Some(_)) => Err(ValidationError::new(
                "auth",
                "supply either a password or a key path, not both",
            )),
            (None, None) => Err(ValidationError::new(
                "auth",
                "a password or a key path is required",
            )),
        }
    }

    /// Returns the password when password authentication is configured.
    #[must_use]
    pub const fn password(&self) -> Option<&Secret> {
        match self {
            Self::Password { password } => Some(password),
            Self::Key { .. } => None,
        }
    }

    /// Returns the key path when key authentication is configured.
    #[must_use]
    pub fn key_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Password { .. } => None,
            Self::Key { key_path } => Some(key_path),
        }
    }
}

/// A registered remote host.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Client {
    /// Catalogue identifier.
    pub id: ClientId,
    /// Display name.
    pub name: String,
    /// Hostname or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Remote login.
    pub username: String,
    /// Credential used to log in.
    pub auth: AuthMethod,
    /// Whether remote `rsync` must run through passwordless `sudo`.
    pub elevated: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Client {
    /// Returns `user@host` as used by `ssh` and `rsync`.
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Scrubs this client's password from `text`.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.auth
            .password()
            .map_or_else(|| text.to_owned(), |secret| secret.redact(text))
    }
}

/// Input for registering a client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewClient {
    /// Display name.
    pub name: String,
    /// Hostname or address.
    pub host: String,
    /// SSH port; defaults to [`DEFAULT_SSH_PORT`].
    pub port: Option<u16>,
    /// Remote login.
    pub username: String,
    /// Credential used to log in.
    pub auth: AuthMethod,
    /// Whether remote `rsync` must run through passwordless `sudo`.
    pub elevated: bool,
}

impl NewClient {
    pub(crate) fn into_client(
        self,
        id: ClientId,
        now: DateTime<Utc>,
    ) -> Result<Client, ValidationError> {
        let port = validate_port(self.port.unwrap_or(DEFAULT_SSH_PORT))?;
        validate_auth(&self.auth)?;
        Ok(Client {
            id,
            name: require_text(&self.name, "name")?,
            host: validate_host(&self.host)?,
            port,
            username: validate_username(&self.username)?,
            auth: self.auth,
            elevated: self.elevated,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Typed partial update for a client. Only populated fields change.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New hostname or address.
    pub host: Option<String>,
    /// New SSH port.
    pub port: Option<u16>,
    /// New remote login.
    pub username: Option<String>,
    /// Replacement credential.
    pub auth: Option<AuthMethod>,
    /// New elevation flag.
    pub elevated: Option<bool>,
}

impl ClientUpdate {
    /// Returns `true` when no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.host.is_none()
            && self.port.is_none()
            && self.username.is_none()
            && self.auth.is_none()
            && self.elevated.is_none()
    }

    pub(crate) fn apply(
        self,
        client: &Client,
        now: DateTime<Utc>,
    ) -> Result<Client, ValidationError> {
        let mut updated = client.clone();
        if let Some(name) = self.name {
            updated.name = require_text(&name, "name")?;
        }
        if let Some(host) = self.host {
            updated.host = validate_host(&host)?;
        }
        if let Some(port) = self.port {
            updated.port = validate_port(port)?;
        }
        if let Some(username) = self.username {
            updated.username = validate_username(&username)?;
        }
        if let Some(auth) = self.auth {
            validate_auth(&auth)?;
            updated.auth = auth;
        }
        if let Some(elevated) = self.elevated {
            updated.elevated = elevated;
        }
        updated.updated_at = now;
        Ok(updated)
    }
}

fn validate_port(port: u16) -> Result<u16, ValidationError> {
    if port == 0 {
        return Err(ValidationError::new("port", "must be between 1 and 65535"));
    }
    Ok(port)
}

// Host and user end up inside `user@host`, so neither may contain characters
// that would change how `ssh` parses the destination.
fn validate_host(host: &str) -> Result<String, ValidationError> {
    let trimmed = require_text(host, "host")?;
    if trimmed.starts_with('-') || trimmed.contains(['@', ' ', '\t', '\n', '\r', '/']) {
        return Err(ValidationError::new("host", "contains invalid characters"));
    }
    Ok(trimmed)
}

fn validate_username(username: &str) -> Result<String, ValidationError> {
    let trimmed = require_text(username, "username")?;
    if trimmed.starts_with('-') || trimmed.contains(['@', ':', ' ', '\t', '\n', '\r']) {
        return Err(ValidationError::new(
            "username",
            "contains invalid characters",
        ));
    }
    Ok(trimmed)
}

fn validate_auth(auth: &AuthMethod) -> Result<(), ValidationError> {
    match auth {
        AuthMethod::Password { password } if password.is_blank() => {
            Err(ValidationError::new("password", "must not be empty"))
        }
        AuthMethod::Key { key_path } if key_path.as_str().trim().is_empty() => {
            Err(ValidationError::new("key_path", "must not be empty"))
        }
        AuthMethod::Password { .. } | AuthMethod::Key { .. } => Ok(()),
    }
}
