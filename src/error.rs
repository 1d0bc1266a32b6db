//! Error taxonomy shared by every surface of the service.

use std::fmt;

use serde::Serialize;

use crate::browse::BrowseError;
use crate::catalogue::CatalogueError;
use crate::engine::EngineError;
use crate::restore::RestoreError;
use crate::session::SessionError;
use crate::storage::StorageError;
use crate::transfer::TransferError;

/// Coarse classification of a failure, stable across modules.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials were rejected.
    Auth,
    /// The client could not be reached or the connection dropped.
    Network,
    /// Host identity verification refused the connection.
    HostKey,
    /// Passwordless `sudo rsync` is not configured on the client.
    SudoMisconfigured,
    /// A path argument failed validation or does not exist remotely.
    PathValidation,
    /// rsync failed.
    TransferFailure,
    /// A job points at a client that no longer exists.
    Referential,
    /// The job already has an active run.
    AlreadyRunning,
    /// A requested record does not exist.
    NotFound,
    /// Input failed validation.
    Validation,
    /// Local persistence failed.
    Storage,
    /// An unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Snake-case label used in JSON output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Network => "network",
            Self::HostKey => "host_key",
            Self::SudoMisconfigured => "sudo_misconfigured",
            Self::PathValidation => "path_validation",
            Self::TransferFailure => "transfer_failure",
            Self::Referential => "referential",
            Self::AlreadyRunning => "already_running",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Network { .. } => ErrorKind::Network,
            Self::HostKeyRejected { .. } => ErrorKind::HostKey,
            Self::SudoMisconfigured { .. } => ErrorKind::SudoMisconfigured,
            Self::Runner(_) => ErrorKind::Internal,
        }
    }
}

impl TransferError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Session(err) => err.kind(),
            Self::Failed { .. } => ErrorKind::TransferFailure,
            Self::Runner(_) => ErrorKind::Internal,
        }
    }
}

impl CatalogueError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ClientNotFound { .. } | Self::JobNotFound { .. } | Self::RunNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::Referential { .. } => ErrorKind::Referential,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::InvalidTransition { .. } => ErrorKind::Internal,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Storage { .. }
            | Self::Corrupt { .. }
            | Self::Locked { .. }
            | Self::ReadOnly { .. } => ErrorKind::Storage,
        }
    }
}

impl StorageError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingSnapshot { .. } => ErrorKind::NotFound,
            Self::Io { .. } | Self::NonUtf8 { .. } => ErrorKind::Storage,
        }
    }
}

impl EngineError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Catalogue(err) => err.kind(),
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::Session(err) => err.kind(),
            Self::Transfer(err) => err.kind(),
            Self::Storage(err) => err.kind(),
            Self::NoRuntime | Self::Worker { .. } => ErrorKind::Internal,
        }
    }
}

impl BrowseError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPath { .. }
            | Self::PathNotFound { .. }
            | Self::NotADirectory { .. }
            | Self::PermissionDenied { .. } => ErrorKind::PathValidation,
            Self::Session(err) => err.kind(),
            Self::ListingFailed { .. } | Self::Parse { .. } => ErrorKind::Internal,
        }
    }
}

impl RestoreError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDestination { .. } => ErrorKind::PathValidation,
            Self::NotRestorable { .. } => ErrorKind::Validation,
            Self::MissingSnapshot { .. } => ErrorKind::NotFound,
            Self::Catalogue(err) => err.kind(),
            Self::Session(err) => err.kind(),
            Self::Transfer(err) => err.kind(),
        }
    }
}
