//! Records managed by the catalogue: clients, jobs, and runs.

mod client;
mod ids;
mod job;
mod run;
mod secret;

pub use client::{AuthMethod, Client, ClientUpdate, DEFAULT_SSH_PORT, NewClient};
pub use ids::{ClientId, JobId, RunId};
pub use job::{Job, JobUpdate, NewJob};
pub use run::{Run, RunCompletion, RunStatus};
pub use secret::Secret;

use thiserror::Error;

/// Raised when a record fails field-level validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    /// Field that failed validation.
    pub field: &'static str,
    /// Human-readable reason.
    pub message: String,
}

impl ValidationError {
    pub(crate) fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub(crate) fn require_text(value: &str, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(trimmed.to_owned())
}
