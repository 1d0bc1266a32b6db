//! On-demand directory listings of a client's filesystem, used when picking
//! backup sources and restore destinations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

use crate::model::Client;
use crate::session::{Connector, SessionError};

/// Remote exit status signalling that the path does not exist.
pub const EXIT_NOT_FOUND: i32 = 44;
/// Remote exit status signalling that the path is not a directory.
pub const EXIT_NOT_DIRECTORY: i32 = 45;
/// Remote exit status signalling that the directory cannot be read.
pub const EXIT_PERMISSION_DENIED: i32 = 46;

const FIELDS_PER_ENTRY: usize = 5;

/// Errors raised while browsing.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BrowseError {
    /// Raised when the requested path is not absolute or contains control
    /// characters.
    #[error("invalid browse path {path:?}: {reason}")]
    InvalidPath {
        /// Rejected path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// Raised when the path does not exist on the client.
    #[error("path {path} does not exist")]
    PathNotFound {
        /// Requested path.
        path: String,
    },
    /// Raised when the path exists but is not a directory.
    #[error("path {path} is not a directory")]
    NotADirectory {
        /// Requested path.
        path: String,
    },
    /// Raised when the remote user cannot read the directory.
    #[error("permission denied reading {path}")]
    PermissionDenied {
        /// Requested path.
        path: String,
    },
    /// Raised when the connection to the client fails.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Raised when the listing command fails for another reason.
    #[error("listing {path} failed: {detail}")]
    ListingFailed {
        /// Requested path.
        path: String,
        /// Redacted diagnostic.
        detail: String,
    },
    /// Raised when the listing output cannot be decoded.
    #[error("unexpected listing output: {detail}")]
    Parse {
        /// What was wrong with the output.
        detail: String,
    },
}

/// One child of a listed directory.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RemoteEntry {
    /// File name without the parent path.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Size in bytes as reported by the client.
    pub size: u64,
    /// Last modification time.
    pub modified: Option<DateTime<Utc>>,
    /// Permission bits in octal, for example `755`.
    pub mode: String,
}

/// Entries of one directory, directories first then by case-insensitive
/// name.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Listing {
    /// Directory that was listed.
    pub path: String,
    /// Its children.
    pub entries: Vec<RemoteEntry>,
}

/// Lists remote directories through a fresh session per call. Results are
/// never cached.
#[derive(Clone, Debug)]
pub struct Browser {
    connector: Connector,
}

impl Browser {
    /// Creates a browser.
    #[must_use]
    pub const fn new(connector: Connector) -> Self {
        Self { connector }
    }

    /// Lists `path` on `client`. An empty or missing path means `/`.
    ///
    /// # Errors
    ///
    /// Returns [`BrowseError::InvalidPath`] before connecting, a session
    /// error when the client cannot be reached, or one of
    /// [`BrowseError::PathNotFound`], [`BrowseError::NotADirectory`],
    /// [`BrowseError::PermissionDenied`], [`BrowseError::ListingFailed`],
    /// [`BrowseError::Parse`].
    pub fn list(&self, client: &Client, path: Option<&str>) -> Result<Listing, BrowseError> {
        let target = normalise(path)?;
        let session = self.connector.open(client)?;
        let output = session.exec(&listing_script(&target))?;
        session.close();

        match output.code {
            Some(0) => {}
            Some(EXIT_NOT_FOUND) => return Err(BrowseError::PathNotFound { path: target }),
            Some(EXIT_NOT_DIRECTORY) => return Err(BrowseError::NotADirectory { path: target }),
            Some(EXIT_PERMISSION_DENIED) => {
                return Err(BrowseError::PermissionDenied { path: target });
            }
            _ => {
                return Err(BrowseError::ListingFailed {
                    path: target,
                    detail: output.diagnostic(),
                });
            }
        }

        let mut entries = parse_listing(&output.stdout)?;
        entries.sort_by(|left, right| {
            right
                .is_directory
                .cmp(&left.is_directory)
                .then_with(|| left.name.to_lowercase().cmp(&right.name.to_lowercase()))
        });
        debug!(client_id = %client.id, path = %target, entries = entries.len(), "listed remote directory");
        Ok(Listing {
            path: target,
            entries,
        })
    }
}

fn normalise(path: Option<&str>) -> Result<String, BrowseError> {
    let text = path.map(str::trim).filter(|value| !value.is_empty()).unwrap_or("/");
    if !text.starts_with('/') {
        return Err(BrowseError::InvalidPath {
            path: text.to_owned(),
            reason: "path must be absolute",
        });
    }
    if text.chars().any(char::is_control) {
        return Err(BrowseError::InvalidPath {
            path: text.to_owned(),
            reason: "path must not contain control characters",
        });
    }
    Ok(text.to_owned())
}

/// Builds the POSIX shell script that checks `path` and prints one
/// NUL-separated record per child: type, size, mtime, mode, name.
#[must_use]
pub fn listing_script(path: &str) -> String {
    let quoted = escape(path.into());
    format!(
        "[ -e {quoted} ] || exit {EXIT_NOT_FOUND}; \
         [ -d {quoted} ] || exit {EXIT_NOT_DIRECTORY}; \
         {{ [ -r {quoted} ] && [ -x {quoted} ]; }} || exit {EXIT_PERMISSION_DENIED}; \
         find {quoted} -mindepth 1 -maxdepth 1 -printf '%y\\0%s\\0%T@\\0%m\\0%f\\0'"
    )
}

fn parse_listing(stdout: &str) -> Result<Vec<RemoteEntry>, BrowseError> {
    let body = stdout.strip_suffix('\0').unwrap_or(stdout);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let fields: Vec<&str> = body.split('\0').collect();
    let records = fields.chunks_exact(FIELDS_PER_ENTRY);
    if !records.remainder().is_empty() {
        return Err(BrowseError::Parse {
            detail: format!("{} fields is not a whole number of entries", fields.len()),
        });
    }
    records.map(parse_entry).collect()
}

fn parse_entry(record: &[&str]) -> Result<RemoteEntry, BrowseError> {
    let [kind, size, modified, mode, name] = record else {
        return Err(BrowseError::Parse {
            detail: String::from("truncated entry"),
        });
    };
    let parsed_size = size.parse::<u64>().map_err(|_| BrowseError::Parse {
        detail: format!("invalid size {size:?} for {name}"),
    })?;
    Ok(RemoteEntry {
        name: (*name).to_owned(),
        is_directory: *kind == "d",
        size: parsed_size,
        modified: parse_mtime(modified),
        mode: (*mode).to_owned(),
    })
}

fn parse_mtime(text: &str) -> Option<DateTime<Utc>> {
    let seconds = text.split('.').next()?.parse::<i64>().ok()?;
    DateTime::from_timestamp(seconds, 0)
}
