//! Local layout of backup payloads.
//!
//! Snapshots live under `<data>/backups/job-<id>/<UTC timestamp>-run-<id>`.
//! Each snapshot is a complete tree; unchanged files are hard links into the
//! previous snapshot of the same job.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::model::{JobId, RunId};

/// Directory below the data directory holding snapshots.
pub const BACKUPS_DIR: &str = "backups";

/// Errors raised while reading or preparing snapshot storage.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageError {
    /// Raised when a directory cannot be created or read.
    #[error("snapshot storage error at {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// Raised when a snapshot directory is missing.
    #[error("snapshot {path} does not exist")]
    MissingSnapshot {
        /// Expected snapshot directory.
        path: Utf8PathBuf,
    },
    /// Raised when a snapshot contains a path that is not valid UTF-8.
    #[error("snapshot entry {path} is not valid UTF-8")]
    NonUtf8 {
        /// Lossy rendering of the offending path.
        path: String,
    },
}

/// One file or directory inside a stored snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SnapshotEntry {
    /// Path relative to the snapshot root.
    pub path: Utf8PathBuf,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Size in bytes; zero for directories.
    pub size: u64,
}

/// Regular file count and total size of a snapshot tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SnapshotMeasure {
    /// Regular files found.
    pub regular_files: u64,
    /// Sum of regular file sizes.
    pub total_bytes: u64,
}

/// Snapshot directory layout rooted at `<data>/backups`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotStore {
    root: Utf8PathBuf,
}

impl SnapshotStore {
    /// Creates a store for `data_dir`.
    #[must_use]
    pub fn new(data_dir: &Utf8Path) -> Self {
        Self {
            root: data_dir.join(BACKUPS_DIR),
        }
    }

    /// Root directory of all snapshots.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory that will hold the snapshot of `run`.
    #[must_use]
    pub fn snapshot_dir(&self, job: JobId, run: RunId, started: DateTime<Utc>) -> Utf8PathBuf {
        self.root
            .join(format!("job-{job}"))
            .join(format!("{}-run-{run}", started.format("%Y%m%dT%H%M%SZ")))
    }

    /// Creates `snapshot` and its parents.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the directory cannot be created.
    pub fn prepare(&self, snapshot: &Utf8Path) -> Result<(), StorageError> {
        Dir::create_ambient_dir_all(snapshot, ambient_authority())
            .map_err(|err| io_error(snapshot, &err))
    }

    /// Lists every entry of `snapshot`, sorted by relative path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingSnapshot`] when the directory is gone,
    /// or [`StorageError::Io`] when walking fails.
    pub fn list(&self, snapshot: &Utf8Path) -> Result<Vec<SnapshotEntry>, StorageError> {
        let mut entries = Vec::new();
        for item in self.walk(snapshot)? {
            let entry = item.map_err(|err| walk_error(snapshot, err))?;
            let relative = relative_path(snapshot, entry.path())?;
            let is_directory = entry.file_type().is_dir();
            let size = if is_directory {
                0
            } else {
                entry
                    .metadata()
                    .map_err(|err| walk_error(snapshot, err))?
                    .len()
            };
            entries.push(SnapshotEntry {
                path: relative,
                is_directory,
                size,
            });
        }
        entries.sort_by(|left, right| left.path.cmp(&right.path));
        Ok(entries)
    }

    /// Counts regular files and their total size in `snapshot`.
    ///
    /// # Errors
    ///
    /// As for [`SnapshotStore::list`].
    pub fn measure(&self, snapshot: &Utf8Path) -> Result<SnapshotMeasure, StorageError> {
        let mut measure = SnapshotMeasure::default();
        for item in self.walk(snapshot)? {
            let entry = item.map_err(|err| walk_error(snapshot, err))?;
            if entry.file_type().is_file() {
                let size = entry
                    .metadata()
                    .map_err(|err| walk_error(snapshot, err))?
                    .len();
                measure.regular_files += 1;
                measure.total_bytes = measure.total_bytes.saturating_add(size);
            }
        }
        Ok(measure)
    }

    fn walk(&self, snapshot: &Utf8Path) -> Result<walkdir::IntoIter, StorageError> {
        if !snapshot.starts_with(&self.root) || !snapshot.is_dir() {
            return Err(StorageError::MissingSnapshot {
                path: snapshot.to_path_buf(),
            });
        }
        Ok(WalkDir::new(snapshot)
            .min_depth(1)
            .follow_links(false)
            .into_iter())
    }
}

fn relative_path(root: &Utf8Path, path: &std::path::Path) -> Result<Utf8PathBuf, StorageError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    Utf8PathBuf::from_path_buf(relative.to_path_buf()).map_err(|raw| StorageError::NonUtf8 {
        path: raw.display().to_string(),
    })
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn walk_error(snapshot: &Utf8Path, err: walkdir::Error) -> StorageError {
    let path = err
        .path()
        .and_then(Utf8Path::from_path)
        .map_or_else(|| snapshot.to_path_buf(), Utf8Path::to_path_buf);
    StorageError::Io {
        path,
        message: err.to_string(),
    }
}
