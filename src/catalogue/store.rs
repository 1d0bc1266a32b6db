//! Whole-file JSON persistence for the catalogue.

use std::fs::{File, TryLockError};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{
    ambient_authority,
    fs_utf8::{Dir, OpenOptions},
};
use serde::{Deserialize, Serialize};

use super::CatalogueError;
use super::state::CatalogueState;
use crate::model::{Client, ClientId, Job, JobId, Run, RunId};

const FORMAT_VERSION: u32 = 1;

/// On-disk layout. Records are stored as arrays so the file reads naturally.
#[derive(Debug, Deserialize, Serialize)]
struct Snapshot {
    version: u32,
    next_client_id: ClientId,
    next_job_id: JobId,
    next_run_id: RunId,
    clients: Vec<Client>,
    jobs: Vec<Job>,
    runs: Vec<Run>,
}

impl From<&CatalogueState> for Snapshot {
    fn from(state: &CatalogueState) -> Self {
        Self {
            version: FORMAT_VERSION,
            next_client_id: state.next_client_id,
            next_job_id: state.next_job_id,
            next_run_id: state.next_run_id,
            clients: state.clients.values().cloned().collect(),
            jobs: state.jobs.values().cloned().collect(),
            runs: state.runs.values().cloned().collect(),
        }
    }
}

impl From<Snapshot> for CatalogueState {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            next_client_id: snapshot.next_client_id,
            next_job_id: snapshot.next_job_id,
            next_run_id: snapshot.next_run_id,
            clients: snapshot
                .clients
                .into_iter()
                .map(|client| (client.id, client))
                .collect(),
            jobs: snapshot.jobs.into_iter().map(|job| (job.id, job)).collect(),
            runs: snapshot.runs.into_iter().map(|run| (run.id, run)).collect(),
        }
    }
}

/// Exclusive advisory lock on `<catalogue>.lock`, released when dropped.
#[derive(Debug)]
pub(crate) struct WriterLock {
    _file: File,
}

/// Catalogue file location. Writes go to a sibling temporary file that is
/// renamed over the target so readers never observe a partial document.
#[derive(Clone, Debug)]
pub(crate) struct SnapshotFile {
    path: Utf8PathBuf,
}

impl SnapshotFile {
    pub(crate) fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn parent(&self) -> &Utf8Path {
        self.path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."))
    }

    fn file_name(&self) -> Result<&str, CatalogueError> {
        self.path.file_name().ok_or_else(|| CatalogueError::Storage {
            path: self.path.clone(),
            message: String::from("catalogue path is missing a file name"),
        })
    }

    fn open_parent(&self, create: bool) -> Result<Dir, CatalogueError> {
        let parent = self.parent();
        if create {
            Dir::create_ambient_dir_all(parent, ambient_authority())
                .map_err(|err| io_error(parent, &err))?;
        }
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))
    }

    /// Takes the writer lock without blocking, creating the parent
    /// directory and lock file as needed.
    pub(crate) fn lock_exclusive(&self) -> Result<WriterLock, CatalogueError> {
        let lock_name = format!("{}.lock", self.file_name()?);
        let lock_path = self.parent().join(&lock_name);
        let dir = self.open_parent(true)?;

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(false);
        let file = dir
            .open_with(&lock_name, &options)
            .map_err(|err| io_error(&lock_path, &err))?
            .into_std();
        match file.try_lock() {
            Ok(()) => Ok(WriterLock { _file: file }),
            Err(TryLockError::WouldBlock) => Err(CatalogueError::Locked {
                path: self.path.clone(),
            }),
            Err(TryLockError::Error(err)) => Err(io_error(&lock_path, &err)),
        }
    }

    /// Reads the stored state, or `None` when no catalogue exists yet.
    pub(crate) fn load(&self) -> Result<Option<CatalogueState>, CatalogueError> {
        let file_name = self.file_name()?;
        if !self.parent().exists() {
            return Ok(None);
        }
        let dir = self.open_parent(false)?;

        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.path, &err)),
        };

        let snapshot: Snapshot =
            serde_json::from_str(&contents).map_err(|err| CatalogueError::Corrupt {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        if snapshot.version != FORMAT_VERSION {
            return Err(CatalogueError::Corrupt {
                path: self.path.clone(),
                message: format!("unsupported catalogue version {}", snapshot.version),
            });
        }
        Ok(Some(snapshot.into()))
    }

    /// Persists `state` atomically.
    pub(crate) fn save(&self, state: &CatalogueState) -> Result<(), CatalogueError> {
        let file_name = self.file_name()?;
        let tmp_name = format!("{file_name}.tmp");
        let dir = self.open_parent(true)?;

        let rendered = serde_json::to_string_pretty(&Snapshot::from(state)).map_err(|err| {
            CatalogueError::Storage {
                path: self.path.clone(),
                message: err.to_string(),
            }
        })?;

        dir.write(&tmp_name, rendered)
            .map_err(|err| io_error(&self.parent().join(&tmp_name), &err))?;
        dir.rename(&tmp_name, &dir, file_name)
            .map_err(|err| io_error(&self.path, &err))
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> CatalogueError {
    CatalogueError::Storage {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
