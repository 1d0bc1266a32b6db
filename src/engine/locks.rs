//! In-process per-job exclusion.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::model::JobId;

/// Set of jobs that currently hold a lease.
#[derive(Clone, Debug, Default)]
pub struct JobLocks {
    held: Arc<Mutex<HashSet<JobId>>>,
}

impl JobLocks {
    /// Creates an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the lease for `job`, or returns `None` if another holder has it.
    #[must_use]
    pub fn try_acquire(&self, job: JobId) -> Option<JobLease> {
        self.guard().insert(job).then(|| JobLease {
            job,
            locks: self.clone(),
        })
    }

    /// Returns `true` while `job` is leased.
    #[must_use]
    pub fn is_held(&self, job: JobId) -> bool {
        self.guard().contains(&job)
    }
}

/// Exclusive right to run one job. Released on drop.
#[derive(Debug)]
pub struct JobLease {
    job: JobId,
    locks: JobLocks,
}

impl JobLease {
    /// Job this lease covers.
    #[must_use]
    pub const fn job(&self) -> JobId {
        self.job
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.locks.guard().remove(&self.job);
    }
}
