//! In-memory catalogue tables.

use std::collections::BTreeMap;

use crate::model::{Client, ClientId, Job, JobId, Run, RunId};

use super::CatalogueError;

#[derive(Clone, Debug)]
pub(crate) struct CatalogueState {
    pub(crate) next_client_id: ClientId,
    pub(crate) next_job_id: JobId,
    pub(crate) next_run_id: RunId,
    pub(crate) clients: BTreeMap<ClientId, Client>,
    pub(crate) jobs: BTreeMap<JobId, Job>,
    pub(crate) runs: BTreeMap<RunId, Run>,
}

impl Default for CatalogueState {
    fn default() -> Self {
        Self {
            next_client_id: ClientId::new(1),
            next_job_id: JobId::new(1),
            next_run_id: RunId::new(1),
            clients: BTreeMap::new(),
            jobs: BTreeMap::new(),
            runs: BTreeMap::new(),
        }
    }
}

impl CatalogueState {
    pub(crate) fn allocate_client_id(&mut self) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id = id.next();
        id
    }

    pub(crate) fn allocate_job_id(&mut self) -> JobId {
        let id = self.next_job_id;
        self.next_job_id = id.next();
        id
    }

    pub(crate) fn allocate_run_id(&mut self) -> RunId {
        let id = self.next_run_id;
        self.next_run_id = id.next();
        id
    }

    pub(crate) fn client(&self, id: ClientId) -> Result<&Client, CatalogueError> {
        self.clients
            .get(&id)
            .ok_or(CatalogueError::ClientNotFound { id })
    }

    pub(crate) fn job(&self, id: JobId) -> Result<&Job, CatalogueError> {
        self.jobs.get(&id).ok_or(CatalogueError::JobNotFound { id })
    }

    pub(crate) fn run(&self, id: RunId) -> Result<&Run, CatalogueError> {
        self.runs.get(&id).ok_or(CatalogueError::RunNotFound { id })
    }

    /// Resolves a job's client, failing with a referential error when the
    /// client has been deleted.
    pub(crate) fn owning_client(&self, job: &Job) -> Result<&Client, CatalogueError> {
        self.clients
            .get(&job.client_id)
            .ok_or(CatalogueError::Referential {
                job: job.id,
                client: job.client_id,
            })
    }

    pub(crate) fn active_run(&self, job: JobId) -> Option<&Run> {
        self.runs
            .values()
            .find(|run| run.job_id == job && run.is_active())
    }

    /// Runs of `job`, newest first.
    pub(crate) fn runs_for(&self, job: JobId) -> impl Iterator<Item = &Run> {
        self.runs.values().rev().filter(move |run| run.job_id == job)
    }
}
