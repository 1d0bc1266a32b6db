//! Cron-driven dispatch of enabled jobs.
//!
//! The scheduler keeps one armed entry per scheduled job holding the next
//! instant it should fire. Each [`Scheduler::tick`] reconciles the entries
//! with the current job list, fires every entry whose instant has passed,
//! and re-arms it from the current time. Fires missed while the service was
//! down are never replayed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::catalogue::Catalogue;
use crate::clock::Clock;
use crate::model::{JobId, RunId};
use crate::schedule::CronSchedule;

/// Default pause between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// A job the scheduler should consider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScheduledJob {
    /// Job identifier.
    pub job: JobId,
    /// Parsed schedule.
    pub schedule: CronSchedule,
}

/// Supplies the enabled, scheduled jobs.
pub trait JobSource: Send + Sync {
    /// Returns every job that is enabled and carries a schedule.
    fn scheduled_jobs(&self) -> Vec<ScheduledJob>;
}

impl JobSource for Catalogue {
    fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
        Self::scheduled_jobs(self)
            .into_iter()
            .filter_map(|job| {
                job.active_schedule().cloned().map(|schedule| ScheduledJob {
                    job: job.id,
                    schedule,
                })
            })
            .collect()
    }
}

impl<S: JobSource + ?Sized> JobSource for Arc<S> {
    fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
        (**self).scheduled_jobs()
    }
}

/// Result of handing a job to a [`Dispatcher`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// A new run was created.
    Started(RunId),
    /// The job already has an active run; nothing was started.
    Busy,
}

/// Starts runs without waiting for them to finish.
pub trait Dispatcher: Send + Sync {
    /// Error raised when a job cannot be dispatched.
    type Error: std::error::Error;

    /// Starts a run of `job`.
    ///
    /// # Errors
    ///
    /// Returns an implementation-defined error when the job cannot run.
    fn dispatch(&self, job: JobId) -> Result<DispatchOutcome, Self::Error>;
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    type Error = D::Error;

    fn dispatch(&self, job: JobId) -> Result<DispatchOutcome, Self::Error> {
        (**self).dispatch(job)
    }
}

/// What one tick did.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TickReport {
    /// Jobs armed for the first time or after a schedule change.
    pub armed: Vec<JobId>,
    /// Jobs that started a run, with the run id.
    pub fired: Vec<(JobId, RunId)>,
    /// Jobs skipped because a run was already active.
    pub busy: Vec<JobId>,
    /// Jobs whose dispatch failed, with the error text.
    pub failed: Vec<(JobId, String)>,
    /// Jobs dropped because they were disabled, unscheduled, or removed.
    pub forgotten: Vec<JobId>,
}

#[derive(Clone, Debug)]
struct Armed {
    schedule: CronSchedule,
    next: Option<DateTime<Utc>>,
}

/// Periodic evaluator of job schedules.
#[derive(Debug)]
pub struct Scheduler<S, D, C> {
    source: S,
    dispatcher: D,
    clock: C,
    interval: Duration,
    entries: BTreeMap<JobId, Armed>,
}

impl<S, D, C> Scheduler<S, D, C>
where
    S: JobSource,
    D: Dispatcher,
    C: Clock,
{
    /// Creates a scheduler with no armed jobs.
    #[must_use]
    pub const fn new(source: S, dispatcher: D, clock: C, interval: Duration) -> Self {
        Self {
            source,
            dispatcher,
            clock,
            interval,
            entries: BTreeMap::new(),
        }
    }

    /// Pause between ticks in [`Scheduler::run`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Next fire time of `job`, if it is armed and can still fire.
    #[must_use]
    pub fn next_fire(&self, job: JobId) -> Option<DateTime<Utc>> {
        self.entries.get(&job).and_then(|entry| entry.next)
    }

    /// Reconciles armed entries with the job source and fires due jobs.
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();
        let current: BTreeMap<JobId, CronSchedule> = self
            .source
            .scheduled_jobs()
            .into_iter()
            .map(|scheduled| (scheduled.job, scheduled.schedule))
            .collect();

        self.entries.retain(|job, _| {
            let keep = current.contains_key(job);
            if !keep {
                debug!(job_id = %job, "job no longer scheduled");
                report.forgotten.push(*job);
            }
            keep
        });

        for (job, schedule) in current {
            let unchanged = self
                .entries
                .get(&job)
                .is_some_and(|entry| entry.schedule == schedule);
            if unchanged {
                continue;
            }
            let next = schedule.next_after(now);
            debug!(job_id = %job, schedule = %schedule, next = ?next, "armed job");
            self.entries.insert(job, Armed { schedule, next });
            report.armed.push(job);
        }

        for (job, entry) in &mut self.entries {
            if !entry.next.is_some_and(|due| due <= now) {
                continue;
            }
            match self.dispatcher.dispatch(*job) {
                Ok(DispatchOutcome::Started(run)) => {
                    info!(job_id = %job, run_id = %run, "scheduled run dispatched");
                    report.fired.push((*job, run));
                }
                Ok(DispatchOutcome::Busy) => {
                    warn!(job_id = %job, "skipped scheduled run: job already running");
                    report.busy.push(*job);
                }
                Err(err) => {
                    warn!(job_id = %job, error = %err, "scheduled dispatch failed");
                    report.failed.push((*job, err.to_string()));
                }
            }
            entry.next = entry.schedule.next_after(now);
        }
        report
    }

    /// Ticks every [`Scheduler::interval`] until `shutdown` becomes `true`
    /// or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let report = run_blocking(|| self.tick());
                    debug!(fired = report.fired.len(), busy = report.busy.len(), "scheduler tick");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

/// Runs catalogue work that touches the disk from async code. On a
/// multi-threaded runtime the worker hands its other tasks to a fresh thread
/// for the duration; a current-thread runtime has nowhere to hand them, so
/// the work runs in place.
pub(crate) fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

#[cfg(test)]
mod tests;
