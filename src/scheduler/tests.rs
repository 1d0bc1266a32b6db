//! Unit tests for schedule reconciliation and dispatch.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::{TimeDelta, TimeZone};
use rstest::{fixture, rstest};
use thiserror::Error;

use super::*;
use crate::clock::ManualClock;
use crate::test_support::reference_time;

#[derive(Clone, Debug, Default)]
struct FakeSource {
    jobs: Arc<Mutex<Vec<ScheduledJob>>>,
}

impl FakeSource {
    fn set(&self, jobs: &[(u64, &str)]) {
        let parsed = jobs
            .iter()
            .map(|(id, expression)| ScheduledJob {
                job: JobId::new(*id),
                schedule: CronSchedule::parse(expression).expect("valid schedule"),
            })
            .collect();
        *self.jobs.lock().unwrap_or_else(PoisonError::into_inner) = parsed;
    }
}

impl JobSource for FakeSource {
    fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Error)]
#[error("dispatcher unavailable")]
struct Unavailable;

#[derive(Clone, Copy, Debug, Default)]
enum Mode {
    #[default]
    Start,
    Busy,
    Fail,
}

#[derive(Clone, Debug, Default)]
struct FakeDispatcher {
    mode: Arc<Mutex<Mode>>,
    calls: Arc<Mutex<Vec<JobId>>>,
}

impl FakeDispatcher {
    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn calls(&self) -> Vec<JobId> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Dispatcher for FakeDispatcher {
    type Error = Unavailable;

    fn dispatch(&self, job: JobId) -> Result<DispatchOutcome, Self::Error> {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.push(job);
        let run = RunId::new(u64::try_from(calls.len()).unwrap_or_default());
        match *self.mode.lock().unwrap_or_else(PoisonError::into_inner) {
            Mode::Start => Ok(DispatchOutcome::Started(run)),
            Mode::Busy => Ok(DispatchOutcome::Busy),
            Mode::Fail => Err(Unavailable),
        }
    }
}

/// Dispatcher that holds the calling thread until released from another
/// task, recording whether each call was released in time.
#[derive(Clone, Debug, Default)]
struct HeldDispatcher {
    state: Arc<(Mutex<(bool, bool)>, Condvar)>,
    outcomes: Arc<Mutex<Vec<bool>>>,
}

impl HeldDispatcher {
    fn entered(&self) -> bool {
        self.state.0.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn release(&self) {
        let (lock, signal) = &*self.state;
        lock.lock().unwrap_or_else(PoisonError::into_inner).1 = true;
        signal.notify_all();
    }

    fn outcomes(&self) -> Vec<bool> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Dispatcher for HeldDispatcher {
    type Error = Unavailable;

    fn dispatch(&self, _job: JobId) -> Result<DispatchOutcome, Self::Error> {
        let (lock, signal) = &*self.state;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        guard.0 = true;
        let (waited, _) = signal
            .wait_timeout_while(guard, Duration::from_secs(2), |state| !state.1)
            .unwrap_or_else(PoisonError::into_inner);
        let released = waited.1;
        drop(waited);
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(released);
        if released {
            Ok(DispatchOutcome::Started(RunId::new(1)))
        } else {
            Err(Unavailable)
        }
    }
}

struct Harness {
    source: FakeSource,
    dispatcher: FakeDispatcher,
    clock: ManualClock,
    scheduler: Scheduler<FakeSource, FakeDispatcher, ManualClock>,
}

#[fixture]
fn harness() -> Harness {
    let source = FakeSource::default();
    let dispatcher = FakeDispatcher::default();
    let clock = ManualClock::new(reference_time());
    let scheduler = Scheduler::new(
        source.clone(),
        dispatcher.clone(),
        clock.clone(),
        Duration::from_millis(5),
    );
    Harness {
        source,
        dispatcher,
        clock,
        scheduler,
    }
}

fn at(hour: u32, minute: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, day, hour, minute, 0)
        .single()
        .expect("valid instant")
}

#[rstest]
fn first_tick_arms_without_firing_even_on_a_matching_minute(mut harness: Harness) {
    harness.source.set(&[(1, "30 1 * * *")]);

    let report = harness.scheduler.tick();

    assert_eq!(report.armed, vec![JobId::new(1)]);
    assert!(report.fired.is_empty());
    assert_eq!(harness.scheduler.next_fire(JobId::new(1)), Some(at(1, 30, 2)));
}

#[rstest]
fn due_jobs_fire_once_and_rearm_from_now(mut harness: Harness) {
    harness.source.set(&[(1, "31 1 * * *")]);
    harness.scheduler.tick();

    harness.clock.advance(TimeDelta::minutes(1));
    let report = harness.scheduler.tick();

    assert_eq!(report.fired, vec![(JobId::new(1), RunId::new(1))]);
    assert_eq!(harness.scheduler.next_fire(JobId::new(1)), Some(at(1, 31, 2)));

    let quiet = harness.scheduler.tick();
    assert!(quiet.fired.is_empty());
    assert_eq!(harness.dispatcher.calls().len(), 1);
}

#[rstest]
fn missed_fires_are_not_replayed(mut harness: Harness) {
    harness.source.set(&[(1, "31 1 * * *")]);
    harness.scheduler.tick();

    harness.clock.advance(TimeDelta::days(3));
    let report = harness.scheduler.tick();

    assert_eq!(report.fired.len(), 1);
    assert_eq!(harness.scheduler.next_fire(JobId::new(1)), Some(at(1, 31, 5)));
}

#[rstest]
fn busy_jobs_are_skipped_and_rearmed(mut harness: Harness) {
    harness.source.set(&[(2, "31 1 * * *")]);
    harness.scheduler.tick();
    harness.dispatcher.set_mode(Mode::Busy);

    harness.clock.advance(TimeDelta::minutes(1));
    let report = harness.scheduler.tick();

    assert_eq!(report.busy, vec![JobId::new(2)]);
    assert!(report.fired.is_empty());
    assert_eq!(harness.scheduler.next_fire(JobId::new(2)), Some(at(1, 31, 2)));
}

#[rstest]
fn dispatch_errors_are_reported(mut harness: Harness) {
    harness.source.set(&[(3, "31 1 * * *")]);
    harness.scheduler.tick();
    harness.dispatcher.set_mode(Mode::Fail);

    harness.clock.advance(TimeDelta::minutes(1));
    let report = harness.scheduler.tick();

    assert_eq!(
        report.failed,
        vec![(JobId::new(3), String::from("dispatcher unavailable"))]
    );
}

#[rstest]
fn removed_jobs_are_forgotten_and_changed_schedules_rearm(mut harness: Harness) {
    harness.source.set(&[(1, "0 2 * * *"), (2, "0 3 * * *")]);
    harness.scheduler.tick();

    harness.source.set(&[(1, "45 1 * * *")]);
    let report = harness.scheduler.tick();

    assert_eq!(report.forgotten, vec![JobId::new(2)]);
    assert_eq!(report.armed, vec![JobId::new(1)]);
    assert_eq!(harness.scheduler.next_fire(JobId::new(1)), Some(at(1, 45, 1)));
    assert_eq!(harness.scheduler.next_fire(JobId::new(2)), None);
}

#[rstest]
fn catalogue_source_lists_only_enabled_scheduled_jobs() {
    use crate::model::{AuthMethod, NewClient, NewJob};

    let catalogue = Catalogue::in_memory();
    let client = catalogue
        .add_client(
            NewClient {
                name: String::from("web"),
                host: String::from("web.example.test"),
                port: None,
                username: String::from("backup"),
                auth: AuthMethod::Key {
                    key_path: camino::Utf8PathBuf::from("/keys/id"),
                },
                elevated: false,
            },
            reference_time(),
        )
        .expect("client");
    let job = |name: &str, schedule: Option<&str>, enabled: bool| NewJob {
        name: name.to_owned(),
        client_id: client.id,
        source_path: camino::Utf8PathBuf::from("/var/www"),
        schedule: schedule.map(|text| CronSchedule::parse(text).expect("schedule")),
        enabled,
    };
    let nightly = catalogue
        .add_job(job("nightly", Some("0 2 * * *"), true), reference_time())
        .expect("job");
    catalogue
        .add_job(job("paused", Some("0 3 * * *"), false), reference_time())
        .expect("job");
    catalogue
        .add_job(job("manual", None, true), reference_time())
        .expect("job");

    let listed = JobSource::scheduled_jobs(&catalogue);

    assert_eq!(listed.len(), 1);
    assert_eq!(listed.first().map(|entry| entry.job), Some(nightly.id));
}

#[rstest]
#[tokio::test]
async fn run_loop_stops_on_shutdown(mut harness: Harness) {
    harness.source.set(&[(1, "0 2 * * *")]);
    let (stop, shutdown) = watch::channel(false);

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.send(true).expect("scheduler listening");
    });
    tokio::time::timeout(Duration::from_secs(5), harness.scheduler.run(shutdown))
        .await
        .expect("scheduler should stop");
    stopper.await.expect("stopper task");

    assert_eq!(harness.scheduler.next_fire(JobId::new(1)), Some(at(2, 0, 1)));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn slow_ticks_leave_the_worker_free_for_other_tasks() {
    let source = FakeSource::default();
    source.set(&[(1, "0 2 * * *")]);
    let dispatcher = HeldDispatcher::default();
    let clock = ManualClock::new(reference_time());
    let mut scheduler = Scheduler::new(
        source,
        dispatcher.clone(),
        clock.clone(),
        Duration::from_millis(5),
    );
    scheduler.tick();
    clock.advance(TimeDelta::days(1));
    let (stop, shutdown) = watch::channel(false);

    let looping = tokio::spawn(async move { scheduler.run(shutdown).await });
    let releaser = dispatcher.clone();
    let helper = tokio::spawn(async move {
        while !releaser.entered() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        releaser.release();
    });
    helper.await.expect("helper task");
    stop.send(true).expect("scheduler listening");
    tokio::time::timeout(Duration::from_secs(5), looping)
        .await
        .expect("scheduler should stop")
        .expect("scheduler task");

    assert_eq!(dispatcher.outcomes(), vec![true]);
}
