// Runner passes: due selection, timeouts, failures, orphans, alerts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use durable_core::config::{AlertsConfig, DurableJobsConfig};
use durable_jobs::{
    job_fn, AlertNotifier, DurableJobError, DurableJobRunner, FailureAlert, JobFactory,
    JobRegistry, JobState, JobStore, JobType, ManualClock, NewJob, PersistedJob, RunnerKind,
    SqliteJobStore,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 12, 7, 10, 15, 30).unwrap()
}

fn config() -> DurableJobsConfig {
    DurableJobsConfig::default()
}

fn insert(
    store: &SqliteJobStore,
    name: &str,
    job_type: JobType,
    execution_time: DateTime<Utc>,
    remaining_attempts: u32,
) -> PersistedJob {
    store
        .insert_pending(&NewJob {
            job_name: name.to_string(),
            job_type,
            execution_time,
            creation_time: execution_time - Duration::hours(1),
            remaining_attempts,
        })
        .unwrap()
}

fn counting(counter: &Arc<AtomicUsize>) -> JobFactory {
    let counter = Arc::clone(counter);
    job_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

struct Fixture {
    store: Arc<SqliteJobStore>,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(SqliteJobStore::open_in_memory().unwrap()),
            clock: Arc::new(ManualClock::new(now())),
        }
    }

    fn periodic(&self, registry: JobRegistry) -> DurableJobRunner {
        DurableJobRunner::periodic(
            Arc::new(registry),
            self.store.clone(),
            self.clock.clone(),
            &config(),
        )
    }

    fn startup(&self, registry: JobRegistry) -> DurableJobRunner {
        DurableJobRunner::startup(
            Arc::new(registry),
            self.store.clone(),
            self.clock.clone(),
            &config(),
        )
    }

    fn reload(&self, job: &PersistedJob) -> PersistedJob {
        self.store.get(job.id).unwrap().expect("row exists")
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<FailureAlert>>,
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, alert: &FailureAlert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

fn alerts_config() -> AlertsConfig {
    AlertsConfig {
        base_url: "https://forms.example.gov".into(),
        it_email_address: "it@example.gov".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn only_past_due_rows_run() {
    let fx = Fixture::new();
    let past = insert(&fx.store, "report", JobType::Recurring, now() - Duration::minutes(5), 3);
    let mut registry = JobRegistry::new();
    let counter = Arc::new(AtomicUsize::new(0));
    registry.register("report", counting(&counter)).unwrap();
    registry.register("later", counting(&counter)).unwrap();
    let future = insert(&fx.store, "later", JobType::Recurring, now() + Duration::minutes(5), 3);

    let summary = fx.periodic(registry).run_jobs().await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(fx.reload(&past).success_time, Some(now()));
    assert_eq!(fx.reload(&past).remaining_attempts, 3);
    assert_eq!(fx.reload(&future).state(), JobState::Scheduled);
}

#[tokio::test]
async fn succeeded_row_is_never_rerun() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "report", JobType::Recurring, now(), 3);
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry.register("report", counting(&counter)).unwrap();
    let runner = fx.periodic(registry);

    runner.run_jobs().await.unwrap();
    fx.clock.advance(Duration::days(1));
    let second = runner.run_jobs().await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(second.executed(), 0);
    assert_eq!(fx.reload(&row).state(), JobState::Succeeded);
    assert_eq!(fx.reload(&row).success_time, Some(now()));
}

#[tokio::test]
async fn overrunning_job_times_out_and_loses_an_attempt() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "slow", JobType::Recurring, now(), 3);
    let mut registry = JobRegistry::new();
    registry
        .register(
            "slow",
            job_fn(|_| {
                std::thread::sleep(StdDuration::from_millis(300));
                Ok(())
            }),
        )
        .unwrap();

    let runner = fx
        .periodic(registry)
        .with_job_timeout(StdDuration::from_millis(50));
    let summary = runner.run_jobs().await.unwrap();

    assert_eq!(summary.timed_out, 1);
    let row = fx.reload(&row);
    assert_eq!(row.remaining_attempts, 2);
    assert!(row.success_time.is_none());
    assert_eq!(row.state(), JobState::FailedRetryable);
    let message = row.error_message.expect("timeout recorded");
    assert!(message.contains("JobRunner_JobTimeout"), "{message}");
    assert!(message.contains("job_name=\"slow\""), "{message}");
}

#[tokio::test]
async fn failing_job_records_failure_and_stops_at_zero() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "flaky", JobType::Recurring, now(), 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let mut registry = JobRegistry::new();
    registry
        .register(
            "flaky",
            job_fn(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("upstream unavailable")
            }),
        )
        .unwrap();
    let runner = fx.periodic(registry);

    let summary = runner.run_jobs().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exhausted, 1);

    let reloaded = fx.reload(&row);
    assert_eq!(reloaded.remaining_attempts, 0);
    let message = reloaded.error_message.clone().unwrap();
    assert!(message.contains("JobRunner_JobFailed"), "{message}");
    assert!(message.contains("upstream unavailable"), "{message}");
    assert_eq!(reloaded.state(), JobState::FailedTerminal);

    // Out of attempts: no longer eligible.
    runner.run_jobs().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retryable_failure_runs_again_next_pass() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "flaky", JobType::Recurring, now(), 3);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let mut registry = JobRegistry::new();
    registry
        .register(
            "flaky",
            job_fn(move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first try fails");
                }
                Ok(())
            }),
        )
        .unwrap();
    let runner = fx.periodic(registry);

    assert_eq!(runner.run_jobs().await.unwrap().failed, 1);
    assert_eq!(runner.run_jobs().await.unwrap().succeeded, 1);

    let row = fx.reload(&row);
    assert_eq!(row.remaining_attempts, 2);
    assert!(row.success_time.is_some());
    // The failure report stays for inspection.
    assert!(row.error_message.unwrap().contains("first try fails"));
}

#[tokio::test]
async fn panicking_job_counts_as_failure() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "panics", JobType::Recurring, now(), 3);
    let mut registry = JobRegistry::new();
    registry
        .register("panics", job_fn(|_| panic!("index out of range")))
        .unwrap();

    let summary = fx.periodic(registry).run_jobs().await.unwrap();

    assert_eq!(summary.failed, 1);
    let row = fx.reload(&row);
    assert_eq!(row.remaining_attempts, 2);
    let message = row.error_message.unwrap();
    assert!(message.contains("JobRunner_JobFailed"), "{message}");
    assert!(message.contains("index out of range"), "{message}");
}

#[tokio::test]
async fn orphan_rows_are_deleted_without_error() {
    let fx = Fixture::new();
    let orphan = insert(&fx.store, "removed_in_last_deploy", JobType::Recurring, now(), 3);
    let kept = insert(&fx.store, "report", JobType::Recurring, now(), 3);
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry.register("report", counting(&counter)).unwrap();

    let summary = fx.periodic(registry).run_jobs().await.unwrap();

    assert_eq!(summary.orphaned, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(fx.store.get(orphan.id).unwrap().is_none());
    assert!(fx.reload(&kept).has_succeeded());
}

#[tokio::test]
async fn one_failure_does_not_block_the_rest() {
    let fx = Fixture::new();
    let broken = insert(&fx.store, "broken", JobType::Recurring, now() - Duration::minutes(2), 3);
    let healthy = insert(&fx.store, "healthy", JobType::Recurring, now() - Duration::minutes(1), 3);
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry
        .register("broken", job_fn(|_| anyhow::bail!("disk full")))
        .unwrap();
    registry.register("healthy", counting(&counter)).unwrap();

    let summary = fx.periodic(registry).run_jobs().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fx.reload(&broken).state(), JobState::FailedRetryable);
    assert!(fx.reload(&healthy).has_succeeded());
}

#[tokio::test]
async fn startup_runner_only_takes_run_once_rows() {
    let fx = Fixture::new();
    let once = insert(&fx.store, "seed_defaults", JobType::RunOnce, now(), 3);
    let recurring = insert(&fx.store, "report", JobType::Recurring, now(), 3);
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry
        .register_startup_job("seed_defaults", JobType::RunOnce, counting(&counter))
        .unwrap();
    registry.register("report", counting(&counter)).unwrap();

    let runner = fx.startup(registry);
    assert_eq!(runner.kind(), RunnerKind::Startup);
    let summary = runner.run_jobs().await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(fx.reload(&once).has_succeeded());
    assert!(!fx.reload(&recurring).has_succeeded());
}

#[tokio::test]
async fn startup_runner_alerts_on_final_failure() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "migrate", JobType::RunOnce, now(), 1);
    let mut registry = JobRegistry::new();
    registry
        .register_startup_job(
            "migrate",
            JobType::RunOnce,
            job_fn(|_| anyhow::bail!("constraint violated")),
        )
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = fx
        .startup(registry)
        .with_alerts(alerts_config(), notifier.clone())
        .run_jobs()
        .await
        .unwrap();

    assert_eq!(summary.exhausted, 1);
    let alerts = notifier.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.recipient, "it@example.gov");
    assert_eq!(alert.subject, "ERROR: Durable job failure on forms.example.gov");
    assert_eq!(alert.job_id, row.id);
    assert!(alert.body.contains("constraint violated"));
}

#[tokio::test]
async fn startup_runner_does_not_alert_while_attempts_remain() {
    let fx = Fixture::new();
    insert(&fx.store, "migrate", JobType::RunOnce, now(), 2);
    let mut registry = JobRegistry::new();
    registry
        .register_startup_job("migrate", JobType::RunOnce, job_fn(|_| anyhow::bail!("nope")))
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());

    fx.startup(registry)
        .with_alerts(alerts_config(), notifier.clone())
        .run_jobs()
        .await
        .unwrap();

    assert!(notifier.alerts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn periodic_runner_never_alerts() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "report", JobType::Recurring, now(), 1);
    let mut registry = JobRegistry::new();
    registry
        .register("report", job_fn(|_| anyhow::bail!("boom")))
        .unwrap();
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = fx
        .periodic(registry)
        .with_alerts(alerts_config(), notifier.clone())
        .run_jobs()
        .await
        .unwrap();

    assert_eq!(summary.exhausted, 1);
    assert!(fx.reload(&row).has_failed_with_no_remaining_attempts());
    assert!(notifier.alerts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn factory_receives_the_persisted_row() {
    let fx = Fixture::new();
    let row = insert(&fx.store, "report", JobType::Recurring, now(), 3);
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let mut registry = JobRegistry::new();
    registry
        .register(
            "report",
            job_fn(move |job| {
                *sink.lock().unwrap() = Some(job.clone());
                Ok(())
            }),
        )
        .unwrap();

    fx.periodic(registry).run_jobs().await.unwrap();

    let seen = seen.lock().unwrap().clone().expect("job ran");
    assert_eq!(seen.id, row.id);
    assert_eq!(seen.job_name, "report");
    assert_eq!(seen.execution_time, row.execution_time);
}

/// What another process did to a row between our poll and our re-read.
#[derive(Clone, Copy)]
enum Interference {
    SucceededElsewhere,
    DeletedElsewhere,
    DeleteFails,
}

struct InterferingStore {
    inner: SqliteJobStore,
    interference: Interference,
}

impl JobStore for InterferingStore {
    fn find_pending(
        &self,
        name: &str,
        job_type: JobType,
    ) -> durable_jobs::Result<Option<PersistedJob>> {
        self.inner.find_pending(name, job_type)
    }

    fn insert_pending(&self, new: &NewJob) -> durable_jobs::Result<PersistedJob> {
        self.inner.insert_pending(new)
    }

    fn due_jobs(
        &self,
        now: DateTime<Utc>,
        job_type: Option<JobType>,
    ) -> durable_jobs::Result<Vec<PersistedJob>> {
        self.inner.due_jobs(now, job_type)
    }

    fn get(&self, id: i64) -> durable_jobs::Result<Option<PersistedJob>> {
        let current = self.inner.get(id)?;
        Ok(match self.interference {
            Interference::SucceededElsewhere => current.map(|mut job| {
                job.success_time = Some(job.execution_time);
                job
            }),
            Interference::DeletedElsewhere => None,
            Interference::DeleteFails => current,
        })
    }

    fn update(&self, job: &PersistedJob) -> durable_jobs::Result<()> {
        self.inner.update(job)
    }

    fn delete(&self, id: i64) -> durable_jobs::Result<bool> {
        match self.interference {
            Interference::DeleteFails => {
                Err(DurableJobError::Database(rusqlite::Error::InvalidQuery))
            }
            _ => self.inner.delete(id),
        }
    }

    fn list(&self) -> durable_jobs::Result<Vec<PersistedJob>> {
        self.inner.list()
    }

    fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> durable_jobs::Result<usize> {
        self.inner.purge_succeeded_before(cutoff)
    }
}

fn interfering_runner(
    interference: Interference,
    registry: JobRegistry,
) -> (Arc<InterferingStore>, DurableJobRunner) {
    let store = Arc::new(InterferingStore {
        inner: SqliteJobStore::open_in_memory().unwrap(),
        interference,
    });
    let runner = DurableJobRunner::periodic(
        Arc::new(registry),
        store.clone(),
        Arc::new(ManualClock::new(now())),
        &config(),
    );
    (store, runner)
}

#[tokio::test]
async fn row_finished_by_another_runner_is_skipped() {
    for interference in [Interference::SucceededElsewhere, Interference::DeletedElsewhere] {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();
        registry.register("report", counting(&counter)).unwrap();
        let (store, runner) = interfering_runner(interference, registry);
        let row = insert(&store.inner, "report", JobType::Recurring, now(), 3);

        let summary = runner.run_jobs().await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.executed(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let stored = store.inner.get(row.id).unwrap().unwrap();
        assert_eq!(stored, row);
    }
}

#[tokio::test]
async fn failed_orphan_delete_is_recorded_on_the_row() {
    let (store, runner) = interfering_runner(Interference::DeleteFails, JobRegistry::new());
    let orphan = insert(&store.inner, "removed_in_last_deploy", JobType::Recurring, now(), 3);

    let summary = runner.run_jobs().await.unwrap();

    assert_eq!(summary.store_errors, 1);
    assert_eq!(summary.orphaned, 0);
    let row = store.inner.get(orphan.id).unwrap().expect("row kept");
    assert_eq!(row.remaining_attempts, 3);
    let message = row.error_message.expect("delete failure recorded");
    assert!(
        message.contains("there was an error deleting the job"),
        "{message}"
    );
    assert!(
        message.contains("job_name=\"removed_in_last_deploy\""),
        "{message}"
    );
}
