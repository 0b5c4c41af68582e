use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use durable_core::config::{AlertsConfig, DurableJobsConfig};

use crate::alert::{AlertNotifier, FailureAlert};
use crate::clock::Clock;
use crate::error::Result;
use crate::registry::JobRegistry;
use crate::store::JobStore;
use crate::types::{JobType, PersistedJob};

/// Which rows a runner picks up and whether it raises alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// Driven by the worker loop; runs every due row and only records state.
    Periodic,
    /// Runs once at process start over due run-once rows and alerts when an
    /// occurrence runs out of attempts.
    Startup,
}

/// Counts for one `run_jobs` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Rows deleted because their job is no longer registered.
    pub orphaned: usize,
    /// Rows another runner finished or removed since the poll.
    pub skipped: usize,
    /// Failures that used the last remaining attempt.
    pub exhausted: usize,
    /// Rows whose bookkeeping could not be read or written.
    pub store_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Succeeded,
    Failed { exhausted: bool },
    TimedOut { exhausted: bool },
    Orphaned,
    Skipped,
    StoreError,
}

impl RunSummary {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Succeeded => self.succeeded += 1,
            RowOutcome::Failed { exhausted } => {
                self.failed += 1;
                self.exhausted += usize::from(exhausted);
            }
            RowOutcome::TimedOut { exhausted } => {
                self.timed_out += 1;
                self.exhausted += usize::from(exhausted);
            }
            RowOutcome::Orphaned => self.orphaned += 1,
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::StoreError => self.store_errors += 1,
        }
    }

    /// Rows that actually executed a job body.
    pub fn executed(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Executes due occurrences and writes their outcome back to the store.
///
/// Each job runs on a blocking worker thread under `job_timeout`. A job that
/// overruns is recorded as timed out and its thread is abandoned, not
/// stopped, so the same occurrence may run again while the old thread is
/// still busy. Runners on different replicas may also pick up the same row.
/// Job bodies must therefore be idempotent.
pub struct DurableJobRunner {
    kind: RunnerKind,
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    job_timeout: Duration,
    alerts: Option<(AlertsConfig, Arc<dyn AlertNotifier>)>,
    // Serializes passes within this process.
    pass_lock: Mutex<()>,
}

impl DurableJobRunner {
    pub fn periodic(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &DurableJobsConfig,
    ) -> Self {
        Self::new(RunnerKind::Periodic, registry, store, clock, config)
    }

    pub fn startup(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &DurableJobsConfig,
    ) -> Self {
        Self::new(RunnerKind::Startup, registry, store, clock, config)
    }

    fn new(
        kind: RunnerKind,
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &DurableJobsConfig,
    ) -> Self {
        Self {
            kind,
            registry,
            store,
            clock,
            job_timeout: config.job_timeout(),
            alerts: None,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Alert target for exhausted occurrences. Only startup runners alert;
    /// a periodic runner keeps the notifier unused.
    pub fn with_alerts(mut self, config: AlertsConfig, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.alerts = Some((config, notifier));
        self
    }

    pub fn kind(&self) -> RunnerKind {
        self.kind
    }

    /// Execute every due occurrence once.
    ///
    /// Only a failure to query the due rows is returned as an error. Job
    /// failures, timeouts, orphans and per-row store errors are recorded and
    /// counted in the summary; one row never prevents the others from running.
    #[instrument(skip(self), fields(kind = ?self.kind, pass_id = %Uuid::new_v4()))]
    pub async fn run_jobs(&self) -> Result<RunSummary> {
        let _pass = self.pass_lock.lock().await;
        info!("JobRunner_Start");

        let job_type = match self.kind {
            RunnerKind::Periodic => None,
            RunnerKind::Startup => Some(JobType::RunOnce),
        };
        let due = self.store.due_jobs(self.clock.now(), job_type)?;
        debug!(count = due.len(), "due jobs selected");

        let mut summary = RunSummary::default();
        for job in due {
            let outcome = self.run_row(job).await;
            summary.record(outcome);
        }

        info!(?summary, "JobRunner_Stop");
        Ok(summary)
    }

    async fn run_row(&self, polled: PersistedJob) -> RowOutcome {
        // Another runner may have finished or removed the row since the poll.
        let mut job = match self.store.get(polled.id) {
            Ok(Some(current)) if current.is_eligible(self.clock.now()) => current,
            Ok(_) => {
                debug!(job_id = polled.id, job_name = %polled.job_name, "no longer eligible, skipping");
                return RowOutcome::Skipped;
            }
            Err(e) => {
                error!(job_id = polled.id, job_name = %polled.job_name, "failed to reload job: {e}");
                return RowOutcome::StoreError;
            }
        };

        let factory = match self.registry.get(&job.job_name) {
            Ok(registered) => Arc::clone(&registered.factory),
            Err(_) => return self.remove_orphan(job),
        };

        let started = Instant::now();
        let instance = factory(job.clone());
        info!(
            job_name = %job.job_name,
            job_id = instance.persisted_job().id,
            "JobRunner_ExecutingJob"
        );

        let execution = tokio::task::spawn_blocking(move || instance.run());
        let outcome = match tokio::time::timeout(self.job_timeout, execution).await {
            Ok(Ok(Ok(()))) => {
                job.success_time = Some(self.clock.now());
                info!(
                    job_name = %job.job_name,
                    job_id = job.id,
                    duration_s = started.elapsed().as_secs_f64(),
                    "JobRunner_JobSucceeded"
                );
                RowOutcome::Succeeded
            }
            Ok(Ok(Err(e))) => {
                self.record_failure(&mut job, started, "JobRunner_JobFailed", &format!("{e:#}"));
                RowOutcome::Failed {
                    exhausted: job.has_failed_with_no_remaining_attempts(),
                }
            }
            Ok(Err(join_err)) => {
                let message = panic_message(join_err);
                self.record_failure(&mut job, started, "JobRunner_JobFailed", &message);
                RowOutcome::Failed {
                    exhausted: job.has_failed_with_no_remaining_attempts(),
                }
            }
            Err(_elapsed) => {
                // The blocking task keeps running; dropping its handle detaches it.
                self.record_failure(&mut job, started, "JobRunner_JobTimeout", "");
                RowOutcome::TimedOut {
                    exhausted: job.has_failed_with_no_remaining_attempts(),
                }
            }
        };

        if let Err(e) = self.store.update(&job) {
            error!(job_id = job.id, job_name = %job.job_name, "failed to record job outcome: {e}");
            return RowOutcome::StoreError;
        }

        if job.has_failed_with_no_remaining_attempts() {
            self.notify_final_failure(&job).await;
        }
        outcome
    }

    fn record_failure(&self, job: &mut PersistedJob, started: Instant, marker: &str, detail: &str) {
        job.decrement_remaining_attempts();
        let mut message = format!(
            "{marker} job_name=\"{}\", job_ID={}, attempts_remaining={}, duration_s={:.3}",
            job.job_name,
            job.id,
            job.remaining_attempts,
            started.elapsed().as_secs_f64(),
        );
        if !detail.is_empty() {
            message.push_str(", message: ");
            message.push_str(detail);
        }
        error!("{message}");
        job.append_error_message(&message);
    }

    fn remove_orphan(&self, mut job: PersistedJob) -> RowOutcome {
        match self.store.delete(job.id) {
            Ok(true) => {
                info!(
                    job_name = %job.job_name,
                    job_id = job.id,
                    "Job was not found in the registry and was deleted from the db"
                );
                RowOutcome::Orphaned
            }
            Ok(false) => RowOutcome::Skipped,
            Err(e) => {
                let message = format!(
                    "Job was not found in the registry and there was an error deleting the job. \
                     job_name=\"{}\", job_ID={}, attempts_remaining={}, message: {e}",
                    job.job_name, job.id, job.remaining_attempts,
                );
                error!("{message}");
                job.append_error_message(&message);
                if let Err(e) = self.store.update(&job) {
                    error!(job_id = job.id, "failed to record orphan cleanup error: {e}");
                }
                RowOutcome::StoreError
            }
        }
    }

    async fn notify_final_failure(&self, job: &PersistedJob) {
        if self.kind != RunnerKind::Startup {
            return;
        }
        let Some((config, notifier)) = self.alerts.as_ref() else {
            warn!(job_id = job.id, job_name = %job.job_name, "job out of attempts, no alert target configured");
            return;
        };
        let alert = FailureAlert::for_job(config, job);
        if let Err(e) = notifier.notify(&alert).await {
            error!(job_id = job.id, job_name = %job.job_name, "failed to send failure alert: {e:#}");
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with a non-string payload".to_string()
    }
}
