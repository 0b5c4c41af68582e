use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use durable_core::config::DurableJobsConfig;

use crate::clock::Clock;
use crate::error::{DurableJobError, Result};
use crate::registry::{JobRegistry, RegisteredJob};
use crate::store::JobStore;
use crate::types::{JobType, NewJob};

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    /// New pending rows inserted by this pass.
    pub scheduled: usize,
    /// Jobs that already had a pending row (ours or another process's).
    pub already_scheduled: usize,
    /// Jobs whose resolver has no further occurrence.
    pub exhausted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Scheduled,
    AlreadyScheduled,
    Exhausted,
}

impl ScheduleSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Scheduled => self.scheduled += 1,
            Outcome::AlreadyScheduled => self.already_scheduled += 1,
            Outcome::Exhausted => self.exhausted += 1,
        }
    }
}

/// Shared state and the retrying check-then-insert used by both schedulers.
struct Placement {
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    retry_limit: u32,
}

impl Placement {
    fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &DurableJobsConfig,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            max_attempts: config.max_attempts.max(1),
            retry_limit: config.scheduling_retries.max(1),
        }
    }

    /// Make sure `job` has exactly one pending row.
    ///
    /// A conflict means another scheduler inserted the row between our check
    /// and our commit, so the loop re-runs the check rather than inserting
    /// blindly; the next round normally finds the row and stops.
    fn ensure_pending(
        &self,
        job: &RegisteredJob,
        job_type: JobType,
        resolve: impl Fn(&dyn Clock) -> Option<DateTime<Utc>>,
    ) -> Result<Outcome> {
        for attempt in 1..=self.retry_limit {
            if let Some(existing) = self.store.find_pending(&job.name, job_type)? {
                debug!(job_name = %job.name, job_id = existing.id, "already scheduled");
                return Ok(Outcome::AlreadyScheduled);
            }

            let Some(execution_time) = resolve(self.clock.as_ref()) else {
                debug!(job_name = %job.name, "no further occurrence");
                return Ok(Outcome::Exhausted);
            };

            let new = NewJob {
                job_name: job.name.clone(),
                job_type,
                execution_time,
                creation_time: self.clock.now(),
                remaining_attempts: self.max_attempts,
            };
            match self.store.insert_pending(&new) {
                Ok(inserted) => {
                    info!(
                        job_name = %job.name,
                        job_id = inserted.id,
                        execution_time = %inserted.execution_time,
                        "job scheduled"
                    );
                    return Ok(Outcome::Scheduled);
                }
                Err(e) if e.is_conflict() => {
                    warn!(job_name = %job.name, attempt, "scheduling conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DurableJobError::SchedulingRetriesExhausted {
            name: job.name.clone(),
            attempts: self.retry_limit,
        })
    }
}

/// Keeps one pending occurrence per recurring job, placed by its resolver.
///
/// Safe to run from any number of processes at once. After a row succeeds
/// or runs out of attempts, the next pass schedules the following occurrence.
pub struct RecurringJobScheduler {
    inner: Placement,
}

impl RecurringJobScheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &DurableJobsConfig,
    ) -> Self {
        Self {
            inner: Placement::new(registry, store, clock, config),
        }
    }

    /// One idempotent pass over every recurring job in the registry.
    ///
    /// Stops at the first non-conflict error; running out of conflict
    /// retries is returned as [`DurableJobError::SchedulingRetriesExhausted`].
    #[instrument(skip(self))]
    pub fn schedule_jobs(&self) -> Result<ScheduleSummary> {
        let mut summary = ScheduleSummary::default();
        for job in self.inner.registry.recurring_jobs() {
            let Some(resolver) = job.resolver.as_ref() else {
                continue;
            };
            let outcome = self.inner.ensure_pending(job, JobType::Recurring, |clock| {
                resolver.resolve_execution_time(clock)
            })?;
            summary.record(outcome);
        }
        debug!(?summary, "recurring scheduling pass complete");
        Ok(summary)
    }
}

/// Schedules every startup job for immediate execution.
///
/// Startup occurrences are always stored as [`JobType::RunOnce`], whatever
/// type the job was registered with, since that is what the startup runner
/// picks up. A startup job that is still pending from an earlier start (for
/// example one that failed and has attempts left) is not duplicated.
pub struct StartupJobScheduler {
    inner: Placement,
}

impl StartupJobScheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &DurableJobsConfig,
    ) -> Self {
        Self {
            inner: Placement::new(registry, store, clock, config),
        }
    }

    #[instrument(skip(self))]
    pub fn schedule_jobs(&self) -> Result<ScheduleSummary> {
        let mut summary = ScheduleSummary::default();
        for job in self.inner.registry.startup_jobs() {
            let outcome = self
                .inner
                .ensure_pending(job, JobType::RunOnce, |clock| Some(clock.now()))?;
            summary.record(outcome);
        }
        debug!(?summary, "startup scheduling pass complete");
        Ok(summary)
    }
}

/// Result of [`JobEnqueuer::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Enqueued {
    /// A new run-once occurrence due now was inserted.
    Queued,
    /// A run-once occurrence of the job is already waiting to run.
    AlreadyQueued,
}

/// Queues a registered job to run on the next runner pass.
///
/// The occurrence is stored as [`JobType::RunOnce`] and due immediately. It
/// does not disturb the pending occurrence of a recurring job with the same
/// name, so an operator can run a recurring job early without losing its
/// regular schedule.
pub struct JobEnqueuer {
    inner: Placement,
}

impl JobEnqueuer {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &DurableJobsConfig,
    ) -> Self {
        Self {
            inner: Placement::new(registry, store, clock, config),
        }
    }

    /// Fails with [`DurableJobError::JobNotFound`] for unregistered names.
    #[instrument(skip(self))]
    pub fn enqueue(&self, name: &str) -> Result<Enqueued> {
        let job = self.inner.registry.get(name)?;
        let outcome = self
            .inner
            .ensure_pending(job, JobType::RunOnce, |clock| Some(clock.now()))?;
        Ok(match outcome {
            Outcome::Scheduled => Enqueued::Queued,
            Outcome::AlreadyScheduled | Outcome::Exhausted => Enqueued::AlreadyQueued,
        })
    }
}
