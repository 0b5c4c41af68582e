use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::error::{DurableJobError, Result};
use crate::runner::{DurableJobRunner, RunSummary};
use crate::scheduler::{RecurringJobScheduler, ScheduleSummary};

/// Result of one worker tick.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub scheduled: ScheduleSummary,
    /// Set when the scheduling pass failed; the runner pass still ran.
    pub scheduling_error: Option<String>,
    pub ran: RunSummary,
}

/// Drives the recurring scheduler and the periodic runner at a fixed cadence.
///
/// `schedule_jobs` and `run_jobs` are single passes; this is the loop that
/// calls them. Scheduling first means a recurring job whose occurrence just
/// succeeded gets its next occurrence before the runner polls again.
pub struct JobWorker {
    scheduler: RecurringJobScheduler,
    runner: DurableJobRunner,
    poll_interval: Duration,
}

impl JobWorker {
    pub fn new(
        scheduler: RecurringJobScheduler,
        runner: DurableJobRunner,
        poll_interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            runner,
            poll_interval,
        }
    }

    /// One scheduling pass followed by one runner pass.
    ///
    /// A failed scheduling pass does not hold back the runner: rows that are
    /// already due still run, and the error is reported in the summary.
    /// Exhausted scheduling retries are the exception and end the tick.
    pub async fn tick(&self) -> Result<TickSummary> {
        let (scheduled, scheduling_error) = match self.scheduler.schedule_jobs() {
            Ok(summary) => (summary, None),
            Err(e @ DurableJobError::SchedulingRetriesExhausted { .. }) => return Err(e),
            Err(e) => {
                error!("scheduling pass failed: {e}");
                (ScheduleSummary::default(), Some(e.to_string()))
            }
        };
        let ran = self.runner.run_jobs().await?;
        Ok(TickSummary {
            scheduled,
            scheduling_error,
            ran,
        })
    }

    /// Tick every `poll_interval` until `shutdown` broadcasts `true`.
    ///
    /// Exhausted scheduling retries end the loop with that error. Any other
    /// tick error is logged and the next tick tries again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(poll_interval_s = self.poll_interval.as_secs(), "durable job worker started");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary.ran.executed() > 0 || summary.scheduled.scheduled > 0 => {
                            info!(?summary, "worker tick");
                        }
                        Ok(_) => {}
                        Err(e @ DurableJobError::SchedulingRetriesExhausted { .. }) => {
                            error!("giving up: {e}");
                            return Err(e);
                        }
                        Err(e) => error!("worker tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("durable job worker shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
