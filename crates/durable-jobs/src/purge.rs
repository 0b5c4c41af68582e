use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use durable_core::config::DurableJobsConfig;

use crate::clock::Clock;
use crate::error::Result;
use crate::job::{DurableJob, JobFactory};
use crate::registry::JobRegistry;
use crate::schedule::Schedule;
use crate::store::JobStore;
use crate::types::PersistedJob;

pub const PURGE_JOB_NAME: &str = "purge_succeeded_jobs";

/// Deletes succeeded occurrences older than the retention window.
///
/// Re-running it is harmless: a second run finds nothing left to delete.
pub struct PurgeSucceededJobs {
    persisted: PersistedJob,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl DurableJob for PurgeSucceededJobs {
    fn persisted_job(&self) -> &PersistedJob {
        &self.persisted
    }

    fn run(&self) -> anyhow::Result<()> {
        let cutoff = self.clock.now() - self.retention;
        let purged = self.store.purge_succeeded_before(cutoff)?;
        info!(purged, %cutoff, "succeeded jobs purged");
        Ok(())
    }
}

pub fn purge_factory(
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
) -> JobFactory {
    let retention = Duration::days(i64::from(retention_days));
    Arc::new(move |persisted: PersistedJob| -> Box<dyn DurableJob> {
        Box::new(PurgeSucceededJobs {
            persisted,
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            retention,
        })
    })
}

/// Register the purge job to run nightly at 02:00 UTC.
pub fn register_purge_job(
    registry: &mut JobRegistry,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: &DurableJobsConfig,
) -> Result<()> {
    registry.register_recurring(
        PURGE_JOB_NAME,
        purge_factory(store, clock, config.succeeded_retention_days),
        Arc::new(Schedule::nightly_at(2, 0)?),
    )
}
