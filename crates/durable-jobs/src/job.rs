use std::sync::Arc;

use crate::types::PersistedJob;

/// A runnable unit of background work built from one persisted occurrence.
///
/// `run` executes on a blocking worker thread under a deadline. When the
/// deadline passes the runner records a timeout and stops waiting, but the
/// thread is not interrupted: it keeps going until `run` returns. Together
/// with concurrent runners on other replicas this makes execution
/// at-least-once, so job bodies must be safe to re-run, partially or fully.
pub trait DurableJob: Send + 'static {
    /// The row this instance was built from.
    fn persisted_job(&self) -> &PersistedJob;

    /// Do the work. An `Err` counts as a failed attempt.
    fn run(&self) -> anyhow::Result<()>;
}

/// Builds a job instance for a persisted occurrence.
pub type JobFactory = Arc<dyn Fn(PersistedJob) -> Box<dyn DurableJob> + Send + Sync>;

/// Job backed by a shared closure; see [`job_fn`].
pub struct FnJob<F> {
    persisted: PersistedJob,
    body: Arc<F>,
}

impl<F> DurableJob for FnJob<F>
where
    F: Fn(&PersistedJob) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn persisted_job(&self) -> &PersistedJob {
        &self.persisted
    }

    fn run(&self) -> anyhow::Result<()> {
        (self.body)(&self.persisted)
    }
}

/// Turn a closure into a [`JobFactory`].
///
/// ```
/// use durable_jobs::job::job_fn;
///
/// let factory = job_fn(|job| {
///     tracing::info!(job_id = job.id, "cleaning up");
///     Ok(())
/// });
/// # let _ = factory;
/// ```
pub fn job_fn<F>(body: F) -> JobFactory
where
    F: Fn(&PersistedJob) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let body = Arc::new(body);
    Arc::new(move |persisted: PersistedJob| -> Box<dyn DurableJob> {
        Box::new(FnJob {
            persisted,
            body: Arc::clone(&body),
        })
    })
}
