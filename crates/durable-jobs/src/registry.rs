use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{DurableJobError, Result};
use crate::job::JobFactory;
use crate::schedule::ExecutionTimeResolver;
use crate::types::JobType;

/// Everything the scheduler and runner need to know about one job name.
#[derive(Clone)]
pub struct RegisteredJob {
    pub name: String,
    pub job_type: JobType,
    pub factory: JobFactory,
    pub resolver: Option<Arc<dyn ExecutionTimeResolver>>,
    /// Scheduled afresh at every process start.
    pub runs_at_startup: bool,
}

impl std::fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("name", &self.name)
            .field("job_type", &self.job_type)
            .field("recurring", &self.resolver.is_some())
            .field("runs_at_startup", &self.runs_at_startup)
            .finish()
    }
}

/// Name → job table, built once during process wiring and then shared
/// read-only (`Arc<JobRegistry>`) with schedulers and runners.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run-once job with no recurrence. Occurrences are created
    /// on demand through [`crate::scheduler::JobEnqueuer`].
    pub fn register(&mut self, name: &str, factory: JobFactory) -> Result<()> {
        self.insert(RegisteredJob {
            name: name.to_string(),
            job_type: JobType::RunOnce,
            factory,
            resolver: None,
            runs_at_startup: false,
        })
    }

    /// Register a recurring job whose occurrences are placed by `resolver`.
    pub fn register_recurring(
        &mut self,
        name: &str,
        factory: JobFactory,
        resolver: Arc<dyn ExecutionTimeResolver>,
    ) -> Result<()> {
        self.insert(RegisteredJob {
            name: name.to_string(),
            job_type: JobType::Recurring,
            factory,
            resolver: Some(resolver),
            runs_at_startup: false,
        })
    }

    /// Register a job that is scheduled for immediate execution every time
    /// the process starts. Such jobs must be idempotent.
    ///
    /// `job_type` describes the job itself; its startup occurrences are
    /// always stored as [`JobType::RunOnce`].
    pub fn register_startup_job(
        &mut self,
        name: &str,
        job_type: JobType,
        factory: JobFactory,
    ) -> Result<()> {
        self.insert(RegisteredJob {
            name: name.to_string(),
            job_type,
            factory,
            resolver: None,
            runs_at_startup: true,
        })
    }

    /// Look up a job by name.
    pub fn get(&self, name: &str) -> Result<&RegisteredJob> {
        self.jobs.get(name).ok_or_else(|| DurableJobError::JobNotFound {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Jobs with a resolver, sorted by name.
    pub fn recurring_jobs(&self) -> Vec<&RegisteredJob> {
        self.sorted(|job| job.resolver.is_some())
    }

    /// Jobs registered with [`JobRegistry::register_startup_job`], sorted by name.
    pub fn startup_jobs(&self) -> Vec<&RegisteredJob> {
        self.sorted(|job| job.runs_at_startup)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn insert(&mut self, job: RegisteredJob) -> Result<()> {
        if self.jobs.contains_key(&job.name) {
            return Err(DurableJobError::DuplicateRegistration { name: job.name });
        }
        debug!(job_name = %job.name, job_type = %job.job_type, "job registered");
        self.jobs.insert(job.name.clone(), job);
        Ok(())
    }

    fn sorted(&self, keep: impl Fn(&RegisteredJob) -> bool) -> Vec<&RegisteredJob> {
        let mut jobs: Vec<&RegisteredJob> = self.jobs.values().filter(|job| keep(job)).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }
}
