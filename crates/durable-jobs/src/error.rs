use thiserror::Error;

/// Errors that can occur within the durable job subsystem.
///
/// Failures of individual job bodies are not represented here: they are
/// recorded on the persisted row and never leave `run_jobs`.
#[derive(Debug, Error)]
pub enum DurableJobError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A job name was registered twice.
    #[error("Job already registered: {name}")]
    DuplicateRegistration { name: String },

    /// No job with the given name exists in the registry.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// Another writer inserted or locked a pending row for this job first.
    #[error("Scheduling conflict for job {name}")]
    Conflict { name: String },

    /// `schedule_jobs` kept conflicting and gave up.
    #[error("Scheduling job {name} failed after {attempts} attempts")]
    SchedulingRetriesExhausted { name: String, attempts: u32 },

    /// The provided schedule definition is invalid.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl DurableJobError {
    /// True for the optimistic-lock failures the scheduler retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DurableJobError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, DurableJobError>;
