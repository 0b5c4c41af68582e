use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// How an occurrence came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Materialized by the recurring scheduler from an execution time resolver.
    Recurring,
    /// Executed a single time, e.g. at process startup.
    RunOnce,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Recurring => "recurring",
            JobType::RunOnce => "run_once",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "recurring" => Ok(JobType::Recurring),
            "run_once" => Ok(JobType::RunOnce),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// State of a persisted occurrence, derived from its columns.
///
/// `Running` exists only inside a runner pass and is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its execution time, never attempted.
    Scheduled,
    /// Failed at least once; will be picked up again.
    FailedRetryable,
    /// Finished successfully.
    Succeeded,
    /// Out of attempts; kept for operator inspection.
    FailedTerminal,
}

/// One occurrence of a job, as stored in the `durable_jobs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedJob {
    /// Surrogate key (SQLite rowid).
    pub id: i64,
    /// Registry key.
    pub job_name: String,
    pub job_type: JobType,
    /// The row becomes eligible at or after this instant.
    pub execution_time: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
    /// Decremented on each failed execution; 0 is terminal.
    pub remaining_attempts: u32,
    /// Set iff the occurrence completed successfully.
    pub success_time: Option<DateTime<Utc>>,
    /// Accumulated failure reports, most recent last.
    pub error_message: Option<String>,
}

impl PersistedJob {
    pub fn has_succeeded(&self) -> bool {
        self.success_time.is_some()
    }

    pub fn has_failed_with_no_remaining_attempts(&self) -> bool {
        !self.has_succeeded() && self.remaining_attempts == 0
    }

    /// Whether a runner polling at `now` should pick this row up.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.has_succeeded() && self.remaining_attempts > 0 && self.execution_time <= now
    }

    pub fn state(&self) -> JobState {
        if self.has_succeeded() {
            JobState::Succeeded
        } else if self.remaining_attempts == 0 {
            JobState::FailedTerminal
        } else if self.error_message.is_some() {
            JobState::FailedRetryable
        } else {
            JobState::Scheduled
        }
    }

    /// Append a failure report, keeping earlier ones.
    pub fn append_error_message(&mut self, message: &str) {
        match self.error_message.as_mut() {
            Some(existing) if !existing.is_empty() => {
                existing.push('\n');
                existing.push_str(message);
            }
            _ => self.error_message = Some(message.to_string()),
        }
    }

    pub fn decrement_remaining_attempts(&mut self) {
        self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
    }
}

/// Values for a row about to be inserted by a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub job_name: String,
    pub job_type: JobType,
    pub execution_time: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
    pub remaining_attempts: u32,
}

/// Fixed-width UTC encoding used for every timestamp column, so that string
/// comparison in SQL orders chronologically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> PersistedJob {
        let at = Utc.with_ymd_and_hms(2022, 12, 7, 10, 0, 0).unwrap();
        PersistedJob {
            id: 1,
            job_name: "purge".into(),
            job_type: JobType::Recurring,
            execution_time: at,
            creation_time: at,
            remaining_attempts: 2,
            success_time: None,
            error_message: None,
        }
    }

    #[test]
    fn job_type_parses_its_own_display() {
        for ty in [JobType::Recurring, JobType::RunOnce] {
            assert_eq!(ty.to_string().parse::<JobType>().unwrap(), ty);
        }
        assert!("weekly".parse::<JobType>().is_err());
    }

    #[test]
    fn state_follows_columns() {
        let mut job = row();
        assert_eq!(job.state(), JobState::Scheduled);

        job.append_error_message("JobRunner_JobFailed first");
        job.decrement_remaining_attempts();
        assert_eq!(job.state(), JobState::FailedRetryable);

        job.append_error_message("JobRunner_JobTimeout second");
        job.decrement_remaining_attempts();
        job.decrement_remaining_attempts();
        assert_eq!(job.remaining_attempts, 0);
        assert_eq!(job.state(), JobState::FailedTerminal);
        assert!(job.has_failed_with_no_remaining_attempts());
        assert_eq!(
            job.error_message.as_deref(),
            Some("JobRunner_JobFailed first\nJobRunner_JobTimeout second")
        );
    }

    #[test]
    fn eligibility_requires_due_unfinished_and_attempts() {
        let job = row();
        let before = job.execution_time - chrono::Duration::seconds(1);
        assert!(!job.is_eligible(before));
        assert!(job.is_eligible(job.execution_time));

        let mut done = row();
        done.success_time = Some(done.execution_time);
        assert!(!done.is_eligible(done.execution_time));
        assert_eq!(done.state(), JobState::Succeeded);

        let mut spent = row();
        spent.remaining_attempts = 0;
        assert!(!spent.is_eligible(spent.execution_time));
    }

    #[test]
    fn timestamps_sort_as_strings() {
        let early = Utc.with_ymd_and_hms(2022, 12, 7, 9, 59, 59).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(parse_timestamp(&format_timestamp(late)).unwrap(), late);
        assert!(format_timestamp(early).ends_with('Z'));
    }
}
