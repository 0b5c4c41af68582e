//! `durable-jobs` — durable job scheduling and execution over SQLite.
//!
//! # Overview
//!
//! Applications register named jobs in a [`registry::JobRegistry`]. Every
//! occurrence of a job is a row in the `durable_jobs` table, so schedules
//! survive restarts and are shared by every process using the database.
//!
//! - [`scheduler::RecurringJobScheduler`] keeps exactly one pending row per
//!   recurring job, placed by its [`schedule::ExecutionTimeResolver`].
//! - [`scheduler::StartupJobScheduler`] queues startup jobs for immediate
//!   execution, and [`scheduler::JobEnqueuer`] does the same for any
//!   registered job on demand.
//! - [`runner::DurableJobRunner`] executes due rows under a deadline and
//!   records success, failure and remaining attempts on the row.
//! - [`worker::JobWorker`] calls the two on a fixed cadence.
//!
//! Execution is at-least-once: timed-out jobs are abandoned, not killed, and
//! runners on different processes may pick up the same row.
//!
//! # Schedule variants
//!
//! | Variant     | Behaviour                                      |
//! |-------------|------------------------------------------------|
//! | `WeeklyAt`  | Fire at HH:MM UTC on a specific weekday        |
//! | `MonthlyAt` | Fire at HH:MM UTC on a day of the month        |
//! | `NightlyAt` | Fire at HH:MM UTC every day                    |
//! | `FixedDate` | Single fire at an absolute UTC instant         |

pub mod alert;
pub mod clock;
pub mod db;
pub mod error;
pub mod job;
pub mod purge;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use alert::{AlertNotifier, FailureAlert, LogNotifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DurableJobError, Result};
pub use job::{job_fn, DurableJob, JobFactory};
pub use registry::{JobRegistry, RegisteredJob};
pub use runner::{DurableJobRunner, RunSummary, RunnerKind};
pub use schedule::{ExecutionTimeResolver, Schedule};
pub use scheduler::{
    Enqueued, JobEnqueuer, RecurringJobScheduler, ScheduleSummary, StartupJobScheduler,
};
pub use store::{JobStore, SqliteJobStore};
pub use types::{JobState, JobType, NewJob, PersistedJob};
pub use worker::{JobWorker, TickSummary};
