use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, instrument};

use crate::db::{configure_connection, init_db};
use crate::error::{DurableJobError, Result};
use crate::types::{format_timestamp, parse_timestamp, JobType, NewJob, PersistedJob};

/// Data access for persisted job occurrences.
///
/// The table is the only state shared between processes. Implementations
/// must make `insert_pending` a transactional check-then-insert that reports
/// [`DurableJobError::Conflict`] when another writer got there first.
pub trait JobStore: Send + Sync {
    /// The not-yet-succeeded occurrence of `name` with type `job_type` that
    /// still has attempts left.
    fn find_pending(&self, name: &str, job_type: JobType) -> Result<Option<PersistedJob>>;

    /// Insert `new` unless a pending occurrence of the same name and type exists.
    fn insert_pending(&self, new: &NewJob) -> Result<PersistedJob>;

    /// Unfinished rows with attempts left whose execution time is `<= now`,
    /// oldest first. `job_type` narrows the selection when given.
    fn due_jobs(&self, now: DateTime<Utc>, job_type: Option<JobType>)
        -> Result<Vec<PersistedJob>>;

    fn get(&self, id: i64) -> Result<Option<PersistedJob>>;

    /// Persist the bookkeeping columns of one row.
    fn update(&self, job: &PersistedJob) -> Result<()>;

    /// Returns whether a row was removed.
    fn delete(&self, id: i64) -> Result<bool>;

    /// Every row, newest first.
    fn list(&self) -> Result<Vec<PersistedJob>>;

    /// Remove succeeded rows whose success time is before `cutoff`.
    fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// [`JobStore`] over a single SQLite connection.
///
/// Each process (or each test "replica") opens its own store on the same
/// database file; SQLite's locking plus the pending-name unique index keep
/// concurrent schedulers honest.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        configure_connection(&conn)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self))]
    fn find_pending(&self, name: &str, job_type: JobType) -> Result<Option<PersistedJob>> {
        let conn = self.conn.lock().unwrap();
        Ok(find_pending_in(&conn, name, job_type)?)
    }

    #[instrument(skip(self), fields(job_name = %new.job_name))]
    fn insert_pending(&self, new: &NewJob) -> Result<PersistedJob> {
        let mut conn = self.conn.lock().unwrap();
        let conflict = |e| classify(e, &new.job_name);

        // IMMEDIATE takes the write lock up front, so the existence check
        // and the insert see the same snapshot.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(conflict)?;

        if find_pending_in(&tx, &new.job_name, new.job_type)?.is_some() {
            return Err(DurableJobError::Conflict {
                name: new.job_name.clone(),
            });
        }

        tx.execute(
            "INSERT INTO durable_jobs
             (job_name, job_type, execution_time, creation_time,
              remaining_attempts, success_time, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL)",
            params![
                new.job_name,
                new.job_type.as_str(),
                format_timestamp(new.execution_time),
                format_timestamp(new.creation_time),
                new.remaining_attempts,
            ],
        )
        .map_err(conflict)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(conflict)?;

        debug!(job_id = id, "pending occurrence inserted");
        Ok(PersistedJob {
            id,
            job_name: new.job_name.clone(),
            job_type: new.job_type,
            execution_time: new.execution_time,
            creation_time: new.creation_time,
            remaining_attempts: new.remaining_attempts,
            success_time: None,
            error_message: None,
        })
    }

    #[instrument(skip(self))]
    fn due_jobs(
        &self,
        now: DateTime<Utc>,
        job_type: Option<JobType>,
    ) -> Result<Vec<PersistedJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, job_name, job_type, execution_time, creation_time,
                    remaining_attempts, success_time, error_message
             FROM durable_jobs
             WHERE success_time IS NULL
               AND remaining_attempts > 0
               AND execution_time <= ?1
               AND (?2 IS NULL OR job_type = ?2)
             ORDER BY execution_time, id",
        )?;
        let rows = stmt.query_map(
            params![format_timestamp(now), job_type.map(|t| t.as_str())],
            row_to_job,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get(&self, id: i64) -> Result<Option<PersistedJob>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT id, job_name, job_type, execution_time, creation_time,
                        remaining_attempts, success_time, error_message
                 FROM durable_jobs WHERE id = ?1",
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    #[instrument(skip(self, job), fields(job_id = job.id))]
    fn update(&self, job: &PersistedJob) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE durable_jobs
             SET remaining_attempts = ?1,
                 success_time       = ?2,
                 error_message      = ?3
             WHERE id = ?4",
            params![
                job.remaining_attempts,
                job.success_time.map(format_timestamp),
                job.error_message,
                job.id,
            ],
        )?;
        if n == 0 {
            return Err(DurableJobError::JobNotFound {
                name: job.job_name.clone(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM durable_jobs WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    fn list(&self) -> Result<Vec<PersistedJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_name, job_type, execution_time, creation_time,
                    remaining_attempts, success_time, error_message
             FROM durable_jobs ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[instrument(skip(self))]
    fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM durable_jobs
             WHERE success_time IS NOT NULL AND success_time < ?1",
            [format_timestamp(cutoff)],
        )?;
        Ok(n)
    }
}

fn find_pending_in(
    conn: &Connection,
    name: &str,
    job_type: JobType,
) -> rusqlite::Result<Option<PersistedJob>> {
    conn.query_row(
        "SELECT id, job_name, job_type, execution_time, creation_time,
                remaining_attempts, success_time, error_message
         FROM durable_jobs
         WHERE job_name = ?1 AND job_type = ?2
           AND success_time IS NULL AND remaining_attempts > 0
         ORDER BY id LIMIT 1",
        params![name, job_type.as_str()],
        row_to_job,
    )
    .optional()
}

/// Lock contention and pending-name collisions mean another writer won.
fn classify(err: rusqlite::Error, name: &str) -> DurableJobError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation
            ) =>
        {
            DurableJobError::Conflict {
                name: name.to_string(),
            }
        }
        _ => DurableJobError::Database(err),
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<PersistedJob> {
    let job_type: String = row.get(2)?;
    Ok(PersistedJob {
        id: row.get(0)?,
        job_name: row.get(1)?,
        job_type: job_type
            .parse()
            .map_err(|e: String| conversion_error(2, e.into()))?,
        execution_time: timestamp_column(row, 3)?,
        creation_time: timestamp_column(row, 4)?,
        remaining_attempts: row.get(5)?,
        success_time: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_timestamp(&s).map_err(|e| conversion_error(6, Box::new(e))))
            .transpose()?,
        error_message: row.get(7)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| conversion_error(idx, Box::new(e)))
}

fn conversion_error(
    idx: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err)
}
