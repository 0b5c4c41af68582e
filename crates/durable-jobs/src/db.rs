use rusqlite::Connection;

use crate::error::Result;

/// Initialise the durable job schema in `conn`.
///
/// Creates the `durable_jobs` table (idempotent), an index serving the due
/// poll, and a partial unique index allowing at most one pending occurrence
/// per job name and type, so concurrent schedulers collide instead of
/// duplicating. A run-once occurrence queued on demand can therefore sit
/// next to the pending occurrence of the same recurring job.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS durable_jobs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name            TEXT    NOT NULL,
            job_type            TEXT    NOT NULL,   -- 'recurring' | 'run_once'
            execution_time      TEXT    NOT NULL,   -- RFC 3339 UTC, fixed width
            creation_time       TEXT    NOT NULL,
            remaining_attempts  INTEGER NOT NULL,
            success_time        TEXT,               -- NULL until it succeeds
            error_message       TEXT                -- NULL until it fails
        ) STRICT;

        -- Polling: WHERE success_time IS NULL AND execution_time <= ?
        CREATE INDEX IF NOT EXISTS idx_durable_jobs_due
            ON durable_jobs (success_time, execution_time);

        -- Superseded by idx_durable_jobs_pending (name only, no type).
        DROP INDEX IF EXISTS idx_durable_jobs_pending_name;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_durable_jobs_pending
            ON durable_jobs (job_name, job_type)
            WHERE success_time IS NULL AND remaining_attempts > 0;
        ",
    )?;
    Ok(())
}

/// Pragmas for every connection the store opens: WAL for concurrent readers,
/// and a busy timeout so competing writers wait rather than fail at once.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(())
}
