//! SQLite persistence for the scheduler.
//!
//! The store is the only place that mutates durable state and the only
//! atomicity boundary in the crate. It holds no business rules beyond the
//! invariants that must hold inside a single transaction: the claim
//! protocol, write-once run fields, single-active reservations, and
//! gap-based queue positions.

mod catalog;
mod jobs;
mod recovery;
mod reservations;
mod runs;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::SchedulerError;
use crate::types::{Job, JobParams, JobRun, JobStatus, ReservationStatus, RunStatus};

pub use jobs::RetryChain;
pub use recovery::RunningJobRecovery;

/// How long a writer waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered schema migrations. Append only.
const MIGRATIONS: &[(i64, &str, &str)] = &[(1, "baseline_scheduler_tables", SCHEMA_V1)];

const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS job_templates (
        template_id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        job_type TEXT NOT NULL,
        default_params TEXT NOT NULL DEFAULT '{}',
        retry_policy TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS schedules (
        schedule_id TEXT PRIMARY KEY,
        template_id TEXT NOT NULL REFERENCES job_templates(template_id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        trigger_spec TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_fired_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS job_groups (
        group_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS jobs (
        job_id TEXT PRIMARY KEY,
        job_type TEXT NOT NULL,
        params TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        position INTEGER NOT NULL,
        template_id TEXT REFERENCES job_templates(template_id) ON DELETE SET NULL,
        schedule_id TEXT REFERENCES schedules(schedule_id) ON DELETE SET NULL,
        group_id TEXT REFERENCES job_groups(group_id),
        sequence_number INTEGER,
        retry_of TEXT REFERENCES jobs(job_id),
        created_at TEXT NOT NULL,
        queued_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs(status, priority, position, created_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_group ON jobs(group_id, sequence_number);
    CREATE INDEX IF NOT EXISTS idx_jobs_retry_of ON jobs(retry_of);

    CREATE TABLE IF NOT EXISTS job_runs (
        run_id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL UNIQUE REFERENCES jobs(job_id),
        params_snapshot TEXT NOT NULL,
        status TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        exit_code INTEGER,
        error TEXT,
        artifacts TEXT,
        log_path TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs(status);

    CREATE TABLE IF NOT EXISTS direct_reservations (
        reservation_id TEXT PRIMARY KEY,
        reserved_by TEXT NOT NULL,
        reserved_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        status TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_single_active
        ON direct_reservations(status) WHERE status = 'ACTIVE';
";

/// SQLite-backed scheduler store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets readers in other processes proceed while we write.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "scheduler database initialized");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SchedulerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<(), SchedulerError> {
        let conn = self
            .conn
            .get_mut()
            .map_err(|_| SchedulerError::Storage("connection lock poisoned".to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        let latest = MIGRATIONS.last().map(|(v, _, _)| *v).unwrap_or(0);
        if current > latest {
            return Err(SchedulerError::Storage(format!(
                "database schema version {current} is newer than supported {latest}"
            )));
        }

        for (version, name, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![version, name, format_ts(&Utc::now())],
            )?;
            tx.commit()?;
            debug!(version, name, "applied schema migration");
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SchedulerError> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Storage("connection lock poisoned".to_string()))
    }
}

// =========================================================================
// Row mapping
// =========================================================================

pub(crate) const JOB_COLUMNS: &str = "jobs.job_id, jobs.job_type, jobs.params, jobs.status, \
     jobs.priority, jobs.position, jobs.template_id, jobs.schedule_id, jobs.group_id, \
     jobs.sequence_number, jobs.retry_of, jobs.created_at, jobs.queued_at, jobs.started_at, \
     jobs.finished_at";

pub(crate) const RUN_COLUMNS: &str = "job_runs.run_id, job_runs.job_id, \
     job_runs.params_snapshot, job_runs.status, job_runs.started_at, job_runs.finished_at, \
     job_runs.exit_code, job_runs.error, job_runs.artifacts, job_runs.log_path";

pub(crate) const RESERVATION_COLUMNS: &str =
    "reservation_id, reserved_by, reserved_at, expires_at, status";

/// A stored value that does not parse as the expected type.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
struct UnknownValue {
    kind: &'static str,
    value: String,
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Timestamps are stored with fixed precision so text order is time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_ts(idx, &value)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_ts(idx, &v)).transpose()
}

pub(crate) fn get_json<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value).map_err(|e| conversion_error(idx, e))
}

fn get_opt_json<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| serde_json::from_str(&v).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn get_job_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let value: String = row.get(idx)?;
    JobStatus::parse(&value).ok_or_else(|| {
        conversion_error(
            idx,
            UnknownValue {
                kind: "job status",
                value,
            },
        )
    })
}

pub(crate) fn get_opt_run_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<RunStatus>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| {
            RunStatus::parse(&v).ok_or_else(|| {
                conversion_error(
                    idx,
                    UnknownValue {
                        kind: "run status",
                        value: v,
                    },
                )
            })
        })
        .transpose()
}

pub(crate) fn get_reservation_status(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<ReservationStatus> {
    let value: String = row.get(idx)?;
    ReservationStatus::parse(&value).ok_or_else(|| {
        conversion_error(
            idx,
            UnknownValue {
                kind: "reservation status",
                value,
            },
        )
    })
}

/// Map a row selected with [`JOB_COLUMNS`].
pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        job_id: row.get(0)?,
        job_type: row.get(1)?,
        params: get_json::<JobParams>(row, 2)?,
        status: get_job_status(row, 3)?,
        priority: row.get(4)?,
        position: row.get(5)?,
        template_id: row.get(6)?,
        schedule_id: row.get(7)?,
        group_id: row.get(8)?,
        sequence_number: row.get(9)?,
        retry_of: row.get(10)?,
        created_at: get_ts(row, 11)?,
        queued_at: get_ts(row, 12)?,
        started_at: get_opt_ts(row, 13)?,
        finished_at: get_opt_ts(row, 14)?,
    })
}

/// Map a row selected with [`RUN_COLUMNS`].
pub(crate) fn run_from_row(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        run_id: row.get(0)?,
        job_id: row.get(1)?,
        params_snapshot: get_json::<JobParams>(row, 2)?,
        status: get_opt_run_status(row, 3)?,
        started_at: get_ts(row, 4)?,
        finished_at: get_opt_ts(row, 5)?,
        exit_code: row.get(6)?,
        error: row.get(7)?,
        artifacts: get_opt_json::<Vec<String>>(row, 8)?,
        log_path: row.get(9)?,
    })
}

pub(crate) fn load_job(conn: &Connection, job_id: &str) -> Result<Option<Job>, SchedulerError> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.job_id = ?1"),
            params![job_id],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

pub(crate) fn load_run(conn: &Connection, run_id: &str) -> Result<Option<JobRun>, SchedulerError> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE job_runs.run_id = ?1"),
            params![run_id],
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

pub(crate) fn load_run_for_job(
    conn: &Connection,
    job_id: &str,
) -> Result<Option<JobRun>, SchedulerError> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE job_runs.job_id = ?1"),
            params![job_id],
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

pub(crate) fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, SchedulerError> {
    Ok(conn.query_row(sql, params![id], |_| Ok(())).optional()?.is_some())
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
