//! Job rows: creation, guarded mutation, the claim protocol, and queue order.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use super::{
    JOB_COLUMNS, SqliteStore, format_ts, job_from_row, load_job, new_id, row_exists,
};
use crate::SchedulerError;
use crate::types::{
    Job, JobRun, JobStatus, JobUpdate, NewJob, POSITION_GAP, QueueStats,
};

/// Dispatch order: priority DESC, position ASC, created_at ASC.
const QUEUE_ORDER: &str =
    "ORDER BY jobs.priority DESC, jobs.position ASC, jobs.created_at ASC, jobs.rowid ASC";

/// True when a sibling in the same group runs, or is queued ahead.
const BLOCKED_BY_GROUP: &str = "EXISTS (
    SELECT 1 FROM jobs AS s
    WHERE jobs.group_id IS NOT NULL
      AND s.group_id = jobs.group_id
      AND s.job_id <> jobs.job_id
      AND (
        (s.status = 'RUNNING' AND s.finished_at IS NULL)
        OR (s.status = 'QUEUED' AND s.sequence_number < jobs.sequence_number)
      )
)";

/// Where a retry chain starts and how many attempts it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryChain {
    pub root_job_id: String,
    pub attempt_count: u32,
}

fn next_position(conn: &Connection, priority: i32) -> Result<i64, SchedulerError> {
    let position = conn.query_row(
        "SELECT COALESCE(MAX(position), 0) + ?2 FROM jobs WHERE status = 'QUEUED' AND priority = ?1",
        params![priority, POSITION_GAP],
        |row| row.get(0),
    )?;
    Ok(position)
}

fn next_sequence_number(conn: &Connection, group_id: &str) -> Result<i64, SchedulerError> {
    let sequence = conn.query_row(
        "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM jobs WHERE group_id = ?1",
        params![group_id],
        |row| row.get(0),
    )?;
    Ok(sequence)
}

fn insert_job(conn: &Connection, job: &Job) -> Result<(), SchedulerError> {
    conn.execute(
        "INSERT INTO jobs
         (job_id, job_type, params, status, priority, position, template_id, schedule_id,
          group_id, sequence_number, retry_of, created_at, queued_at, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            job.job_id,
            job.job_type,
            serde_json::to_string(&job.params)?,
            job.status.as_str(),
            job.priority,
            job.position,
            job.template_id,
            job.schedule_id,
            job.group_id,
            job.sequence_number,
            job.retry_of,
            format_ts(&job.created_at),
            format_ts(&job.queued_at),
            job.started_at.as_ref().map(format_ts),
            job.finished_at.as_ref().map(format_ts),
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_run(conn: &Connection, run: &JobRun) -> Result<(), SchedulerError> {
    let artifacts = run
        .artifacts
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO job_runs
         (run_id, job_id, params_snapshot, status, started_at, finished_at, exit_code, error,
          artifacts, log_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run.run_id,
            run.job_id,
            serde_json::to_string(&run.params_snapshot)?,
            run.status.map(|s| s.as_str()),
            format_ts(&run.started_at),
            run.finished_at.as_ref().map(format_ts),
            run.exit_code,
            run.error,
            artifacts,
            run.log_path,
        ],
    )?;
    Ok(())
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Job>, SchedulerError> {
    let mut stmt = conn.prepare(sql)?;
    let jobs = stmt
        .query_map(args, job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

fn limit_clause(limit: Option<usize>) -> String {
    limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default()
}

impl SqliteStore {
    // =========================================================================
    // Creation and lookup
    // =========================================================================

    /// Insert a QUEUED job at the tail of its priority band.
    #[tracing::instrument(skip(self, new), fields(job_type = %new.job_type, priority = new.priority))]
    pub fn create_job(&self, new: &NewJob) -> Result<Job, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(template_id) = &new.template_id {
            if !row_exists(&tx, "SELECT 1 FROM job_templates WHERE template_id = ?1", template_id)? {
                return Err(SchedulerError::TemplateNotFound(template_id.clone()));
            }
        }
        if let Some(schedule_id) = &new.schedule_id {
            if !row_exists(&tx, "SELECT 1 FROM schedules WHERE schedule_id = ?1", schedule_id)? {
                return Err(SchedulerError::ScheduleNotFound(schedule_id.clone()));
            }
        }
        if let Some(retry_of) = &new.retry_of {
            if !row_exists(&tx, "SELECT 1 FROM jobs WHERE job_id = ?1", retry_of)? {
                return Err(SchedulerError::JobNotFound(retry_of.clone()));
            }
        }
        let sequence_number = match &new.group_id {
            Some(group_id) => {
                if !row_exists(&tx, "SELECT 1 FROM job_groups WHERE group_id = ?1", group_id)? {
                    return Err(SchedulerError::GroupNotFound(group_id.clone()));
                }
                match new.sequence_number {
                    Some(n) => Some(n),
                    None => Some(next_sequence_number(&tx, group_id)?),
                }
            }
            None => None,
        };

        let now = Utc::now();
        let job = Job {
            job_id: new_id(),
            job_type: new.job_type.clone(),
            params: new.params.clone(),
            status: JobStatus::Queued,
            priority: new.priority,
            position: next_position(&tx, new.priority)?,
            template_id: new.template_id.clone(),
            schedule_id: new.schedule_id.clone(),
            group_id: new.group_id.clone(),
            sequence_number,
            retry_of: new.retry_of.clone(),
            created_at: now,
            queued_at: now,
            started_at: None,
            finished_at: None,
        };
        insert_job(&tx, &job)?;
        tx.commit()?;

        debug!(job_id = %job.job_id, position = job.position, "job queued");
        Ok(job)
    }

    /// Get a job by id.
    pub fn get_job(&self, job_id: &str) -> Result<Job, SchedulerError> {
        self.find_job(job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    /// Get a job by id, if it exists.
    pub fn find_job(&self, job_id: &str) -> Result<Option<Job>, SchedulerError> {
        let conn = self.conn()?;
        load_job(&conn, job_id)
    }

    // =========================================================================
    // Guarded mutation
    // =========================================================================

    /// Change params, priority or position of a QUEUED job.
    ///
    /// A priority change without an explicit position moves the job to the
    /// tail of its new priority band.
    pub fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<Job, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if update.is_empty() {
            return Ok(job);
        }
        if job.status != JobStatus::Queued {
            return Err(SchedulerError::InvalidOperation(format!(
                "job {job_id} is {}; params, priority and position are fixed once dispatched",
                job.status.as_str()
            )));
        }

        let priority = update.priority.unwrap_or(job.priority);
        let position = match (update.position, update.priority) {
            (Some(position), _) => position,
            (None, Some(p)) if p != job.priority => next_position(&tx, p)?,
            _ => job.position,
        };
        let params = match &update.params {
            Some(params) => params,
            None => &job.params,
        };

        let changed = tx.execute(
            "UPDATE jobs SET params = ?2, priority = ?3, position = ?4
             WHERE job_id = ?1 AND status = 'QUEUED'",
            params![job_id, serde_json::to_string(params)?, priority, position],
        )?;
        if changed == 0 {
            return Err(SchedulerError::InvalidOperation(format!(
                "job {job_id} left the queue during update"
            )));
        }

        let job = load_job(&tx, job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        tx.commit()?;
        Ok(job)
    }

    /// QUEUED -> CANCELLED. Any other state is rejected.
    pub fn cancel_queued_job(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE jobs SET status = 'CANCELLED', finished_at = ?2
             WHERE job_id = ?1 AND status = 'QUEUED'",
            params![job_id, format_ts(&Utc::now())],
        )?;
        let job = load_job(&tx, job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if changed == 0 {
            return Err(SchedulerError::InvalidOperation(format!(
                "job {job_id} is {}; only queued jobs can be cancelled",
                job.status.as_str()
            )));
        }
        tx.commit()?;
        Ok(job)
    }

    /// Atomically move a QUEUED job to RUNNING and create its run.
    ///
    /// This is the only way a job is dispatched. Losing the race to another
    /// claimer yields [`SchedulerError::ConcurrencyViolation`].
    #[tracing::instrument(skip(self))]
    pub fn atomic_claim_job(&self, job_id: &str) -> Result<(Job, JobRun), SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let changed = tx.execute(
            "UPDATE jobs SET status = 'RUNNING', started_at = ?2
             WHERE job_id = ?1 AND status = 'QUEUED'",
            params![job_id, format_ts(&now)],
        )?;
        let job = load_job(&tx, job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if changed == 0 {
            return Err(SchedulerError::ConcurrencyViolation(format!(
                "job {job_id} is {}, not QUEUED",
                job.status.as_str()
            )));
        }

        let run = JobRun {
            run_id: new_id(),
            job_id: job.job_id.clone(),
            params_snapshot: job.params.clone(),
            status: None,
            started_at: now,
            finished_at: None,
            exit_code: None,
            error: None,
            artifacts: None,
            log_path: None,
        };
        insert_run(&tx, &run)?;
        tx.commit()?;

        debug!(job_id, run_id = %run.run_id, "job claimed");
        Ok((job, run))
    }

    /// Set `finished_at` if it is not set yet. Returns whether it changed.
    pub fn backfill_job_finished_at(
        &self,
        job_id: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET finished_at = ?2 WHERE job_id = ?1 AND finished_at IS NULL",
            params![job_id, format_ts(&finished_at)],
        )?;
        if changed == 0 && load_job(&conn, job_id)?.is_none() {
            return Err(SchedulerError::JobNotFound(job_id.to_string()));
        }
        Ok(changed > 0)
    }

    // =========================================================================
    // Queue order
    // =========================================================================

    /// Head of the queue, ignoring group sequencing.
    pub fn get_next_queued_job(&self) -> Result<Option<Job>, SchedulerError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.status = 'QUEUED' {QUEUE_ORDER} LIMIT 1"
                ),
                [],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Head of the queue, skipping jobs their group is not ready for.
    pub fn get_next_dispatchable_job(&self) -> Result<Option<Job>, SchedulerError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE jobs.status = 'QUEUED' AND NOT {BLOCKED_BY_GROUP}
                     {QUEUE_ORDER} LIMIT 1"
                ),
                [],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Whether a sibling in the job's group is running or queued ahead of it.
    pub fn is_job_blocked_by_group(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let conn = self.conn()?;
        let blocked: Option<bool> = conn
            .query_row(
                &format!("SELECT {BLOCKED_BY_GROUP} FROM jobs WHERE jobs.job_id = ?1"),
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        blocked.ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    /// QUEUED jobs in dispatch order.
    pub fn list_queued_jobs(&self, limit: Option<usize>) -> Result<Vec<Job>, SchedulerError> {
        let conn = self.conn()?;
        query_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.status = 'QUEUED' {QUEUE_ORDER}{}",
                limit_clause(limit)
            ),
            [],
        )
    }

    /// RUNNING jobs whose run has not been backfilled as finished.
    pub fn list_running_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        let conn = self.conn()?;
        query_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE jobs.status = 'RUNNING' AND jobs.finished_at IS NULL
                 ORDER BY jobs.started_at ASC"
            ),
            [],
        )
    }

    // =========================================================================
    // Retry chains
    // =========================================================================

    /// The job created as a retry of `job_id`, if any.
    pub fn get_retry_for_job(&self, job_id: &str) -> Result<Option<Job>, SchedulerError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.retry_of = ?1
                     ORDER BY jobs.created_at ASC LIMIT 1"
                ),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Walk `retry_of` links from `job_id` back to the first attempt.
    pub fn get_retry_chain(&self, job_id: &str) -> Result<RetryChain, SchedulerError> {
        let conn = self.conn()?;
        let chain = conn
            .query_row(
                "WITH RECURSIVE chain(job_id, retry_of, depth) AS (
                     SELECT job_id, retry_of, 1 FROM jobs WHERE job_id = ?1
                     UNION ALL
                     SELECT j.job_id, j.retry_of, c.depth + 1
                     FROM jobs AS j JOIN chain AS c ON j.job_id = c.retry_of
                 )
                 SELECT job_id, depth FROM chain ORDER BY depth DESC LIMIT 1",
                params![job_id],
                |row| {
                    Ok(RetryChain {
                        root_job_id: row.get(0)?,
                        attempt_count: row.get(1)?,
                    })
                },
            )
            .optional()?;
        chain.ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Job and run counters plus the active reservation.
    pub fn queue_stats(&self) -> Result<QueueStats, SchedulerError> {
        let (queued, running, cancelled, completed_runs, failed_runs, skipped_runs) = {
            let conn = self.conn()?;
            let (queued, running, cancelled): (i64, i64, i64) = conn.query_row(
                "SELECT
                     COALESCE(SUM(status = 'QUEUED'), 0),
                     COALESCE(SUM(status = 'RUNNING' AND finished_at IS NULL), 0),
                     COALESCE(SUM(status = 'CANCELLED'), 0)
                 FROM jobs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let (completed, failed, skipped): (i64, i64, i64) = conn.query_row(
                "SELECT
                     COALESCE(SUM(status = 'COMPLETED'), 0),
                     COALESCE(SUM(status = 'FAILED'), 0),
                     COALESCE(SUM(status = 'SKIPPED'), 0)
                 FROM job_runs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            (queued, running, cancelled, completed, failed, skipped)
        };

        Ok(QueueStats {
            queued: queued as u64,
            running: running as u64,
            cancelled: cancelled as u64,
            completed_runs: completed_runs as u64,
            failed_runs: failed_runs as u64,
            skipped_runs: skipped_runs as u64,
            active_reservation: self.get_active_reservation()?,
        })
    }
}
