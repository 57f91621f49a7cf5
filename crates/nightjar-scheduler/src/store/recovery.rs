//! Queries and transitions used by startup recovery.

use chrono::Utc;
use rusqlite::{TransactionBehavior, params};

use super::jobs::insert_run;
use super::{RUN_COLUMNS, SqliteStore, format_ts, load_job, load_run_for_job, new_id, run_from_row};
use crate::SchedulerError;
use crate::types::{JobRun, JobStatus, RunStatus};

/// What recovering one interrupted RUNNING job involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningJobRecovery {
    /// The crash happened before the run existed; a FAILED run was created.
    CreatedFailedRun,
    /// The crash happened mid-execution; the open run was forced to FAILED.
    FailedOpenRun,
    /// The run had finished; only the job's `finished_at` was missing.
    BackfilledFinishedAt,
}

impl SqliteStore {
    /// Close out a job left RUNNING by a crash, in one transaction.
    ///
    /// Returns `None` if the job no longer needs recovery, which makes
    /// repeated calls harmless.
    pub fn recover_running_job(
        &self,
        job_id: &str,
        reason: &str,
    ) -> Result<Option<RunningJobRecovery>, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let job = load_job(&tx, job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Running || job.finished_at.is_some() {
            return Ok(None);
        }

        let (outcome, finished_at) = match load_run_for_job(&tx, job_id)? {
            None => {
                let run = JobRun {
                    run_id: new_id(),
                    job_id: job.job_id.clone(),
                    params_snapshot: job.params.clone(),
                    status: Some(RunStatus::Failed),
                    started_at: job.started_at.unwrap_or(now),
                    finished_at: Some(now),
                    exit_code: None,
                    error: Some(reason.to_string()),
                    artifacts: None,
                    log_path: None,
                };
                insert_run(&tx, &run)?;
                (RunningJobRecovery::CreatedFailedRun, now)
            }
            Some(run) if run.status.is_none() => {
                tx.execute(
                    "UPDATE job_runs
                     SET status = 'FAILED', finished_at = COALESCE(finished_at, ?2),
                         error = COALESCE(error, ?3)
                     WHERE run_id = ?1 AND status IS NULL",
                    params![run.run_id, format_ts(&now), reason],
                )?;
                (
                    RunningJobRecovery::FailedOpenRun,
                    run.finished_at.unwrap_or(now),
                )
            }
            Some(run) => (
                RunningJobRecovery::BackfilledFinishedAt,
                run.finished_at.unwrap_or(now),
            ),
        };

        tx.execute(
            "UPDATE jobs SET finished_at = ?2 WHERE job_id = ?1 AND finished_at IS NULL",
            params![job_id, format_ts(&finished_at)],
        )?;
        tx.commit()?;
        Ok(Some(outcome))
    }

    /// FAILED runs whose job has no retry yet, oldest first.
    pub fn list_failed_runs_without_retry(&self) -> Result<Vec<JobRun>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs
             WHERE job_runs.status = 'FAILED'
               AND NOT EXISTS (SELECT 1 FROM jobs AS r WHERE r.retry_of = job_runs.job_id)
             ORDER BY job_runs.started_at ASC"
        ))?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobRunUpdate, NewJob};

    const REASON: &str = "scheduler crash recovery";

    #[test]
    fn test_recover_open_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.create_job(&NewJob::new("story")).unwrap();
        let (_, run) = store.atomic_claim_job(&job.job_id).unwrap();

        let outcome = store.recover_running_job(&job.job_id, REASON).unwrap();
        assert_eq!(outcome, Some(RunningJobRecovery::FailedOpenRun));

        let run = store.get_job_run(&run.run_id).unwrap();
        assert_eq!(run.status, Some(RunStatus::Failed));
        assert_eq!(run.error.as_deref(), Some(REASON));
        assert!(store.get_job(&job.job_id).unwrap().finished_at.is_some());

        assert_eq!(store.recover_running_job(&job.job_id, REASON).unwrap(), None);
    }

    #[test]
    fn test_recover_finished_run_only_backfills() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.create_job(&NewJob::new("story")).unwrap();
        let (_, run) = store.atomic_claim_job(&job.job_id).unwrap();
        let run = store
            .update_job_run(&run.run_id, &JobRunUpdate::finish(RunStatus::Completed))
            .unwrap();

        let outcome = store.recover_running_job(&job.job_id, REASON).unwrap();
        assert_eq!(outcome, Some(RunningJobRecovery::BackfilledFinishedAt));

        let job = store.get_job(&job.job_id).unwrap();
        assert_eq!(job.finished_at, run.finished_at);
        assert_eq!(
            store.get_job_run(&run.run_id).unwrap().status,
            Some(RunStatus::Completed)
        );
    }

    #[test]
    fn test_queued_job_needs_no_recovery() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.create_job(&NewJob::new("story")).unwrap();
        assert_eq!(store.recover_running_job(&job.job_id, REASON).unwrap(), None);
    }

    #[test]
    fn test_failed_runs_without_retry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.create_job(&NewJob::new("story")).unwrap();
        let (_, run) = store.atomic_claim_job(&job.job_id).unwrap();
        store
            .update_job_run(&run.run_id, &JobRunUpdate::finish(RunStatus::Failed))
            .unwrap();
        assert_eq!(store.list_failed_runs_without_retry().unwrap().len(), 1);

        store
            .create_job(&NewJob::new("story").retrying(&job.job_id))
            .unwrap();
        assert!(store.list_failed_runs_without_retry().unwrap().is_empty());
    }
}
