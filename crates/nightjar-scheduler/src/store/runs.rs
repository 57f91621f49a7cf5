//! Job run rows. Every field past creation is write-once.

use chrono::Utc;
use rusqlite::{TransactionBehavior, params, params_from_iter};

use super::{RUN_COLUMNS, SqliteStore, format_ts, load_run, load_run_for_job, run_from_row};
use crate::SchedulerError;
use crate::types::{JobRun, JobRunUpdate, RunFilter};

/// Name of the first field in `update` that `run` already has a value for.
fn already_set(run: &JobRun, update: &JobRunUpdate) -> Option<&'static str> {
    let clashes = [
        ("status", update.status.is_some() && run.status.is_some()),
        (
            "finished_at",
            update.finished_at.is_some() && run.finished_at.is_some(),
        ),
        (
            "exit_code",
            update.exit_code.is_some() && run.exit_code.is_some(),
        ),
        ("error", update.error.is_some() && run.error.is_some()),
        (
            "artifacts",
            update.artifacts.is_some() && run.artifacts.is_some(),
        ),
        (
            "log_path",
            update.log_path.is_some() && run.log_path.is_some(),
        ),
    ];
    clashes
        .into_iter()
        .find(|(_, clash)| *clash)
        .map(|(field, _)| field)
}

impl SqliteStore {
    /// Get a run by id.
    pub fn get_job_run(&self, run_id: &str) -> Result<JobRun, SchedulerError> {
        let conn = self.conn()?;
        load_run(&conn, run_id)?.ok_or_else(|| SchedulerError::JobRunNotFound(run_id.to_string()))
    }

    /// The run of a job. Each job has at most one.
    pub fn get_job_run_for_job(&self, job_id: &str) -> Result<Option<JobRun>, SchedulerError> {
        let conn = self.conn()?;
        load_run_for_job(&conn, job_id)
    }

    /// Write fields of an in-flight run.
    ///
    /// Each field can be written once; a run with a terminal status accepts
    /// no further writes at all. Setting a status without `finished_at`
    /// stamps the current time.
    pub fn update_job_run(
        &self,
        run_id: &str,
        update: &JobRunUpdate,
    ) -> Result<JobRun, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let run = load_run(&tx, run_id)?
            .ok_or_else(|| SchedulerError::JobRunNotFound(run_id.to_string()))?;
        if update.is_empty() {
            return Ok(run);
        }
        if let Some(status) = run.status {
            return Err(SchedulerError::InvalidOperation(format!(
                "run {run_id} is already {}; its fields are write-once",
                status.as_str()
            )));
        }
        if let Some(field) = already_set(&run, update) {
            return Err(SchedulerError::InvalidOperation(format!(
                "run {run_id} already has {field} set"
            )));
        }

        let finished_at = match (update.finished_at, update.status) {
            (Some(ts), _) => Some(ts),
            (None, Some(_)) => Some(Utc::now()),
            (None, None) => None,
        };
        let artifacts = update
            .artifacts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            "UPDATE job_runs SET
                 status = COALESCE(?2, status),
                 finished_at = COALESCE(?3, finished_at),
                 exit_code = COALESCE(?4, exit_code),
                 error = COALESCE(?5, error),
                 artifacts = COALESCE(?6, artifacts),
                 log_path = COALESCE(?7, log_path)
             WHERE run_id = ?1 AND status IS NULL",
            params![
                run_id,
                update.status.map(|s| s.as_str()),
                finished_at.as_ref().map(format_ts),
                update.exit_code,
                update.error,
                artifacts,
                update.log_path,
            ],
        )?;

        let run = load_run(&tx, run_id)?
            .ok_or_else(|| SchedulerError::JobRunNotFound(run_id.to_string()))?;
        tx.commit()?;
        Ok(run)
    }

    /// Runs matching `filter`, newest first.
    pub fn list_job_runs(&self, filter: &RunFilter) -> Result<Vec<JobRun>, SchedulerError> {
        let mut conditions = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(job_id) = &filter.job_id {
            args.push(job_id.clone());
            conditions.push(format!("job_runs.job_id = ?{}", args.len()));
        }
        if let Some(job_type) = &filter.job_type {
            args.push(job_type.clone());
            conditions.push(format!("jobs.job_type = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            conditions.push(format!("job_runs.status = ?{}", args.len()));
        }

        let mut sql = format!(
            "SELECT {RUN_COLUMNS} FROM job_runs JOIN jobs ON jobs.job_id = job_runs.job_id"
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY job_runs.started_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_from_iter(args.iter()), run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewJob, RunStatus};

    fn claimed(store: &SqliteStore, job_type: &str) -> JobRun {
        let job = store.create_job(&NewJob::new(job_type)).unwrap();
        store.atomic_claim_job(&job.job_id).unwrap().1
    }

    #[test]
    fn test_terminal_update_stamps_finished_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = claimed(&store, "story");

        let done = store
            .update_job_run(
                &run.run_id,
                &JobRunUpdate {
                    status: Some(RunStatus::Completed),
                    exit_code: Some(0),
                    ..JobRunUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(done.status, Some(RunStatus::Completed));
        assert!(done.finished_at.is_some());
        assert_eq!(done.exit_code, Some(0));
    }

    #[test]
    fn test_terminal_run_rejects_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = claimed(&store, "story");
        store
            .update_job_run(&run.run_id, &JobRunUpdate::finish(RunStatus::Failed))
            .unwrap();

        for update in [
            JobRunUpdate::finish(RunStatus::Completed),
            JobRunUpdate {
                log_path: Some("late.log".to_string()),
                ..JobRunUpdate::default()
            },
            JobRunUpdate {
                artifacts: Some(vec!["story.md".to_string()]),
                ..JobRunUpdate::default()
            },
        ] {
            let err = store.update_job_run(&run.run_id, &update).unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidOperation(_)));
        }
        let run = store.get_job_run(&run.run_id).unwrap();
        assert_eq!(run.status, Some(RunStatus::Failed));
        assert!(run.log_path.is_none());
    }

    #[test]
    fn test_fields_write_once_before_terminal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = claimed(&store, "story");
        let set_log = JobRunUpdate {
            log_path: Some("a.log".to_string()),
            ..JobRunUpdate::default()
        };
        store.update_job_run(&run.run_id, &set_log).unwrap();

        let again = JobRunUpdate {
            log_path: Some("b.log".to_string()),
            ..JobRunUpdate::default()
        };
        assert!(store.update_job_run(&run.run_id, &again).is_err());
        assert_eq!(
            store.get_job_run(&run.run_id).unwrap().log_path.as_deref(),
            Some("a.log")
        );
    }

    #[test]
    fn test_list_job_runs_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let story = claimed(&store, "story");
        let research = claimed(&store, "research");
        store
            .update_job_run(&story.run_id, &JobRunUpdate::finish(RunStatus::Failed))
            .unwrap();

        let all = store.list_job_runs(&RunFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let failed = store
            .list_job_runs(&RunFilter {
                status: Some(RunStatus::Failed),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].run_id, story.run_id);

        let research_runs = store
            .list_job_runs(&RunFilter {
                job_type: Some("research".to_string()),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(research_runs.len(), 1);
        assert_eq!(research_runs[0].run_id, research.run_id);
    }

    #[test]
    fn test_get_missing_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.get_job_run("missing").unwrap_err();
        assert!(matches!(err, SchedulerError::JobRunNotFound(_)));
    }
}
