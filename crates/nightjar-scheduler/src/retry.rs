//! Retry chains and backoff decisions.

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::queue::QueueManager;
use crate::types::{Job, JobRun, NewJob, RetryPolicy, RunStatus};
use crate::SchedulerError;

/// Creates retry jobs for failed runs.
#[derive(Clone)]
pub struct RetryController {
    queue: QueueManager,
    default_policy: RetryPolicy,
}

impl RetryController {
    pub fn new(queue: QueueManager, default_policy: RetryPolicy) -> Self {
        Self {
            queue,
            default_policy,
        }
    }

    /// The policy in force for `job`: its template's, else the default.
    fn policy_for(&self, job: &Job) -> Result<RetryPolicy, SchedulerError> {
        match &job.template_id {
            Some(template_id) => match self.queue.store().get_template(template_id) {
                Ok(template) => Ok(template.retry_policy),
                // The template was deleted after the job was queued.
                Err(SchedulerError::TemplateNotFound(_)) => Ok(self.default_policy),
                Err(e) => Err(e),
            },
            None => Ok(self.default_policy),
        }
    }

    /// Decide whether a failed run earns an automatic retry.
    ///
    /// Returns the new job, or `None` if the run did not fail, a retry
    /// already exists, or the chain has used up its attempts.
    #[tracing::instrument(skip(self, job, run), fields(job_id = %job.job_id, run_id = %run.run_id))]
    pub fn on_job_failed(&self, job: &Job, run: &JobRun) -> Result<Option<Job>, SchedulerError> {
        if run.status != Some(RunStatus::Failed) {
            return Ok(None);
        }
        let store = self.queue.store();
        if store.get_retry_for_job(&job.job_id)?.is_some() {
            return Ok(None);
        }

        let chain = store.get_retry_chain(&job.job_id)?;
        let policy = self.policy_for(job)?;
        if chain.attempt_count >= policy.max_attempts {
            warn!(
                root_job_id = %chain.root_job_id,
                attempts = chain.attempt_count,
                max_attempts = policy.max_attempts,
                "retry attempts exhausted"
            );
            return Ok(None);
        }

        let delay = policy.calculate_retry_delay(chain.attempt_count);
        let retry = self.queue.enqueue(
            NewJob {
                job_type: job.job_type.clone(),
                params: job.params.clone(),
                priority: job.priority,
                template_id: job.template_id.clone(),
                schedule_id: None,
                group_id: None,
                sequence_number: None,
                retry_of: Some(job.job_id.clone()),
            },
        )?;
        // Dispatch is not held back; the delay is reported only.
        let not_before = Utc::now()
            .checked_add_signed(delay)
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        info!(
            retry_job_id = %retry.job_id,
            attempt = chain.attempt_count + 1,
            max_attempts = policy.max_attempts,
            backoff_secs = delay.num_seconds(),
            %not_before,
            "retry enqueued"
        );
        Ok(Some(retry))
    }

    /// Retry a FAILED run by hand, ignoring the attempt limit.
    ///
    /// The retry reuses the run's params snapshot, so it reproduces exactly
    /// what was attempted even if the job's params were edited afterwards.
    pub fn manual_retry(&self, run_id: &str, priority: Option<i32>) -> Result<Job, SchedulerError> {
        let store = self.queue.store();
        let run = store.get_job_run(run_id)?;
        if run.status != Some(RunStatus::Failed) {
            return Err(SchedulerError::InvalidOperation(format!(
                "run {run_id} is {}, only FAILED runs can be retried",
                run.status.map_or("in progress", |s| s.as_str())
            )));
        }
        let job = store.get_job(&run.job_id)?;

        let retry = self.queue.enqueue(NewJob {
            job_type: job.job_type.clone(),
            params: run.params_snapshot.clone(),
            priority: priority.unwrap_or(job.priority),
            template_id: job.template_id.clone(),
            schedule_id: None,
            group_id: None,
            sequence_number: None,
            retry_of: Some(job.job_id.clone()),
        })?;
        info!(run_id, retry_job_id = %retry.job_id, "manual retry enqueued");
        Ok(retry)
    }

    /// Create retries that a crash prevented. Safe to call repeatedly.
    ///
    /// Returns how many retries were created.
    pub fn recover_orphaned_retries(&self) -> Result<usize, SchedulerError> {
        let store = self.queue.store();
        let mut created = 0;
        for run in store.list_failed_runs_without_retry()? {
            let job = store.get_job(&run.job_id)?;
            if self.on_job_failed(&job, &run)?.is_some() {
                created += 1;
            }
        }
        if created > 0 {
            info!(count = created, "recovered orphaned retries");
        }
        Ok(created)
    }

    /// Advisory delay before the next attempt of `job`.
    pub fn next_retry_delay(&self, job: &Job) -> Result<Duration, SchedulerError> {
        let chain = self.queue.store().get_retry_chain(&job.job_id)?;
        Ok(self.policy_for(job)?.calculate_retry_delay(chain.attempt_count))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{JobRunUpdate, NewTemplate};
    use serde_json::json;

    fn controller() -> RetryController {
        let queue = QueueManager::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        RetryController::new(queue, RetryPolicy::default())
    }

    fn run_to(controller: &RetryController, job: &Job, status: RunStatus) -> (Job, JobRun) {
        let store = controller.queue.store();
        let (_, run) = store.atomic_claim_job(&job.job_id).unwrap();
        let run = store
            .update_job_run(&run.run_id, &JobRunUpdate::finish(status).with_error("boom"))
            .unwrap();
        store
            .backfill_job_finished_at(&job.job_id, run.finished_at.unwrap())
            .unwrap();
        (store.get_job(&job.job_id).unwrap(), run)
    }

    #[test]
    fn test_completed_run_gets_no_retry() {
        let controller = controller();
        let job = controller.queue.enqueue(NewJob::new("story")).unwrap();
        let (job, run) = run_to(&controller, &job, RunStatus::Completed);
        assert!(controller.on_job_failed(&job, &run).unwrap().is_none());
    }

    #[test]
    fn test_retry_copies_job() {
        let controller = controller();
        let params = json!({"prompt": "the lighthouse keeper"})
            .as_object()
            .cloned()
            .unwrap();
        let job = controller
            .queue
            .enqueue(NewJob::new("story").with_params(params.clone()).with_priority(4))
            .unwrap();
        let (job, run) = run_to(&controller, &job, RunStatus::Failed);

        let retry = controller.on_job_failed(&job, &run).unwrap().unwrap();
        assert_eq!(retry.retry_of.as_deref(), Some(job.job_id.as_str()));
        assert_eq!(retry.job_type, "story");
        assert_eq!(retry.priority, 4);
        assert_eq!(retry.params, params);

        // Second call sees the existing retry.
        assert!(controller.on_job_failed(&job, &run).unwrap().is_none());
    }

    #[test]
    fn test_template_limits_attempts() {
        let controller = controller();
        let template = controller
            .queue
            .store()
            .create_template(&NewTemplate::new("once", "story").with_retry_policy(RetryPolicy {
                max_attempts: 1,
                base_delay_secs: 1,
            }))
            .unwrap();
        let job = controller
            .queue
            .enqueue(NewJob::new("story").with_template(template.template_id))
            .unwrap();
        let (job, run) = run_to(&controller, &job, RunStatus::Failed);
        assert!(controller.on_job_failed(&job, &run).unwrap().is_none());

        let manual = controller.manual_retry(&run.run_id, Some(9)).unwrap();
        assert_eq!(manual.priority, 9);
        assert_eq!(manual.retry_of.as_deref(), Some(job.job_id.as_str()));
    }

    #[test]
    fn test_manual_retry_requires_failed_run() {
        let controller = controller();
        let job = controller.queue.enqueue(NewJob::new("story")).unwrap();
        let (_, run) = run_to(&controller, &job, RunStatus::Skipped);
        assert!(matches!(
            controller.manual_retry(&run.run_id, None),
            Err(SchedulerError::InvalidOperation(_))
        ));
        assert!(matches!(
            controller.manual_retry("missing", None),
            Err(SchedulerError::JobRunNotFound(_))
        ));
    }

    #[test]
    fn test_manual_retry_uses_snapshot() {
        let controller = controller();
        let original = json!({"prompt": "a"}).as_object().cloned().unwrap();
        let job = controller
            .queue
            .enqueue(NewJob::new("story").with_params(original.clone()))
            .unwrap();
        let (_, run) = run_to(&controller, &job, RunStatus::Failed);

        let retry = controller.manual_retry(&run.run_id, None).unwrap();
        assert_eq!(retry.params, original);
    }

    #[test]
    fn test_recover_orphaned_retries_is_idempotent() {
        let controller = controller();
        let job = controller.queue.enqueue(NewJob::new("story")).unwrap();
        run_to(&controller, &job, RunStatus::Failed);

        assert_eq!(controller.recover_orphaned_retries().unwrap(), 1);
        assert_eq!(controller.recover_orphaned_retries().unwrap(), 0);
    }

    #[test]
    fn test_huge_base_delay_still_retries() {
        let queue = QueueManager::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        let controller = RetryController::new(
            queue,
            RetryPolicy {
                max_attempts: 3,
                base_delay_secs: u64::MAX,
            },
        );
        let job = controller.queue.enqueue(NewJob::new("story")).unwrap();
        let (job, run) = run_to(&controller, &job, RunStatus::Failed);

        let retry = controller.on_job_failed(&job, &run).unwrap();
        assert!(retry.is_some());
        assert_eq!(
            controller.next_retry_delay(&job).unwrap().num_seconds(),
            crate::types::MAX_RETRY_DELAY_SECS as i64
        );
    }

    #[test]
    fn test_next_retry_delay_grows_along_chain() {
        let controller = controller();
        let job = controller.queue.enqueue(NewJob::new("story")).unwrap();
        let first = controller.next_retry_delay(&job).unwrap();
        let (job, run) = run_to(&controller, &job, RunStatus::Failed);
        let retry = controller.on_job_failed(&job, &run).unwrap().unwrap();
        assert_eq!(controller.next_retry_delay(&retry).unwrap(), first * 2);
    }
}
