//! The scheduler facade consumed by outer layers (CLI, HTTP).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::dispatcher::{CompletionCallback, Dispatcher, DispatcherState};
use crate::executor::{Executor, JobHandler};
use crate::queue::QueueManager;
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::retry::RetryController;
use crate::store::SqliteStore;
use crate::types::{
    DirectReservation, Job, JobGroup, JobParams, JobRun, JobTemplate, NewJob, NewTemplate,
    QueueStats, RunFilter, RunStatus, Schedule, TemplateUpdate,
};
use crate::SchedulerError;

/// Owns every scheduler component and their lifecycle.
pub struct SchedulerService {
    store: Arc<SqliteStore>,
    queue: QueueManager,
    retry: RetryController,
    recovery: RecoveryManager,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(
        store: Arc<SqliteStore>,
        handler: Arc<dyn JobHandler>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_completion_hooks(store, handler, config, Vec::new())
    }

    /// Like [`new`](Self::new), with extra hooks run after every execution
    /// (after retry evaluation).
    pub fn with_completion_hooks(
        store: Arc<SqliteStore>,
        handler: Arc<dyn JobHandler>,
        config: SchedulerConfig,
        hooks: Vec<CompletionCallback>,
    ) -> Self {
        let queue = QueueManager::new(Arc::clone(&store))
            .with_reservation_expiry(config.reservation_expiry);
        let retry = RetryController::new(queue.clone(), config.default_retry_policy);
        let recovery = RecoveryManager::new(Arc::clone(&store), retry.clone());
        let executor = Executor::new(Arc::clone(&store), handler, config.log_dir.clone());

        let on_failure = retry.clone();
        let mut dispatcher = Dispatcher::new(queue.clone(), executor, config.poll_interval)
            .with_completion_callback(Arc::new(move |job: &Job, run: &JobRun| {
                if run.status != Some(RunStatus::Failed) {
                    return;
                }
                if let Err(e) = on_failure.on_job_failed(job, run) {
                    error!(job_id = %job.job_id, run_id = %run.run_id, error = %e, "retry evaluation failed");
                }
            }));
        for hook in hooks {
            dispatcher = dispatcher.with_completion_callback(hook);
        }

        Self {
            store,
            queue,
            retry,
            recovery,
            dispatcher: Arc::new(dispatcher),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the worker, optionally recovering first.
    ///
    /// With `blocking` this resolves only once the worker has stopped.
    pub async fn start(
        &self,
        run_recovery: bool,
        blocking: bool,
    ) -> Result<Option<RecoveryReport>, SchedulerError> {
        if self.dispatcher.state() != DispatcherState::Stopped {
            return Err(SchedulerError::InvalidOperation(
                "scheduler is already running".to_string(),
            ));
        }
        let report = run_recovery.then(|| self.recovery.recover_on_startup());
        self.dispatcher.start().await?;
        if blocking {
            self.dispatcher.wait_stopped().await;
        }
        Ok(report)
    }

    /// Stop the worker, waiting up to `timeout` (or the configured stop
    /// timeout) for the in-flight job.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), SchedulerError> {
        self.dispatcher
            .stop(timeout.unwrap_or(self.config.stop_timeout))
            .await
    }

    /// Run startup recovery without starting the worker.
    ///
    /// Recovery assumes nothing else is executing. A RUNNING job or an
    /// unexpired reservation may belong to a live worker on the same
    /// database, so either one refuses unless `force` is set.
    pub fn recover_offline(&self, force: bool) -> Result<RecoveryReport, SchedulerError> {
        if self.dispatcher.state() != DispatcherState::Stopped {
            return Err(SchedulerError::InvalidOperation(
                "recovery cannot run while this scheduler is running".to_string(),
            ));
        }
        if !force {
            let running = self.store.list_running_jobs()?;
            if let Some(job) = running.first() {
                return Err(SchedulerError::InvalidOperation(format!(
                    "{} job(s) RUNNING (first: {}), a worker may still be executing; use force to recover anyway",
                    running.len(),
                    job.job_id
                )));
            }
            if let Some(reservation) = self.queue.active_reservation()? {
                return Err(SchedulerError::InvalidOperation(format!(
                    "reservation {} held by {} is active until {}; use force to recover anyway",
                    reservation.reservation_id, reservation.reserved_by, reservation.expires_at
                )));
            }
        }
        Ok(self.recovery.recover_on_startup())
    }

    pub fn dispatcher_state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    pub fn current_job(&self) -> Option<String> {
        self.dispatcher.current_job()
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn create_template(&self, new: &NewTemplate) -> Result<JobTemplate, SchedulerError> {
        let template = self.store.create_template(new)?;
        info!(template_id = %template.template_id, name = %template.name, "template created");
        Ok(template)
    }

    pub fn get_template(&self, template_id: &str) -> Result<JobTemplate, SchedulerError> {
        self.store.get_template(template_id)
    }

    pub fn get_template_by_name(&self, name: &str) -> Result<Option<JobTemplate>, SchedulerError> {
        self.store.get_template_by_name(name)
    }

    pub fn list_templates(&self) -> Result<Vec<JobTemplate>, SchedulerError> {
        self.store.list_templates()
    }

    pub fn update_template(
        &self,
        template_id: &str,
        update: &TemplateUpdate,
    ) -> Result<JobTemplate, SchedulerError> {
        self.store.update_template(template_id, update)
    }

    pub fn delete_template(&self, template_id: &str) -> Result<(), SchedulerError> {
        self.store.delete_template(template_id)?;
        info!(template_id, "template deleted");
        Ok(())
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    pub fn create_schedule(
        &self,
        template_id: &str,
        name: &str,
        trigger: &Value,
    ) -> Result<Schedule, SchedulerError> {
        self.store.create_schedule(template_id, name, trigger)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Result<Schedule, SchedulerError> {
        self.store.get_schedule(schedule_id)
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>, SchedulerError> {
        self.store.list_schedules()
    }

    pub fn set_schedule_enabled(
        &self,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<Schedule, SchedulerError> {
        self.store.set_schedule_enabled(schedule_id, enabled)
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        self.store.delete_schedule(schedule_id)
    }

    /// Enqueue a job because a schedule's trigger fired.
    pub fn fire_schedule(
        &self,
        schedule_id: &str,
        overrides: JobParams,
    ) -> Result<Job, SchedulerError> {
        self.queue.fire_schedule(schedule_id, overrides)
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn create_group(&self, name: &str) -> Result<JobGroup, SchedulerError> {
        self.store.create_group(name)
    }

    pub fn get_group(&self, group_id: &str) -> Result<JobGroup, SchedulerError> {
        self.store.get_group(group_id)
    }

    pub fn list_group_jobs(&self, group_id: &str) -> Result<Vec<Job>, SchedulerError> {
        self.store.list_group_jobs(group_id)
    }

    pub fn list_active_groups(&self) -> Result<Vec<JobGroup>, SchedulerError> {
        self.store.list_active_groups()
    }

    // =========================================================================
    // Jobs and runs
    // =========================================================================

    pub fn enqueue_job(&self, new: NewJob) -> Result<Job, SchedulerError> {
        self.queue.enqueue(new)
    }

    pub fn enqueue_from_template(
        &self,
        template_id: &str,
        overrides: JobParams,
        priority: Option<i32>,
    ) -> Result<Job, SchedulerError> {
        self.queue
            .enqueue_from_template(template_id, overrides, priority)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, SchedulerError> {
        self.store.get_job(job_id)
    }

    pub fn get_job_run(&self, run_id: &str) -> Result<JobRun, SchedulerError> {
        self.store.get_job_run(run_id)
    }

    pub fn get_job_run_for_job(&self, job_id: &str) -> Result<Option<JobRun>, SchedulerError> {
        self.store.get_job_run_for_job(job_id)
    }

    /// Cancel a QUEUED job.
    pub fn cancel_job(&self, job_id: &str) -> Result<Job, SchedulerError> {
        self.queue.cancel(job_id)
    }

    /// Ask the handler running `job_id` to stop. Returns whether a signal
    /// was delivered; the run is recorded by the executor as usual.
    pub fn cancel_running_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
        self.store.get_job(job_id)?;
        Ok(self.dispatcher.cancel_running(job_id))
    }

    /// Manually retry a FAILED run.
    pub fn retry_job_run(&self, run_id: &str, priority: Option<i32>) -> Result<Job, SchedulerError> {
        self.retry.manual_retry(run_id, priority)
    }

    /// Close out a QUEUED job as SKIPPED.
    pub async fn skip_job(&self, job_id: &str, reason: &str) -> Result<JobRun, SchedulerError> {
        self.dispatcher.skip_job(job_id, reason).await
    }

    pub fn update_priority(&self, job_id: &str, priority: i32) -> Result<Job, SchedulerError> {
        self.queue.update_priority(job_id, priority)
    }

    pub fn reorder(&self, job_id: &str, position: i64) -> Result<Job, SchedulerError> {
        self.queue.reorder(job_id, position)
    }

    pub fn update_params(&self, job_id: &str, params: JobParams) -> Result<Job, SchedulerError> {
        self.queue.update_params(job_id, params)
    }

    pub fn list_queued_jobs(&self, limit: Option<usize>) -> Result<Vec<Job>, SchedulerError> {
        self.store.list_queued_jobs(limit)
    }

    pub fn list_running_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        self.store.list_running_jobs()
    }

    pub fn list_job_runs(&self, filter: &RunFilter) -> Result<Vec<JobRun>, SchedulerError> {
        self.store.list_job_runs(filter)
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats, SchedulerError> {
        self.store.queue_stats()
    }

    // =========================================================================
    // Direct API
    // =========================================================================

    /// Run a job synchronously, ahead of everything queued.
    pub async fn execute_direct(
        &self,
        job_type: &str,
        params: JobParams,
        reserved_by: &str,
        timeout: Option<Duration>,
    ) -> Result<(Job, JobRun), SchedulerError> {
        self.dispatcher
            .execute_direct(job_type, params, reserved_by, timeout)
            .await
    }

    pub fn reserve_next_slot(
        &self,
        reserved_by: &str,
        expiry: Option<Duration>,
    ) -> Result<DirectReservation, SchedulerError> {
        self.queue.reserve_next_slot(reserved_by, expiry)
    }

    pub fn release_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<DirectReservation, SchedulerError> {
        self.queue.release_reservation(reservation_id)
    }

    pub fn active_reservation(&self) -> Result<Option<DirectReservation>, SchedulerError> {
        self.queue.active_reservation()
    }
}
