//! Runs one claimed job through a handler and records the outcome.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::store::SqliteStore;
use crate::types::{Job, JobRun, JobRunUpdate, RunStatus};
use crate::SchedulerError;

/// What a handler reports when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub artifacts: Vec<String>,
}

impl HandlerOutcome {
    pub fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            error: None,
            exit_code: None,
            artifacts: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
            exit_code: None,
            artifacts: Vec::new(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            error: Some(reason.into()),
            exit_code: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    fn into_update(self) -> JobRunUpdate {
        let mut update = JobRunUpdate::finish(self.status).with_exit_code(self.exit_code);
        update.error = self.error;
        if !self.artifacts.is_empty() {
            update.artifacts = Some(self.artifacts);
        }
        update
    }
}

/// Does the actual work of a job.
///
/// Handlers may fail or panic; the executor records either as a FAILED run.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run `job`, writing its output to `log_path`.
    async fn execute(&self, job: &Job, log_path: &Path) -> Result<HandlerOutcome, HandlerError>;

    /// Ask the in-flight execution to stop. Returns whether anything was
    /// signalled.
    fn cancel(&self) -> bool {
        false
    }
}

/// Reports every job as SKIPPED without doing anything.
#[derive(Debug, Clone)]
pub struct SkipHandler {
    reason: String,
}

impl SkipHandler {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl JobHandler for SkipHandler {
    async fn execute(&self, job: &Job, _log_path: &Path) -> Result<HandlerOutcome, HandlerError> {
        debug!(job_id = %job.job_id, reason = %self.reason, "skipping job");
        Ok(HandlerOutcome::skipped(self.reason.clone()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Executes claimed jobs. Never lets a handler failure escape.
pub struct Executor {
    store: Arc<SqliteStore>,
    handler: Arc<dyn JobHandler>,
    log_dir: PathBuf,
}

impl Executor {
    pub fn new(
        store: Arc<SqliteStore>,
        handler: Arc<dyn JobHandler>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            handler,
            log_dir: log_dir.into(),
        }
    }

    /// Where the log for `run` goes.
    pub fn log_path_for(&self, job: &Job, run: &JobRun) -> PathBuf {
        self.log_dir
            .join(format!("{}-{}.log", job.job_type, run.run_id))
    }

    /// Run a claimed job with the configured handler.
    pub async fn execute(&self, job: &Job, run: JobRun) -> Result<JobRun, SchedulerError> {
        self.execute_with(Arc::clone(&self.handler), job, run).await
    }

    /// Run a claimed job with `handler` and write the terminal run.
    ///
    /// Only storage failures are returned as errors; anything the handler
    /// does ends up as the run's status.
    #[tracing::instrument(skip(self, handler, job, run), fields(job_id = %job.job_id, run_id = %run.run_id))]
    pub async fn execute_with(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &Job,
        run: JobRun,
    ) -> Result<JobRun, SchedulerError> {
        let log_path = self.log_path_for(job, &run);
        self.store.update_job_run(
            &run.run_id,
            &JobRunUpdate {
                log_path: Some(log_path.display().to_string()),
                ..JobRunUpdate::default()
            },
        )?;
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            warn!(log_dir = %self.log_dir.display(), error = %e, "failed to create log directory");
        }

        info!(job_type = %job.job_type, log_path = %log_path.display(), "executing job");
        let task_job = job.clone();
        let task = tokio::spawn(async move { handler.execute(&task_job, &log_path).await });

        let outcome = match task.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "job handler failed");
                HandlerOutcome::failed(e.to_string())
            }
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic().as_ref());
                error!(panic = %message, "job handler panicked");
                HandlerOutcome::failed(format!("handler panicked: {message}"))
            }
            Err(join) => {
                error!(error = %join, "job handler task aborted");
                HandlerOutcome::failed(format!("handler task aborted: {join}"))
            }
        };

        let status = outcome.status;
        let run = self
            .store
            .update_job_run(&run.run_id, &outcome.into_update())?;
        info!(status = status.as_str(), exit_code = ?run.exit_code, "job finished");
        Ok(run)
    }

    /// Forward a cancel request to the handler.
    pub fn cancel_current(&self) -> bool {
        self.handler.cancel()
    }
}
