//! Subprocess handler: runs one configured program per job type.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::HandlerError;
use crate::executor::{HandlerOutcome, JobHandler};
use crate::types::Job;

/// Log lines with this prefix name an artifact the job produced.
pub const ARTIFACT_PREFIX: &str = "ARTIFACT:";

/// Program and arguments for one job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Kill the process if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Parse `TYPE=PROGRAM [ARGS...]` as given on the command line.
    pub fn parse_assignment(value: &str) -> Result<(String, CommandSpec), String> {
        let (job_type, command) = value
            .split_once('=')
            .ok_or_else(|| format!("expected TYPE=PROGRAM, got {value:?}"))?;
        let job_type = job_type.trim();
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| format!("no program given for job type {job_type:?}"))?;
        if job_type.is_empty() {
            return Err(format!("empty job type in {value:?}"));
        }
        Ok((
            job_type.to_string(),
            CommandSpec::new(program).with_args(words),
        ))
    }
}

/// Collect `ARTIFACT:` lines from a job's log output.
pub fn parse_artifacts(log: &str) -> Vec<String> {
    log.lines()
        .filter_map(|line| line.trim().strip_prefix(ARTIFACT_PREFIX))
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs jobs as child processes.
///
/// The job is described to the child through `NIGHTJAR_JOB_ID`,
/// `NIGHTJAR_JOB_TYPE`, `NIGHTJAR_PARAMS` (JSON) and `NIGHTJAR_LOG_PATH`.
/// Both stdout and stderr go to the run's log file.
#[derive(Default)]
pub struct CommandHandler {
    commands: HashMap<String, CommandSpec>,
    current: Mutex<Option<Arc<Notify>>>,
}

impl CommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, job_type: impl Into<String>, spec: CommandSpec) -> Self {
        self.commands.insert(job_type.into(), spec);
        self
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    fn set_current(&self, notify: Option<Arc<Notify>>) {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = notify;
    }

    fn build(&self, spec: &CommandSpec, job: &Job, log_path: &Path) -> Result<Command, HandlerError> {
        let stdout = File::create(log_path)?;
        let stderr = stdout.try_clone()?;
        let params = serde_json::to_string(&job.params)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env("NIGHTJAR_JOB_ID", &job.job_id)
            .env("NIGHTJAR_JOB_TYPE", &job.job_type)
            .env("NIGHTJAR_PARAMS", params)
            .env("NIGHTJAR_LOG_PATH", log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn execute(&self, job: &Job, log_path: &Path) -> Result<HandlerOutcome, HandlerError> {
        let spec = self
            .commands
            .get(&job.job_type)
            .ok_or_else(|| HandlerError::UnknownJobType(job.job_type.clone()))?;

        let mut child = self
            .build(spec, job, log_path)?
            .spawn()
            .map_err(|source| HandlerError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        debug!(job_id = %job.job_id, program = %spec.program, pid = ?child.id(), "spawned job process");

        let notify = Arc::new(Notify::new());
        self.set_current(Some(Arc::clone(&notify)));
        let deadline = async {
            match spec.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Ok(status),
            _ = notify.notified() => Err("cancelled".to_string()),
            _ = deadline => Err(format!(
                "timed out after {:?}",
                spec.timeout.unwrap_or_default()
            )),
        };
        self.set_current(None);

        let status = match waited {
            Ok(status) => status?,
            Err(reason) => {
                if let Err(e) = child.kill().await {
                    warn!(job_id = %job.job_id, error = %e, "failed to kill job process");
                }
                info!(job_id = %job.job_id, reason = %reason, "job process stopped");
                return Ok(HandlerOutcome::failed(format!("{} {reason}", spec.program)));
            }
        };

        // Child output need not be valid UTF-8.
        let artifacts = match tokio::fs::read(log_path).await {
            Ok(bytes) => parse_artifacts(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                warn!(job_id = %job.job_id, log_path = %log_path.display(), error = %e, "failed to read job log");
                Vec::new()
            }
        };

        let outcome = match status.code() {
            Some(0) => HandlerOutcome::completed().with_exit_code(0),
            Some(code) => HandlerOutcome::failed(format!("{} exited with status {code}", spec.program))
                .with_exit_code(code),
            None => HandlerOutcome::failed(format!("{} terminated by signal", spec.program)),
        };
        Ok(outcome.with_artifacts(artifacts))
    }

    fn cancel(&self) -> bool {
        let current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match current.as_ref() {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }
}
