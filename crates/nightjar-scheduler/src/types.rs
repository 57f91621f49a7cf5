//! Scheduler types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Opaque job parameters.
pub type JobParams = serde_json::Map<String, serde_json::Value>;

/// Distance between adjacent queue positions within a priority band.
pub const POSITION_GAP: i64 = 100;

/// Attempts allowed when a job has no template (or its template sets none).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for retry backoff when nothing else is configured.
pub const DEFAULT_RETRY_BASE_DELAY_SECS: u64 = 60;

/// Longest backoff ever reported, one week.
pub const MAX_RETRY_DELAY_SECS: u64 = 7 * 24 * 60 * 60;

/// Lifecycle status of a job.
///
/// A job has no "completed" state of its own: it is terminal once it is
/// cancelled or its `finished_at` has been backfilled from its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Terminal outcome of a job run. A run without one is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Status of a direct-API reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Released => "RELEASED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "RELEASED" => Some(Self::Released),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Derived status of a job group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    Created,
    Queued,
    Running,
    Completed,
    Partial,
    Cancelled,
}

impl GroupStatus {
    /// Whether no member of the group can still change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Cancelled)
    }
}

/// State of one group member, as seen when deriving the group status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Queued,
    Running,
    Cancelled,
    /// The job's run is over; `None` if the run outcome is unknown.
    Finished(Option<RunStatus>),
}

impl MemberState {
    /// Classify a job together with the status of its run, if any.
    pub fn of(job: &Job, run_status: Option<RunStatus>) -> Self {
        Self::from_parts(job.status, job.finished_at.is_some(), run_status)
    }

    pub fn from_parts(status: JobStatus, finished: bool, run_status: Option<RunStatus>) -> Self {
        match status {
            JobStatus::Queued => Self::Queued,
            JobStatus::Cancelled => Self::Cancelled,
            JobStatus::Running if finished => Self::Finished(run_status),
            JobStatus::Running => Self::Running,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished(_))
    }
}

impl GroupStatus {
    /// Derive a group's status from its members.
    pub fn derive(members: &[MemberState]) -> Self {
        if members.is_empty() {
            return Self::Created;
        }
        if members.iter().all(|m| *m == MemberState::Cancelled) {
            return Self::Cancelled;
        }
        if members.iter().any(|m| *m == MemberState::Running) {
            return Self::Running;
        }
        // Nothing has run yet; cancelled members do not start the group.
        if members
            .iter()
            .all(|m| matches!(m, MemberState::Queued | MemberState::Cancelled))
        {
            return Self::Queued;
        }
        if !members.iter().all(MemberState::is_terminal) {
            // Some members done, some still waiting their turn.
            return Self::Running;
        }
        let clean = members.iter().all(|m| {
            matches!(
                m,
                MemberState::Finished(Some(RunStatus::Completed | RunStatus::Skipped))
            )
        });
        if clean { Self::Completed } else { Self::Partial }
    }
}

/// A queued or executing unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// What kind of work this is (e.g. `story`, `research`).
    pub job_type: String,
    pub params: JobParams,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Order within a priority band; lower runs first.
    pub position: i64,
    pub template_id: Option<String>,
    pub schedule_id: Option<String>,
    pub group_id: Option<String>,
    pub sequence_number: Option<i64>,
    /// The job this one retries.
    pub retry_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Cancelled || self.finished_at.is_some()
    }
}

/// Record of the single execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: String,
    pub job_id: String,
    /// The job's params as they were when the job was claimed.
    pub params_snapshot: JobParams,
    /// `None` while the run is in flight.
    pub status: Option<RunStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub artifacts: Option<Vec<String>>,
    pub log_path: Option<String>,
}

impl JobRun {
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }
}

/// Field-level update of a queued job. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub params: Option<JobParams>,
    pub priority: Option<i32>,
    pub position: Option<i64>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        self.params.is_none() && self.priority.is_none() && self.position.is_none()
    }
}

/// Field-level update of a job run. Every field is write-once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRunUpdate {
    pub status: Option<RunStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub artifacts: Option<Vec<String>>,
    pub log_path: Option<String>,
}

impl JobRunUpdate {
    /// Terminal update stamped with the current time.
    pub fn finish(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.finished_at.is_none()
            && self.exit_code.is_none()
            && self.error.is_none()
            && self.artifacts.is_none()
            && self.log_path.is_none()
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub params: JobParams,
    pub priority: i32,
    pub template_id: Option<String>,
    pub schedule_id: Option<String>,
    pub group_id: Option<String>,
    /// Explicit place in the group; defaults to after the last member.
    pub sequence_number: Option<i64>,
    pub retry_of: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            params: JobParams::new(),
            priority: 0,
            template_id: None,
            schedule_id: None,
            group_id: None,
            sequence_number: None,
            retry_of: None,
        }
    }

    pub fn with_params(mut self, params: JobParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn retrying(mut self, job_id: impl Into<String>) -> Self {
        self.retry_of = Some(job_id.into());
        self
    }
}

/// Token that pauses queue dispatch so a synchronous caller runs next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectReservation {
    pub reservation_id: String,
    pub reserved_by: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ReservationStatus,
}

impl DirectReservation {
    /// Whether the reservation's expiry has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A set of jobs that run in strict sequence order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobGroup {
    pub group_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Derived from the members when the group is read.
    pub status: GroupStatus,
}

/// Retry settings carried by a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_secs: DEFAULT_RETRY_BASE_DELAY_SECS,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base_delay * 2^attempt_count`, capped at
    /// [`MAX_RETRY_DELAY_SECS`].
    pub fn calculate_retry_delay(&self, attempt_count: u32) -> Duration {
        let factor = 1u64 << attempt_count.min(30);
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY_SECS);
        Duration::seconds(secs as i64)
    }
}

/// Reusable job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub template_id: String,
    pub name: String,
    pub job_type: String,
    pub default_params: JobParams,
    pub retry_policy: RetryPolicy,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a template.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTemplate {
    pub name: String,
    pub job_type: String,
    pub default_params: JobParams,
    pub retry_policy: RetryPolicy,
    pub description: Option<String>,
}

impl NewTemplate {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            default_params: JobParams::new(),
            retry_policy: RetryPolicy::default(),
            description: None,
        }
    }

    pub fn with_default_params(mut self, params: JobParams) -> Self {
        self.default_params = params;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update of a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateUpdate {
    pub name: Option<String>,
    pub job_type: Option<String>,
    pub default_params: Option<JobParams>,
    pub retry_policy: Option<RetryPolicy>,
    pub description: Option<String>,
}

/// Binds a template to a trigger evaluated outside the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub template_id: String,
    pub name: String,
    /// Trigger definition, opaque to the scheduler.
    pub trigger: serde_json::Value,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing job runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFilter {
    pub job_id: Option<String>,
    pub job_type: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub cancelled: u64,
    pub completed_runs: u64,
    pub failed_runs: u64,
    pub skipped_runs: u64,
    pub active_reservation: Option<DirectReservation>,
}
