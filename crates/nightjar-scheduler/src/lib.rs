//! Crash-safe, single-worker job scheduler for nightjar.
//!
//! Story and research generation runs are queued in SQLite, dispatched one
//! at a time in priority order, retried with exponential backoff, and
//! recovered idempotently after a crash. Synchronous callers can reserve the
//! next execution slot without preempting the job in flight.

mod command;
mod config;
mod dispatcher;
mod error;
mod executor;
mod queue;
mod recovery;
mod retry;
mod service;
mod store;
mod types;

pub use command::{ARTIFACT_PREFIX, CommandHandler, CommandSpec, parse_artifacts};
pub use config::SchedulerConfig;
pub use dispatcher::{CompletionCallback, CycleOutcome, Dispatcher, DispatcherState};
pub use error::{HandlerError, SchedulerError};
pub use executor::{Executor, HandlerOutcome, JobHandler, SkipHandler};
pub use queue::{DEFAULT_RESERVATION_EXPIRY, QueueManager};
pub use recovery::{RECOVERY_REASON, RecoveryManager, RecoveryReport};
pub use retry::RetryController;
pub use service::SchedulerService;
pub use store::{RetryChain, RunningJobRecovery, SqliteStore};
pub use types::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_SECS, DirectReservation, GroupStatus, Job,
    JobGroup, JobParams, JobRun, JobRunUpdate, JobStatus, JobTemplate, JobUpdate,
    MAX_RETRY_DELAY_SECS, MemberState, NewJob, NewTemplate, POSITION_GAP, QueueStats,
    ReservationStatus, RetryPolicy, RunFilter, RunStatus, Schedule, TemplateUpdate,
};
