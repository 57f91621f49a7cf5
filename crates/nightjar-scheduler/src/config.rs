//! Scheduler configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::queue::DEFAULT_RESERVATION_EXPIRY;
use crate::types::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_SECS, RetryPolicy};

/// Default sleep between polls when the queue is idle.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default time `stop` waits for the worker to exit.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables shared by the scheduler components.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Sleep between dispatch cycles when nothing is dispatchable.
    pub poll_interval: Duration,
    /// How long a direct reservation may block queue dispatch.
    pub reservation_expiry: Duration,
    /// Retry policy for jobs without a template.
    pub default_retry_policy: RetryPolicy,
    /// Directory that receives one log file per run.
    pub log_dir: PathBuf,
    /// How long `stop` waits for the worker to exit.
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reservation_expiry: DEFAULT_RESERVATION_EXPIRY,
            default_retry_policy: RetryPolicy {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                base_delay_secs: DEFAULT_RETRY_BASE_DELAY_SECS,
            },
            log_dir: PathBuf::from("logs"),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reservation_expiry(mut self, reservation_expiry: Duration) -> Self {
        self.reservation_expiry = reservation_expiry;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_retry_policy.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, base_delay: Duration) -> Self {
        self.default_retry_policy.base_delay_secs = base_delay.as_secs();
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}
