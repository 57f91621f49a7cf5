//! Startup recovery after a crash or unclean shutdown.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::retry::RetryController;
use crate::store::{RunningJobRecovery, SqliteStore};

/// Error recorded on runs closed out by recovery.
pub const RECOVERY_REASON: &str = "scheduler crash recovery";

/// What a recovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// RUNNING jobs that had no run; a FAILED one was created.
    pub runs_created: usize,
    /// Open runs forced to FAILED.
    pub runs_failed: usize,
    /// Jobs whose run had finished but `finished_at` was never copied over.
    pub finished_at_backfilled: usize,
    pub reservations_expired: usize,
    pub retries_created: usize,
    /// Failures that did not stop the pass.
    pub errors: Vec<String>,
}

impl RecoveryReport {
    /// Whether recovery found nothing to do.
    pub fn is_clean(&self) -> bool {
        self.runs_created == 0
            && self.runs_failed == 0
            && self.finished_at_backfilled == 0
            && self.reservations_expired == 0
            && self.retries_created == 0
            && self.errors.is_empty()
    }
}

/// Brings persisted state back to consistency before the worker starts.
///
/// Every phase is idempotent: running recovery twice changes nothing the
/// second time.
pub struct RecoveryManager {
    store: Arc<SqliteStore>,
    retry: RetryController,
}

impl RecoveryManager {
    pub fn new(store: Arc<SqliteStore>, retry: RetryController) -> Self {
        Self { store, retry }
    }

    /// Run all phases. A failing phase is logged and reported, and the
    /// remaining phases still run.
    #[tracing::instrument(skip(self))]
    pub fn recover_on_startup(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        self.recover_running_jobs(&mut report);
        self.expire_reservations(&mut report);
        self.recover_retries(&mut report);

        if report.is_clean() {
            info!("recovery found nothing to repair");
        } else {
            info!(
                runs_created = report.runs_created,
                runs_failed = report.runs_failed,
                finished_at_backfilled = report.finished_at_backfilled,
                reservations_expired = report.reservations_expired,
                retries_created = report.retries_created,
                errors = report.errors.len(),
                "recovery complete"
            );
        }
        report
    }

    /// Phase 1: nothing can be running yet, so every RUNNING job was
    /// interrupted.
    fn recover_running_jobs(&self, report: &mut RecoveryReport) {
        let jobs = match self.store.list_running_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to list running jobs");
                report.errors.push(format!("running jobs: {e}"));
                return;
            }
        };

        for job in jobs {
            match self.store.recover_running_job(&job.job_id, RECOVERY_REASON) {
                Ok(Some(RunningJobRecovery::CreatedFailedRun)) => {
                    warn!(job_id = %job.job_id, "interrupted before run was recorded");
                    report.runs_created += 1;
                }
                Ok(Some(RunningJobRecovery::FailedOpenRun)) => {
                    warn!(job_id = %job.job_id, "interrupted mid-run");
                    report.runs_failed += 1;
                }
                Ok(Some(RunningJobRecovery::BackfilledFinishedAt)) => {
                    info!(job_id = %job.job_id, "backfilled finished_at");
                    report.finished_at_backfilled += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "failed to recover running job");
                    report.errors.push(format!("job {}: {e}", job.job_id));
                }
            }
        }
    }

    /// Phase 2: any reservation was held by a caller that is gone now.
    fn expire_reservations(&self, report: &mut RecoveryReport) {
        let reservations = match self.store.list_active_reservations() {
            Ok(reservations) => reservations,
            Err(e) => {
                warn!(error = %e, "failed to list active reservations");
                report.errors.push(format!("reservations: {e}"));
                return;
            }
        };

        let now = Utc::now();
        for reservation in reservations {
            match self.store.expire_reservation(&reservation.reservation_id) {
                Ok(_) => {
                    info!(
                        reservation_id = %reservation.reservation_id,
                        reserved_by = %reservation.reserved_by,
                        timed_out = reservation.is_expired_at(now),
                        "expired orphaned reservation"
                    );
                    report.reservations_expired += 1;
                }
                Err(e) => {
                    warn!(reservation_id = %reservation.reservation_id, error = %e, "failed to expire reservation");
                    report
                        .errors
                        .push(format!("reservation {}: {e}", reservation.reservation_id));
                }
            }
        }
    }

    /// Phase 3: failures whose retry was never created.
    fn recover_retries(&self, report: &mut RecoveryReport) {
        match self.retry.recover_orphaned_retries() {
            Ok(created) => report.retries_created = created,
            Err(e) => {
                warn!(error = %e, "failed to recover retries");
                report.errors.push(format!("retries: {e}"));
            }
        }
    }
}
