//! Queue semantics on top of the store: enqueue, cancel, reorder, and the
//! direct-API reservation lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::store::SqliteStore;
use crate::types::{
    DirectReservation, Job, JobParams, JobTemplate, JobUpdate, NewJob,
};
use crate::SchedulerError;

/// Default lifetime of a reservation.
pub const DEFAULT_RESERVATION_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Merge `overrides` over a template's default params.
fn merge_params(template: &JobTemplate, overrides: JobParams) -> JobParams {
    let mut params = template.default_params.clone();
    params.extend(overrides);
    params
}

/// Queue operations. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<SqliteStore>,
    reservation_expiry: Duration,
}

impl QueueManager {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            reservation_expiry: DEFAULT_RESERVATION_EXPIRY,
        }
    }

    pub fn with_reservation_expiry(mut self, reservation_expiry: Duration) -> Self {
        self.reservation_expiry = reservation_expiry;
        self
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Queue a job at the tail of its priority band.
    pub fn enqueue(&self, new: NewJob) -> Result<Job, SchedulerError> {
        let job = self.store.create_job(&new)?;
        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            priority = job.priority,
            retry_of = ?job.retry_of,
            "job enqueued"
        );
        Ok(job)
    }

    /// Queue a job built from a template, with `overrides` layered over its
    /// default params.
    pub fn enqueue_from_template(
        &self,
        template_id: &str,
        overrides: JobParams,
        priority: Option<i32>,
    ) -> Result<Job, SchedulerError> {
        let template = self.store.get_template(template_id)?;
        let new = NewJob::new(template.job_type.clone())
            .with_params(merge_params(&template, overrides))
            .with_priority(priority.unwrap_or(0))
            .with_template(template.template_id.clone());
        self.enqueue(new)
    }

    /// Queue a job for a schedule whose trigger fired.
    ///
    /// Trigger evaluation happens elsewhere; this only records the firing.
    pub fn fire_schedule(
        &self,
        schedule_id: &str,
        overrides: JobParams,
    ) -> Result<Job, SchedulerError> {
        let schedule = self.store.get_schedule(schedule_id)?;
        if !schedule.enabled {
            return Err(SchedulerError::InvalidOperation(format!(
                "schedule {schedule_id} is disabled"
            )));
        }
        let template = self.store.get_template(&schedule.template_id)?;
        let new = NewJob::new(template.job_type.clone())
            .with_params(merge_params(&template, overrides))
            .with_template(template.template_id.clone())
            .with_schedule(schedule.schedule_id.clone());
        let job = self.enqueue(new)?;
        self.store.record_schedule_fired(schedule_id, job.created_at)?;
        Ok(job)
    }

    // =========================================================================
    // Inspection and mutation
    // =========================================================================

    /// Peek at the next dispatchable job. Dispatch itself must go through
    /// [`SqliteStore::atomic_claim_job`].
    pub fn get_next(&self) -> Result<Option<Job>, SchedulerError> {
        self.store.get_next_dispatchable_job()
    }

    /// Cancel a QUEUED job. Running jobs only support cooperative
    /// cancellation through their handler.
    pub fn cancel(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let job = self.store.cancel_queued_job(job_id)?;
        info!(job_id, "job cancelled");
        Ok(job)
    }

    pub fn update_priority(&self, job_id: &str, priority: i32) -> Result<Job, SchedulerError> {
        let job = self.store.update_job(
            job_id,
            &JobUpdate {
                priority: Some(priority),
                ..JobUpdate::default()
            },
        )?;
        debug!(job_id, priority, position = job.position, "job priority changed");
        Ok(job)
    }

    pub fn reorder(&self, job_id: &str, position: i64) -> Result<Job, SchedulerError> {
        let job = self.store.update_job(
            job_id,
            &JobUpdate {
                position: Some(position),
                ..JobUpdate::default()
            },
        )?;
        debug!(job_id, position, "job reordered");
        Ok(job)
    }

    pub fn update_params(&self, job_id: &str, params: JobParams) -> Result<Job, SchedulerError> {
        self.store.update_job(
            job_id,
            &JobUpdate {
                params: Some(params),
                ..JobUpdate::default()
            },
        )
    }

    // =========================================================================
    // Direct-API reservations
    // =========================================================================

    /// Reserve the next execution slot. While the reservation is ACTIVE the
    /// dispatcher starts no queued jobs; a job already running is not
    /// interrupted.
    pub fn reserve_next_slot(
        &self,
        reserved_by: &str,
        expiry: Option<Duration>,
    ) -> Result<DirectReservation, SchedulerError> {
        let reservation = self
            .store
            .create_reservation(reserved_by, expiry.unwrap_or(self.reservation_expiry))?;
        info!(
            reservation_id = %reservation.reservation_id,
            reserved_by,
            expires_at = %reservation.expires_at,
            "next slot reserved"
        );
        Ok(reservation)
    }

    pub fn release_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<DirectReservation, SchedulerError> {
        let reservation = self.store.release_reservation(reservation_id)?;
        info!(reservation_id, "reservation released");
        Ok(reservation)
    }

    pub fn expire_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<DirectReservation, SchedulerError> {
        let reservation = self.store.expire_reservation(reservation_id)?;
        info!(reservation_id, "reservation expired");
        Ok(reservation)
    }

    /// The live reservation, after expiring any that timed out.
    pub fn active_reservation(&self) -> Result<Option<DirectReservation>, SchedulerError> {
        let expired = self.store.expire_stale_reservations(Utc::now())?;
        if expired > 0 {
            info!(count = expired, "expired stale reservations");
        }
        self.store.get_active_reservation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, NewTemplate};
    use serde_json::json;

    fn queue() -> QueueManager {
        QueueManager::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    fn params(value: serde_json::Value) -> JobParams {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_template_overrides_win() {
        let queue = queue();
        let template = queue
            .store()
            .create_template(
                &NewTemplate::new("story", "story")
                    .with_default_params(params(json!({"length": "short", "tone": "eerie"}))),
            )
            .unwrap();

        let job = queue
            .enqueue_from_template(
                &template.template_id,
                params(json!({"length": "long"})),
                Some(2),
            )
            .unwrap();
        assert_eq!(job.job_type, "story");
        assert_eq!(job.priority, 2);
        assert_eq!(job.params["length"], json!("long"));
        assert_eq!(job.params["tone"], json!("eerie"));
        assert_eq!(job.template_id.as_deref(), Some(template.template_id.as_str()));
    }

    #[test]
    fn test_fire_schedule() {
        let queue = queue();
        let template = queue
            .store()
            .create_template(&NewTemplate::new("research", "research"))
            .unwrap();
        let schedule = queue
            .store()
            .create_schedule(&template.template_id, "hourly", &json!({"every": "1h"}))
            .unwrap();

        let job = queue
            .fire_schedule(&schedule.schedule_id, JobParams::new())
            .unwrap();
        assert_eq!(job.schedule_id.as_deref(), Some(schedule.schedule_id.as_str()));
        assert!(
            queue
                .store()
                .get_schedule(&schedule.schedule_id)
                .unwrap()
                .last_fired_at
                .is_some()
        );

        queue
            .store()
            .set_schedule_enabled(&schedule.schedule_id, false)
            .unwrap();
        assert!(matches!(
            queue.fire_schedule(&schedule.schedule_id, JobParams::new()),
            Err(SchedulerError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_reorder_changes_dispatch_order() {
        let queue = queue();
        let first = queue.enqueue(NewJob::new("story")).unwrap();
        let second = queue.enqueue(NewJob::new("story")).unwrap();

        queue.reorder(&second.job_id, first.position - 1).unwrap();
        assert_eq!(queue.get_next().unwrap().unwrap().job_id, second.job_id);
    }

    #[test]
    fn test_reorder_dispatched_job_fails() {
        let queue = queue();
        let job = queue.enqueue(NewJob::new("story")).unwrap();
        queue.store().atomic_claim_job(&job.job_id).unwrap();

        assert!(matches!(
            queue.reorder(&job.job_id, 1),
            Err(SchedulerError::InvalidOperation(_))
        ));
        assert!(matches!(
            queue.update_priority(&job.job_id, 9),
            Err(SchedulerError::InvalidOperation(_))
        ));
        assert!(matches!(
            queue.cancel(&job.job_id),
            Err(SchedulerError::InvalidOperation(_))
        ));
        assert_eq!(
            queue.store().get_job(&job.job_id).unwrap().status,
            JobStatus::Running
        );
    }

    #[test]
    fn test_stale_reservation_does_not_pause() {
        let queue = queue().with_reservation_expiry(Duration::ZERO);
        queue.reserve_next_slot("api", None).unwrap();
        assert!(queue.active_reservation().unwrap().is_none());
    }
}
