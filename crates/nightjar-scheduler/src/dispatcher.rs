//! The single worker: polls the queue, claims the head, and runs it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::executor::{Executor, JobHandler, SkipHandler};
use crate::queue::QueueManager;
use crate::types::{Job, JobParams, JobRun, JobStatus, NewJob};
use crate::SchedulerError;

/// Called after every execution with the finished job and its run.
pub type CompletionCallback = Arc<dyn Fn(&Job, &JobRun) + Send + Sync>;

/// Lifecycle of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Running,
    /// Stop requested; the in-flight job is being allowed to finish.
    Stopping,
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing dispatchable.
    Idle,
    /// A direct reservation is active.
    Paused,
    /// Another execution holds the worker.
    Busy,
    /// Another claimer took the job first.
    LostRace,
    Executed(JobRun),
}

/// Single-worker dispatcher.
///
/// All executions, whether from the loop, `execute_direct`, or `skip_job`,
/// go through one gate, so at most one job runs at a time.
pub struct Dispatcher {
    queue: QueueManager,
    executor: Executor,
    poll_interval: Duration,
    callbacks: Vec<CompletionCallback>,
    gate: Mutex<()>,
    state: watch::Sender<DispatcherState>,
    current_job: watch::Sender<Option<String>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(queue: QueueManager, executor: Executor, poll_interval: Duration) -> Self {
        Self {
            queue,
            executor,
            poll_interval,
            callbacks: Vec::new(),
            gate: Mutex::new(()),
            state: watch::channel(DispatcherState::Stopped).0,
            current_job: watch::channel(None).0,
            shutdown: watch::channel(false).0,
            worker: Mutex::new(None),
        }
    }

    pub fn with_completion_callback(mut self, callback: CompletionCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// The job currently executing, if any.
    pub fn current_job(&self) -> Option<String> {
        self.current_job.borrow().clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the worker loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut worker = self.worker.lock().await;
        if self.state() != DispatcherState::Stopped {
            return Err(SchedulerError::InvalidOperation(
                "dispatcher is already running".to_string(),
            ));
        }

        self.shutdown.send_replace(false);
        self.state.send_replace(DispatcherState::Running);
        let shutdown_rx = self.shutdown.subscribe();
        let dispatcher = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            dispatcher.run_loop(shutdown_rx).await;
        }));
        info!(poll_interval = ?self.poll_interval, "dispatcher started");
        Ok(())
    }

    /// Ask the loop to stop and wait up to `timeout` for it.
    ///
    /// The in-flight job is never interrupted. On timeout the loop keeps
    /// winding down in the background.
    pub async fn stop(&self, timeout: Duration) -> Result<(), SchedulerError> {
        let handle = self.worker.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };

        self.state.send_replace(DispatcherState::Stopping);
        self.shutdown.send_replace(true);
        info!(current_job = ?self.current_job(), "dispatcher stopping");

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "dispatcher task failed");
                self.state.send_replace(DispatcherState::Stopped);
                Ok(())
            }
            Err(_) => {
                warn!(?timeout, "dispatcher did not stop in time");
                Err(SchedulerError::Timeout(timeout))
            }
        }
    }

    /// Resolve once the loop has fully stopped.
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state.subscribe();
        // The sender lives in `self`, so this only ends on a state change.
        let _ = state_rx
            .wait_for(|state| *state == DispatcherState::Stopped)
            .await;
    }

    async fn run_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let outcome = match self.run_once().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // One bad cycle must not take the worker down.
                    error!(error = %e, "dispatch cycle failed");
                    CycleOutcome::Idle
                }
            };
            if matches!(outcome, CycleOutcome::Executed(_) | CycleOutcome::LostRace) {
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }

        self.state.send_replace(DispatcherState::Stopped);
        info!("dispatcher stopped");
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run one dispatch cycle.
    pub async fn run_once(&self) -> Result<CycleOutcome, SchedulerError> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Ok(CycleOutcome::Busy);
        };

        if let Some(reservation) = self.queue.active_reservation()? {
            debug!(
                reservation_id = %reservation.reservation_id,
                reserved_by = %reservation.reserved_by,
                "dispatch paused by reservation"
            );
            return Ok(CycleOutcome::Paused);
        }

        let Some(next) = self.queue.get_next()? else {
            return Ok(CycleOutcome::Idle);
        };
        let (job, run) = match self.queue.store().atomic_claim_job(&next.job_id) {
            Ok(claimed) => claimed,
            Err(e) if e.is_concurrency_violation() => {
                debug!(job_id = %next.job_id, "lost claim race");
                return Ok(CycleOutcome::LostRace);
            }
            Err(e) => return Err(e),
        };

        let run = self.run_claimed(&job, run, None).await?;
        Ok(CycleOutcome::Executed(run))
    }

    /// Execute a claimed job, backfill its `finished_at`, and fire the
    /// completion callbacks. The caller holds the gate.
    async fn run_claimed(
        &self,
        job: &Job,
        run: JobRun,
        handler: Option<Arc<dyn JobHandler>>,
    ) -> Result<JobRun, SchedulerError> {
        self.current_job.send_replace(Some(job.job_id.clone()));
        let result = match handler {
            Some(handler) => self.executor.execute_with(handler, job, run).await,
            None => self.executor.execute(job, run).await,
        };
        self.current_job.send_replace(None);
        let store = self.queue.store();
        let run = match result {
            Ok(run) => run,
            Err(e) => self.close_out_unrecorded(job, e)?,
        };

        store.backfill_job_finished_at(&job.job_id, run.finished_at.unwrap_or_else(Utc::now))?;
        let job = store.get_job(&job.job_id)?;
        self.notify_completion(&job, &run);
        Ok(run)
    }

    /// The executor could not record the outcome. Fail the run the way
    /// startup recovery would, so the job does not stay RUNNING until the
    /// next restart. Returns the original error if that fails too.
    fn close_out_unrecorded(
        &self,
        job: &Job,
        cause: SchedulerError,
    ) -> Result<JobRun, SchedulerError> {
        error!(job_id = %job.job_id, error = %cause, "failed to record run outcome");
        let store = self.queue.store();
        let reason = format!("run outcome not recorded: {cause}");
        if let Err(e) = store.recover_running_job(&job.job_id, &reason) {
            error!(job_id = %job.job_id, error = %e, "failed to close out run");
            return Err(cause);
        }
        match store.get_job_run_for_job(&job.job_id) {
            Ok(Some(run)) if run.is_terminal() => {
                warn!(job_id = %job.job_id, run_id = %run.run_id, status = ?run.status, "run closed out");
                Ok(run)
            }
            _ => Err(cause),
        }
    }

    fn notify_completion(&self, job: &Job, run: &JobRun) {
        for callback in &self.callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(job, run))).is_err() {
                error!(job_id = %job.job_id, run_id = %run.run_id, "completion callback panicked");
            }
        }
    }

    // =========================================================================
    // Synchronous callers
    // =========================================================================

    /// Run a job now, ahead of the queue, and wait for it.
    ///
    /// Reserves the next slot so the loop starts nothing new, waits up to
    /// `timeout` for any in-flight job, then runs. The reservation is always
    /// released.
    #[tracing::instrument(skip(self, params))]
    pub async fn execute_direct(
        &self,
        job_type: &str,
        params: JobParams,
        reserved_by: &str,
        timeout: Option<Duration>,
    ) -> Result<(Job, JobRun), SchedulerError> {
        let reservation = self.queue.reserve_next_slot(reserved_by, None)?;
        let result = self.run_direct(job_type, params, timeout).await;
        if let Err(e) = self.queue.release_reservation(&reservation.reservation_id) {
            warn!(
                reservation_id = %reservation.reservation_id,
                error = %e,
                "failed to release reservation"
            );
        }
        result
    }

    async fn run_direct(
        &self,
        job_type: &str,
        params: JobParams,
        timeout: Option<Duration>,
    ) -> Result<(Job, JobRun), SchedulerError> {
        let _gate = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.gate.lock())
                .await
                .map_err(|_| SchedulerError::Timeout(timeout))?,
            None => self.gate.lock().await,
        };

        let job = self
            .queue
            .enqueue(NewJob::new(job_type).with_params(params))?;
        let (job, run) = self.queue.store().atomic_claim_job(&job.job_id)?;
        let run = self.run_claimed(&job, run, None).await?;
        let job = self.queue.store().get_job(&job.job_id)?;
        Ok((job, run))
    }

    /// Close out a QUEUED job with a SKIPPED run without running it.
    pub async fn skip_job(&self, job_id: &str, reason: &str) -> Result<JobRun, SchedulerError> {
        let _gate = self.gate.lock().await;
        let store = self.queue.store();
        let job = store.get_job(job_id)?;
        if job.status != JobStatus::Queued {
            return Err(SchedulerError::InvalidOperation(format!(
                "job {job_id} is {}, only QUEUED jobs can be skipped",
                job.status.as_str()
            )));
        }
        let (job, run) = store.atomic_claim_job(job_id)?;
        self.run_claimed(&job, run, Some(Arc::new(SkipHandler::new(reason))))
            .await
    }

    /// Signal the handler if `job_id` is the job in flight.
    pub fn cancel_running(&self, job_id: &str) -> bool {
        if self.current_job().as_deref() != Some(job_id) {
            return false;
        }
        let signalled = self.executor.cancel_current();
        info!(job_id, signalled, "cancel requested for running job");
        signalled
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::HandlerError;
    use crate::executor::HandlerOutcome;
    use crate::store::SqliteStore;
    use crate::types::{JobRunUpdate, RunStatus};

    /// Records the order jobs ran in.
    #[derive(Default)]
    struct RecordingHandler {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn execute(&self, job: &Job, _log_path: &Path) -> Result<HandlerOutcome, HandlerError> {
            self.seen.lock().unwrap().push(job.job_id.clone());
            Ok(HandlerOutcome::completed())
        }
    }

    fn dispatcher(
        handler: Arc<dyn JobHandler>,
        log_dir: &Path,
    ) -> (Arc<SqliteStore>, Dispatcher) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = QueueManager::new(store.clone());
        let executor = Executor::new(store.clone(), handler, log_dir);
        (
            store,
            Dispatcher::new(queue, executor, Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_run_once_executes_head() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let (store, dispatcher) = dispatcher(handler.clone(), dir.path());
        let job = store.create_job(&NewJob::new("story")).unwrap();

        let outcome = dispatcher.run_once().await.unwrap();
        let CycleOutcome::Executed(run) = outcome else {
            panic!("expected execution, got {outcome:?}");
        };
        assert_eq!(run.job_id, job.job_id);
        assert_eq!(run.status, Some(RunStatus::Completed));
        assert_eq!(store.get_job(&job.job_id).unwrap().finished_at, run.finished_at);
        assert_eq!(dispatcher.run_once().await.unwrap(), CycleOutcome::Idle);
        assert!(dispatcher.current_job().is_none());
    }

    #[tokio::test]
    async fn test_reservation_pauses_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (store, dispatcher) = dispatcher(Arc::new(RecordingHandler::default()), dir.path());
        store.create_job(&NewJob::new("story")).unwrap();
        let reservation = store
            .create_reservation("api", Duration::from_secs(60))
            .unwrap();

        assert_eq!(dispatcher.run_once().await.unwrap(), CycleOutcome::Paused);
        store.release_reservation(&reservation.reservation_id).unwrap();
        assert!(matches!(
            dispatcher.run_once().await.unwrap(),
            CycleOutcome::Executed(_)
        ));
    }

    #[tokio::test]
    async fn test_callbacks_see_finished_job() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let (store, dispatcher) = dispatcher(Arc::new(RecordingHandler::default()), dir.path());
        let dispatcher = dispatcher
            .with_completion_callback(Arc::new(|_: &Job, _: &JobRun| {
                panic!("webhook exploded");
            }))
            .with_completion_callback(Arc::new(move |job: &Job, run: &JobRun| {
                assert!(job.finished_at.is_some());
                assert!(run.is_terminal());
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        store.create_job(&NewJob::new("story")).unwrap();

        dispatcher.run_once().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_drains_queue_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let (store, dispatcher) = dispatcher(handler.clone(), dir.path());
        let dispatcher = Arc::new(dispatcher);
        let low = store.create_job(&NewJob::new("story")).unwrap();
        let high = store
            .create_job(&NewJob::new("story").with_priority(5))
            .unwrap();

        dispatcher.start().await.unwrap();
        assert!(dispatcher.start().await.is_err());
        while store.queue_stats().unwrap().completed_runs < 2 {
            sleep(Duration::from_millis(5)).await;
        }
        dispatcher.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);

        assert_eq!(*handler.seen.lock().unwrap(), vec![high.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn test_execute_direct_releases_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, dispatcher) = dispatcher(Arc::new(RecordingHandler::default()), dir.path());

        let (job, run) = dispatcher
            .execute_direct("research", JobParams::new(), "api", None)
            .await
            .unwrap();
        assert_eq!(job.job_type, "research");
        assert!(job.finished_at.is_some());
        assert_eq!(run.status, Some(RunStatus::Completed));
        assert!(store.get_active_reservation().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_direct_times_out_behind_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let (store, dispatcher) = dispatcher(Arc::new(RecordingHandler::default()), dir.path());
        let held = dispatcher.gate.lock().await;

        let err = dispatcher
            .execute_direct("story", JobParams::new(), "api", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout(_)));
        assert!(store.get_active_reservation().unwrap().is_none());
        drop(held);
    }

    #[tokio::test]
    async fn test_skip_job() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let (store, dispatcher) = dispatcher(handler.clone(), dir.path());
        let job = store.create_job(&NewJob::new("story")).unwrap();

        let run = dispatcher.skip_job(&job.job_id, "duplicate").await.unwrap();
        assert_eq!(run.status, Some(RunStatus::Skipped));
        assert!(handler.seen.lock().unwrap().is_empty());
        assert!(matches!(
            dispatcher.skip_job(&job.job_id, "again").await,
            Err(SchedulerError::InvalidOperation(_))
        ));
    }

    /// Writes to its own run mid-flight, so the executor's terminal write
    /// is rejected.
    struct ClobberingHandler {
        store: Arc<SqliteStore>,
    }

    #[async_trait]
    impl JobHandler for ClobberingHandler {
        async fn execute(&self, job: &Job, _log_path: &Path) -> Result<HandlerOutcome, HandlerError> {
            let run = self.store.get_job_run_for_job(&job.job_id).unwrap().unwrap();
            self.store
                .update_job_run(&run.run_id, &JobRunUpdate::default().with_error("partial output"))
                .unwrap();
            Ok(HandlerOutcome::failed("model timeout"))
        }
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_closes_out_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let handler = Arc::new(ClobberingHandler {
            store: store.clone(),
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let dispatcher = Dispatcher::new(
            QueueManager::new(store.clone()),
            Executor::new(store.clone(), handler, dir.path()),
            Duration::from_millis(10),
        )
        .with_completion_callback(Arc::new(move |_: &Job, run: &JobRun| {
            assert_eq!(run.status, Some(RunStatus::Failed));
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let job = store.create_job(&NewJob::new("story")).unwrap();

        let CycleOutcome::Executed(run) = dispatcher.run_once().await.unwrap() else {
            panic!("expected execution");
        };
        assert_eq!(run.status, Some(RunStatus::Failed));
        assert_eq!(run.error.as_deref(), Some("partial output"));
        assert!(store.get_job(&job.job_id).unwrap().finished_at.is_some());
        assert!(store.list_running_jobs().unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Holds `slow` jobs until released or cancelled; everything else
    /// completes at once.
    #[derive(Default)]
    struct GatedHandler {
        seen: std::sync::Mutex<Vec<String>>,
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
        cancelled: tokio::sync::Notify,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn execute(&self, job: &Job, _log_path: &Path) -> Result<HandlerOutcome, HandlerError> {
            self.seen.lock().unwrap().push(job.job_id.clone());
            if job.job_type != "slow" {
                return Ok(HandlerOutcome::completed());
            }
            self.started.notify_one();
            tokio::select! {
                _ = self.release.notified() => Ok(HandlerOutcome::completed()),
                _ = self.cancelled.notified() => {
                    Ok(HandlerOutcome::failed("terminated").with_exit_code(143))
                }
            }
        }

        fn cancel(&self) -> bool {
            self.cancelled.notify_one();
            true
        }
    }

    async fn wait_for_runs(store: &SqliteStore, finished: u64) {
        loop {
            let stats = store.queue_stats().unwrap();
            if stats.completed_runs + stats.failed_runs >= finished {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_execute_direct_drains_then_runs_ahead_of_queue() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(GatedHandler::default());
        let (store, dispatcher) = dispatcher(handler.clone(), dir.path());
        let dispatcher = Arc::new(dispatcher);
        let slow = store.create_job(&NewJob::new("slow")).unwrap();
        let waiting = store
            .create_job(&NewJob::new("story").with_priority(-1))
            .unwrap();

        dispatcher.start().await.unwrap();
        handler.started.notified().await;
        assert_eq!(dispatcher.current_job().as_deref(), Some(slow.job_id.as_str()));

        let direct = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher
                    .execute_direct("research", JobParams::new(), "api", None)
                    .await
            }
        });
        while store.get_active_reservation().unwrap().is_none() {
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(30)).await;
        assert!(!direct.is_finished());
        assert_eq!(handler.seen.lock().unwrap().len(), 1);

        handler.release.notify_one();
        let (direct_job, direct_run) = direct.await.unwrap().unwrap();
        assert_eq!(direct_run.status, Some(RunStatus::Completed));

        wait_for_runs(&store, 3).await;
        dispatcher.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![slow.job_id, direct_job.job_id, waiting.job_id]
        );
        assert!(store.get_active_reservation().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_job() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(GatedHandler::default());
        let (store, dispatcher) = dispatcher(handler.clone(), dir.path());
        let dispatcher = Arc::new(dispatcher);
        let slow = store.create_job(&NewJob::new("slow")).unwrap();

        dispatcher.start().await.unwrap();
        handler.started.notified().await;
        let next = store.create_job(&NewJob::new("story")).unwrap();

        // A short bound expires without touching the job.
        let err = dispatcher.stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout(_)));
        assert_eq!(dispatcher.state(), DispatcherState::Stopping);
        assert_eq!(dispatcher.current_job().as_deref(), Some(slow.job_id.as_str()));
        assert_eq!(store.get_job_run_for_job(&slow.job_id).unwrap().unwrap().status, None);

        handler.release.notify_one();
        dispatcher.wait_stopped().await;

        let run = store.get_job_run_for_job(&slow.job_id).unwrap().unwrap();
        assert_eq!(run.status, Some(RunStatus::Completed));
        assert_eq!(store.get_job(&next.job_id).unwrap().status, JobStatus::Queued);
        assert_eq!(*handler.seen.lock().unwrap(), vec![slow.job_id]);
    }

    #[tokio::test]
    async fn test_cancel_running_reaches_executing_handler() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(GatedHandler::default());
        let (store, dispatcher) = dispatcher(handler.clone(), dir.path());
        let dispatcher = Arc::new(dispatcher);
        let slow = store.create_job(&NewJob::new("slow")).unwrap();

        dispatcher.start().await.unwrap();
        handler.started.notified().await;
        assert!(dispatcher.cancel_running(&slow.job_id));

        wait_for_runs(&store, 1).await;
        dispatcher.stop(Duration::from_secs(5)).await.unwrap();

        let run = store.get_job_run_for_job(&slow.job_id).unwrap().unwrap();
        assert_eq!(run.status, Some(RunStatus::Failed));
        assert_eq!(run.exit_code, Some(143));
        assert_eq!(run.error.as_deref(), Some("terminated"));
        assert!(store.get_job(&slow.job_id).unwrap().finished_at.is_some());
    }

    #[test]
    fn test_cancel_running_ignores_other_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (_, dispatcher) = dispatcher(Arc::new(RecordingHandler::default()), dir.path());
        assert!(!dispatcher.cancel_running("nope"));
    }
}
