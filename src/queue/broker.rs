//! Job queue: submission, lifecycle bookkeeping, retries and shutdown
//!
//! Architecture:
//! 1. `submit` records the job as pending, then pushes its id onto one
//!    bounded FIFO channel (`try_send`, so a full queue fails fast)
//! 2. Workers share the receiving end and claim ids in channel order
//! 3. A worker settles the job: completed, failed, cancelled or retry
//!    scheduled
//! 4. A retry-scheduled job sleeps out its backoff on a timer task and is
//!    pushed back onto the channel as pending

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ResilienceError;
use crate::handlers::HandlerRegistry;
use crate::observability::Metrics;
use crate::queue::store::JobStore;
use crate::queue::types::{
    CancelOutcome, Job, JobStats, JobStatus, JobTemplate, ShutdownReport,
};
use crate::retry::RetryPolicy;
use crate::worker::WorkerPool;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Queue tuning
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Bound on jobs waiting for a worker
    pub capacity: usize,
    /// Executions per job before it is failed
    pub max_attempts: u32,
    /// Backoff between job attempts and which errors earn another attempt
    pub retry: RetryPolicy,
    /// Deadline for a single execution
    pub job_timeout: Option<Duration>,
    /// How long `stop` waits for interrupted jobs after the drain timeout
    pub shutdown_grace: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_attempts: 3,
            retry: RetryPolicy::builder()
                .base_delay(Duration::from_secs(1))
                .build(),
            job_timeout: None,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// State shared between the queue handle, its workers and retry timers
pub(crate) struct QueueShared {
    pub(crate) store: JobStore,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) options: QueueOptions,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) rx: tokio::sync::Mutex<mpsc::Receiver<Uuid>>,
    /// Cancellation tokens of jobs currently held by a worker
    pub(crate) running: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Ids cancelled while pending that still sit in the channel
    pub(crate) stale: Mutex<HashSet<Uuid>>,
    tx: mpsc::Sender<Uuid>,
    accepting: AtomicBool,
    /// Fired when `stop` begins
    pub(crate) closing: CancellationToken,
}

impl QueueShared {
    /// Record the outcome of one execution
    pub(crate) fn settle(self: &Arc<Self>, job: &Job, outcome: Result<Value, ResilienceError>) {
        let id = job.id;

        match outcome {
            Ok(value) => {
                if self.store.complete(&id, value).is_some() {
                    self.metrics.job_completed();
                    debug!(job_id = %id, job = %job.name, attempt = job.attempt, "Job completed");
                }
            }
            Err(ResilienceError::Cancelled(reason)) => {
                if self.closing.is_cancelled() {
                    let err = ResilienceError::Cancelled("abandoned at shutdown".into());
                    if self.store.fail(&id, &err).is_some() {
                        self.metrics.job_failed();
                        warn!(job_id = %id, job = %job.name, "Job interrupted by shutdown");
                    }
                } else if self
                    .store
                    .finish_cancelled(&id, &ResilienceError::Cancelled(reason))
                    .is_some()
                {
                    self.metrics.job_cancelled();
                    info!(job_id = %id, job = %job.name, "Job cancelled");
                }
            }
            Err(err) => {
                let retryable = self.options.retry.is_retryable(&err);

                if retryable && job.attempt < job.max_attempts && !self.closing.is_cancelled() {
                    let delay = self.options.retry.delay_for(job.attempt + 1);
                    let at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

                    if self.store.schedule_retry(&id, &err, at).is_some() {
                        self.metrics.job_retried();
                        warn!(
                            job_id = %id,
                            job = %job.name,
                            attempt = job.attempt,
                            max_attempts = job.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Job failed, retry scheduled"
                        );
                        self.spawn_requeue(id, delay);
                    }
                    return;
                }

                let recorded = if retryable && job.attempt >= job.max_attempts {
                    ResilienceError::RetryExhausted {
                        attempts: job.attempt,
                        last: Box::new(err),
                    }
                } else {
                    err
                };

                if self.store.fail(&id, &recorded).is_some() {
                    self.metrics.job_failed();
                    warn!(job_id = %id, job = %job.name, attempt = job.attempt, error = %recorded, "Job failed");
                }
            }
        }
    }

    fn spawn_requeue(self: &Arc<Self>, id: Uuid, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.closing.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !shared.store.requeue(&id) {
                // cancelled while waiting
                return;
            }

            tokio::select! {
                _ = shared.closing.cancelled() => {}
                sent = shared.tx.send(id) => {
                    if sent.is_err() {
                        warn!(job_id = %id, "Queue closed before retry could be enqueued");
                    } else {
                        debug!(job_id = %id, "Job requeued for retry");
                    }
                }
            }
        });
    }
}

/// Bounded FIFO job queue with a worker pool
pub struct JobQueue {
    shared: Arc<QueueShared>,
    pool: Mutex<Option<WorkerPool>>,
}

impl JobQueue {
    pub fn new(
        options: QueueOptions,
        handlers: Arc<HandlerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let capacity = options.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        info!(capacity, max_attempts = options.max_attempts, "Creating job queue");

        Self {
            shared: Arc::new(QueueShared {
                store: JobStore::new(),
                handlers,
                options,
                metrics,
                rx: tokio::sync::Mutex::new(rx),
                running: Mutex::new(HashMap::new()),
                stale: Mutex::new(HashSet::new()),
                tx,
                accepting: AtomicBool::new(true),
                closing: CancellationToken::new(),
            }),
            pool: Mutex::new(None),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.shared.handlers
    }

    pub fn capacity(&self) -> usize {
        self.shared.tx.max_capacity()
    }

    /// Live jobs waiting in the channel
    ///
    /// A job cancelled while pending keeps its channel slot until a worker
    /// pops and discards it. Those ids are left out here, but they still
    /// count against `capacity` for `submit`.
    pub fn depth(&self) -> usize {
        let occupied = self.shared.tx.max_capacity() - self.shared.tx.capacity();
        occupied.saturating_sub(self.shared.stale.lock().len())
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, WorkerPool::size)
    }

    /// Enqueue a job without waiting
    ///
    /// Fails with `CapacityExceeded` when the queue is full or stopped and
    /// with `Validation` when no handler is registered for `name`.
    pub fn submit(&self, name: &str, payload: Value) -> Result<Uuid, ResilienceError> {
        if !self.is_accepting() {
            return Err(self.reject_stopped());
        }

        if !self.shared.handlers.contains(name) {
            return Err(ResilienceError::validation(format!(
                "no handler registered for job '{name}'"
            )));
        }

        let job = Job::new(name, payload, self.shared.options.max_attempts);
        let id = job.id;
        self.shared.store.insert(job);

        // a stop that began after the first check may already have swept
        // unfinished jobs, so the record must not stay behind as pending
        if !self.is_accepting() {
            self.shared.store.remove_if_pending(&id);
            return Err(self.reject_stopped());
        }

        match self.shared.tx.try_send(id) {
            Ok(()) => {
                self.shared.metrics.job_submitted();
                debug!(job_id = %id, job = %name, "Job submitted");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                self.shared.store.remove(&id);
                self.shared.metrics.job_rejected();
                warn!(job = %name, capacity = self.capacity(), "Job queue full, submission rejected");
                Err(ResilienceError::CapacityExceeded(format!(
                    "job queue is full ({} jobs)",
                    self.capacity()
                )))
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.store.remove(&id);
                self.shared.metrics.job_rejected();
                Err(ResilienceError::CapacityExceeded("job queue is closed".into()))
            }
        }
    }

    fn reject_stopped(&self) -> ResilienceError {
        self.shared.metrics.job_rejected();
        ResilienceError::CapacityExceeded("job queue is not accepting work".into())
    }

    pub fn submit_template(&self, template: &JobTemplate) -> Result<Uuid, ResilienceError> {
        self.submit(&template.name, template.payload.clone())
    }

    pub fn get_status(&self, id: &Uuid) -> Result<Job, ResilienceError> {
        self.shared
            .store
            .get(id)
            .ok_or_else(|| ResilienceError::NotFound(format!("job {id}")))
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = self.shared.store.stats();
        stats.queue_depth = self.depth();
        stats.queue_capacity = self.capacity();
        stats.workers = self.workers();
        stats
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        self.shared.store.list(status, limit)
    }

    /// Cancel a job
    ///
    /// Pending jobs are cancelled outright; running jobs get their
    /// cancellation token fired and settle as cancelled when the handler
    /// stops. A cancelled pending job is skipped by the worker that pops
    /// it; until then it is tracked as stale and left out of `depth`.
    pub fn cancel(&self, id: &Uuid) -> Result<CancelOutcome, ResilienceError> {
        let previous = self
            .shared
            .store
            .cancel(id)
            .ok_or_else(|| ResilienceError::NotFound(format!("job {id}")))?;

        let outcome = match previous {
            JobStatus::Pending => {
                self.shared.stale.lock().insert(*id);
                self.shared.metrics.job_cancelled();
                CancelOutcome::Cancelled
            }
            JobStatus::RetryScheduled => {
                self.shared.metrics.job_cancelled();
                CancelOutcome::Cancelled
            }
            JobStatus::Running => match self.shared.running.lock().get(id) {
                Some(token) => {
                    token.cancel();
                    CancelOutcome::Signalled
                }
                None => CancelOutcome::AlreadyFinished(JobStatus::Running),
            },
            finished => CancelOutcome::AlreadyFinished(finished),
        };

        debug!(job_id = %id, ?outcome, "Cancel requested");
        Ok(outcome)
    }

    /// Drop finished jobs older than `retention`
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        self.shared.store.purge_finished(cutoff)
    }

    /// Purge finished jobs every `every` until `shutdown` fires
    pub fn spawn_retention_cleanup(
        self: &Arc<Self>,
        every: Duration,
        retention: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = queue.purge_expired(retention);
                        if purged > 0 {
                            info!(purged, "Retention cleanup removed finished jobs");
                        }
                    }
                }
            }
        })
    }

    /// Start `workers` workers; a no-op when already started
    pub fn start(&self, workers: usize) {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            warn!("Worker pool already running");
            return;
        }
        if !self.is_accepting() {
            warn!("Job queue was stopped, not starting workers");
            return;
        }

        *pool = Some(WorkerPool::spawn(workers.max(1), self.shared.clone()));
    }

    /// Stop accepting work, drain within `drain_timeout`, stop the workers
    /// and fail whatever is left
    pub async fn stop(&self, drain_timeout: Duration) -> ShutdownReport {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.closing.cancel();

        let finished = |stats: &JobStats| stats.completed + stats.failed + stats.cancelled;
        let before = finished(&self.shared.store.stats());
        let deadline = tokio::time::Instant::now() + drain_timeout;
        let has_workers = self.pool.lock().is_some();

        loop {
            let stats = self.shared.store.stats();
            if stats.pending + stats.running == 0 {
                break;
            }
            if !has_workers || tokio::time::Instant::now() >= deadline {
                warn!(
                    pending = stats.pending,
                    running = stats.running,
                    "Drain timeout reached, abandoning remaining jobs"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let drained = finished(&self.shared.store.stats()).saturating_sub(before);

        let interrupted: Vec<Uuid> = {
            let running = self.shared.running.lock();
            for token in running.values() {
                token.cancel();
            }
            running.keys().copied().collect()
        };

        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown(self.shared.options.shutdown_grace).await;
        }

        let mut abandoned = self
            .shared
            .store
            .abandon_unfinished(&ResilienceError::Cancelled("abandoned at shutdown".into()));
        abandoned.extend(interrupted);
        abandoned.sort();
        abandoned.dedup();

        info!(drained, abandoned = abandoned.len(), "Job queue stopped");
        ShutdownReport { drained, abandoned }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity())
            .field("depth", &self.depth())
            .field("workers", &self.workers())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{JobContext, handler_fn};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn registry() -> Arc<HandlerRegistry> {
        let registry = HandlerRegistry::new();
        registry.register(
            "echo",
            Arc::new(handler_fn(|_ctx: JobContext, payload: Value| async move { Ok(payload) })),
        );
        registry.register(
            "invalid",
            Arc::new(handler_fn(|_ctx: JobContext, _payload: Value| async move {
                Err(ResilienceError::validation("payload rejected"))
            })),
        );
        registry.register(
            "sleepy",
            Arc::new(handler_fn(|ctx: JobContext, _payload: Value| async move {
                ctx.cancellation.cancelled().await;
                Err(ResilienceError::Cancelled("stopped".into()))
            })),
        );
        Arc::new(registry)
    }

    fn queue(capacity: usize) -> JobQueue {
        let options = QueueOptions {
            capacity,
            max_attempts: 3,
            retry: RetryPolicy::builder()
                .base_delay(Duration::from_millis(100))
                .jitter_fraction(0.0)
                .build(),
            job_timeout: None,
            shutdown_grace: Duration::from_millis(200),
        };
        JobQueue::new(options, registry(), Arc::new(Metrics::new()))
    }

    async fn wait_for(queue: &JobQueue, id: &Uuid, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = queue.get_status(id).unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let queue = queue(10);
        queue.start(2);

        let id = queue.submit("echo", json!({"hello": "world"})).unwrap();
        let job = wait_for(&queue, &id, JobStatus::Completed).await;

        assert_eq!(job.result, Some(json!({"hello": "world"})));
        assert_eq!(job.attempt, 1);
        assert!(job.duration().is_some());
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected_synchronously() {
        let queue = queue(10);
        let err = queue.submit("nope", Value::Null).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(queue.stats().total, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let queue = queue(2);

        queue.submit("echo", json!(1)).unwrap();
        queue.submit("echo", json!(2)).unwrap();
        let err = queue.submit("echo", json!(3)).unwrap_err();

        assert!(matches!(err, ResilienceError::CapacityExceeded(_)));
        assert_eq!(queue.depth(), 2);
        // the rejected job leaves no record behind
        assert_eq!(queue.stats().total, 2);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let queue = queue(10);
        queue.start(1);

        let id = queue.submit("invalid", Value::Null).unwrap();
        let job = wait_for(&queue, &id, JobStatus::Failed).await;

        assert_eq!(job.attempt, 1);
        assert_eq!(job.error.unwrap().code, "VALIDATION_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_retried_until_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let queue = queue(10);
        {
            let calls = calls.clone();
            queue.handlers().register(
                "flaky",
                Arc::new(handler_fn(move |_ctx: JobContext, _payload: Value| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Err(ResilienceError::dependency("geo", "503"))
                    }
                })),
            );
        }
        queue.start(1);

        let id = queue.submit("flaky", Value::Null).unwrap();
        let job = wait_for(&queue, &id, JobStatus::Failed).await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(job.attempt, 3);
        assert_eq!(job.error.unwrap().code, "RETRY_EXHAUSTED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let queue = queue(10);
        {
            let calls = calls.clone();
            queue.handlers().register(
                "second-time-lucky",
                Arc::new(handler_fn(move |ctx: JobContext, _payload: Value| {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async move {
                        if ctx.attempt == 1 {
                            Err(ResilienceError::dependency("geo", "503"))
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                })),
            );
        }
        queue.start(1);

        let id = queue.submit("second-time-lucky", Value::Null).unwrap();
        let job = wait_for(&queue, &id, JobStatus::Completed).await;
        assert_eq!(job.attempt, 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let queue = queue(10);

        let id = queue.submit("echo", json!(1)).unwrap();
        assert_eq!(queue.cancel(&id).unwrap(), CancelOutcome::Cancelled);

        queue.start(1);
        let other = queue.submit("echo", json!(2)).unwrap();
        wait_for(&queue, &other, JobStatus::Completed).await;

        // the cancelled job was skipped, never run
        let job = queue.get_status(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempt, 0);
        assert_eq!(
            queue.cancel(&id).unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_cancelled_pending_job_leaves_depth() {
        let queue = queue(10);

        let first = queue.submit("echo", json!(1)).unwrap();
        queue.submit("echo", json!(2)).unwrap();
        assert_eq!(queue.depth(), 2);

        queue.cancel(&first).unwrap();
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.stats().queue_depth, 1);

        queue.start(1);
        for _ in 0..500 {
            if queue.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.depth(), 0);
        assert!(queue.shared.stale.lock().is_empty());
    }

    #[tokio::test]
    async fn test_single_worker_runs_jobs_in_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let queue = queue(50);
        {
            let order = order.clone();
            queue.handlers().register(
                "record",
                Arc::new(handler_fn(move |_ctx: JobContext, payload: Value| {
                    let order = order.clone();
                    async move {
                        order.lock().push(payload.clone());
                        Ok(payload)
                    }
                })),
            );
        }

        let ids: Vec<Uuid> = (0..20).map(|n| queue.submit("record", json!(n)).unwrap()).collect();
        queue.start(1);
        for id in &ids {
            wait_for(&queue, id, JobStatus::Completed).await;
        }

        let expected: Vec<Value> = (0..20).map(|n| json!(n)).collect();
        assert_eq!(*order.lock(), expected);
    }

    #[tokio::test]
    async fn test_cancel_running_job_cooperatively() {
        let queue = queue(10);
        queue.start(1);

        let id = queue.submit("sleepy", Value::Null).unwrap();
        wait_for(&queue, &id, JobStatus::Running).await;

        assert_eq!(queue.cancel(&id).unwrap(), CancelOutcome::Signalled);
        let job = wait_for(&queue, &id, JobStatus::Cancelled).await;
        assert_eq!(job.error.unwrap().code, "CANCELLED");
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let queue = queue(10);
        assert!(matches!(queue.cancel(&Uuid::now_v7()), Err(ResilienceError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout() {
        let registry = registry();
        registry.register(
            "slow",
            Arc::new(handler_fn(|_ctx: JobContext, _payload: Value| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })),
        );
        let options = QueueOptions {
            capacity: 4,
            max_attempts: 1,
            job_timeout: Some(Duration::from_secs(1)),
            ..QueueOptions::default()
        };
        let queue = JobQueue::new(options, registry, Arc::new(Metrics::new()));
        queue.start(1);

        let id = queue.submit("slow", Value::Null).unwrap();
        let job = wait_for(&queue, &id, JobStatus::Failed).await;
        assert_eq!(job.error.unwrap().code, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_stop_drains_and_rejects_new_work() {
        let queue = queue(50);
        queue.start(2);

        let ids: Vec<Uuid> = (0..20).map(|n| queue.submit("echo", json!(n)).unwrap()).collect();
        let report = queue.stop(Duration::from_secs(5)).await;

        assert!(report.abandoned.is_empty());
        for id in &ids {
            assert_eq!(queue.get_status(id).unwrap().status, JobStatus::Completed);
        }
        assert!(matches!(
            queue.submit("echo", Value::Null),
            Err(ResilienceError::CapacityExceeded(_))
        ));
        assert_eq!(queue.workers(), 0);
    }

    #[tokio::test]
    async fn test_stop_reports_abandoned_jobs() {
        let queue = queue(10);
        queue.start(1);

        let running = queue.submit("sleepy", Value::Null).unwrap();
        wait_for(&queue, &running, JobStatus::Running).await;
        let waiting = queue.submit("echo", Value::Null).unwrap();

        let report = queue.stop(Duration::from_millis(50)).await;

        let mut expected = vec![running, waiting];
        expected.sort();
        assert_eq!(report.abandoned, expected);
        assert_eq!(queue.get_status(&running).unwrap().status, JobStatus::Failed);
        assert_eq!(queue.get_status(&waiting).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let queue = queue(10);
        queue.start(1);
        let id = queue.submit("echo", Value::Null).unwrap();
        wait_for(&queue, &id, JobStatus::Completed).await;

        assert_eq!(queue.purge_expired(Duration::from_secs(3600)), 0);
        assert_eq!(queue.purge_expired(Duration::ZERO), 1);
        assert!(queue.get_status(&id).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_racing_stop_leaves_nothing_unsettled() {
        let queue = Arc::new(queue(100_000));
        queue.start(2);
        let done = Arc::new(AtomicBool::new(false));

        let mut submitters = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let done = done.clone();
            submitters.push(tokio::spawn(async move {
                let mut accepted = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    if let Ok(id) = queue.submit("echo", Value::Null) {
                        accepted.push(id);
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop(Duration::from_secs(5)).await;
        done.store(true, Ordering::SeqCst);

        for submitter in submitters {
            for id in submitter.await.unwrap() {
                assert!(queue.get_status(&id).unwrap().is_terminal());
            }
        }
        assert_eq!(queue.stats().unfinished(), 0);
    }
}
