//! Periodic job submission
//!
//! Each tick submits one job per due task. A task's next run advances by
//! whole intervals past "now", so a loop that stalls for several intervals
//! submits once rather than catching up.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ResilienceError;
use crate::observability::Metrics;
use crate::queue::broker::JobQueue;
use crate::queue::types::JobTemplate;

#[derive(Debug, Clone)]
struct ScheduledTask {
    name: String,
    template: JobTemplate,
    interval: Duration,
    next_run_at: Instant,
    enabled: bool,
    runs: u64,
    errors: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_job_id: Option<Uuid>,
    last_error: Option<String>,
}

/// Snapshot of one scheduled task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub job: String,
    pub interval_ms: u64,
    pub enabled: bool,
    pub runs: u64,
    pub errors: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<Uuid>,
    pub last_error: Option<String>,
    /// Time until the next submission; zero when due
    pub next_run_in_ms: u64,
}

pub struct Scheduler {
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    metrics: Option<Arc<Metrics>>,
    tasks: Mutex<Vec<ScheduledTask>>,
    /// Stop token and task of the running loop; each `start` gets a fresh token
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(queue: Arc<JobQueue>, tick: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            clock,
            tick: tick.max(Duration::from_millis(1)),
            metrics: None,
            tasks: Mutex::new(Vec::new()),
            running: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a periodic task
    ///
    /// With `run_on_start` the first submission happens on the next tick,
    /// otherwise one interval from now.
    pub fn add_task(
        &self,
        name: impl Into<String>,
        template: JobTemplate,
        interval: Duration,
        run_on_start: bool,
    ) -> Result<(), ResilienceError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(ResilienceError::validation(format!(
                "scheduled task '{name}' has a zero interval"
            )));
        }

        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|task| task.name == name) {
            return Err(ResilienceError::validation(format!(
                "scheduled task '{name}' already exists"
            )));
        }

        let now = self.clock.now();
        let next_run_at = if run_on_start { now } else { now + interval };

        info!(task = %name, job = %template.name, interval_ms = interval.as_millis() as u64, "Scheduled task added");
        tasks.push(ScheduledTask {
            name,
            template,
            interval,
            next_run_at,
            enabled: true,
            runs: 0,
            errors: 0,
            last_run_at: None,
            last_job_id: None,
            last_error: None,
        });
        Ok(())
    }

    pub fn remove_task(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|task| task.name != name);
        tasks.len() != before
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), ResilienceError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .iter_mut()
            .find(|task| task.name == name)
            .ok_or_else(|| ResilienceError::NotFound(format!("scheduled task '{name}'")))?;

        if enabled && !task.enabled {
            // resume on the interval grid from now
            task.next_run_at = self.clock.now() + task.interval;
        }
        task.enabled = enabled;
        Ok(())
    }

    pub fn infos(&self) -> Vec<TaskInfo> {
        let now = self.clock.now();
        self.tasks
            .lock()
            .iter()
            .map(|task| TaskInfo {
                name: task.name.clone(),
                job: task.template.name.clone(),
                interval_ms: task.interval.as_millis() as u64,
                enabled: task.enabled,
                runs: task.runs,
                errors: task.errors,
                last_run_at: task.last_run_at,
                last_job_id: task.last_job_id,
                last_error: task.last_error.clone(),
                next_run_in_ms: task.next_run_at.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }

    /// Submit every due task once; returns how many jobs were submitted
    pub fn tick_once(&self) -> usize {
        let now = self.clock.now();
        let mut submitted = 0;
        let mut tasks = self.tasks.lock();

        for task in tasks.iter_mut().filter(|task| task.enabled && task.next_run_at <= now) {
            // submit never blocks, so holding the task lock is fine
            match self.queue.submit_template(&task.template) {
                Ok(job_id) => {
                    task.runs += 1;
                    task.last_job_id = Some(job_id);
                    task.last_error = None;
                    submitted += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.scheduler_submitted();
                    }
                    debug!(task = %task.name, job_id = %job_id, "Scheduled job submitted");
                }
                Err(e) => {
                    task.errors += 1;
                    task.last_error = Some(e.to_string());
                    warn!(task = %task.name, error = %e, "Scheduled submission failed");
                }
            }
            task.last_run_at = Some(Utc::now());
            task.next_run_at = next_after(task.next_run_at, task.interval, now);
        }

        submitted
    }

    /// Run the tick loop in the background; a no-op when already running
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.tick_once();
                    }
                }
            }
            debug!("Scheduler loop stopped");
        });
        *running = Some((token, handle));

        info!(tick_ms = self.tick.as_millis() as u64, tasks = self.tasks.lock().len(), "Scheduler started");
    }

    /// Stop the tick loop; `start` may be called again afterwards
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
            info!("Scheduler stopped");
        }
    }
}

/// First point on the `interval` grid from `scheduled` that lies after `now`
fn next_after(scheduled: Instant, interval: Duration, now: Instant) -> Instant {
    let behind = now.saturating_duration_since(scheduled);
    let skipped = behind.as_nanos() / interval.as_nanos().max(1);
    let steps = u32::try_from(skipped + 1).unwrap_or(u32::MAX);
    interval
        .checked_mul(steps)
        .and_then(|offset| scheduled.checked_add(offset))
        .unwrap_or(now + interval)
}
