//! Wires the components together from a [`Config`]
//!
//! The engine owns one instance of every registry (breakers, cache, handlers,
//! metrics) and injects them into the components that need them, so tests can
//! build as many isolated engines as they like.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{BatchBuffer, BatchItem, BulkWriter};
use crate::breaker::{BreakerRegistry, BreakerState};
use crate::cache::{CacheStats, TieredCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::ResilienceError;
use crate::handlers::{EchoHandler, HandlerRegistry, HttpFetchHandler};
use crate::observability::{Gauges, Metrics};
use crate::queue::{JobQueue, JobStats, JobTemplate, QueueOptions, Scheduler, ShutdownReport};
use crate::retry::RetryExecutor;
use crate::worker::{HttpClientConfig, ResilientHttpClient};

/// Breaker guarding the shared cache tier
pub const SHARED_CACHE_DEPENDENCY: &str = "cache.shared";

/// Component health for `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub accepting_jobs: bool,
    pub workers: usize,
    pub jobs: JobStats,
    pub open_breakers: Vec<String>,
    pub cache: CacheStats,
}

pub struct Engine {
    config: Config,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<TieredCache>,
    handlers: Arc<HandlerRegistry>,
    queue: Arc<JobQueue>,
    scheduler: Arc<Scheduler>,
    http: Arc<ResilientHttpClient>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine {
    pub async fn new(config: Config) -> Result<Self, ResilienceError> {
        Self::with_clock(config, SystemClock::shared()).await
    }

    /// Build every component; nothing runs until [`start`](Self::start)
    pub async fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, ResilienceError> {
        let metrics = Arc::new(Metrics::new());

        let breakers = Arc::new(
            BreakerRegistry::new(config.breaker.to_breaker_config(), clock.clone())
                .with_metrics(metrics.clone()),
        );

        let mut cache = TieredCache::new(
            config.cache.capacity,
            config.cache.default_ttl.as_duration(),
            clock.clone(),
        )
        .with_shared_timeout(config.cache.shared_timeout.as_duration())
        .with_metrics(metrics.clone());

        if let Some(url) = &config.cache.shared_url {
            cache = attach_shared_tier(cache, url, &breakers).await;
        }
        let cache = Arc::new(cache);

        let retry = RetryExecutor::new(config.retry.to_policy()).with_metrics(metrics.clone());
        let http = Arc::new(ResilientHttpClient::new(
            HttpClientConfig::default(),
            breakers.clone(),
            retry,
        )?);

        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("echo", Arc::new(EchoHandler));
        handlers.register(
            HttpFetchHandler::NAME,
            Arc::new(HttpFetchHandler::new(http.clone(), cache.clone())),
        );

        let queue = Arc::new(JobQueue::new(
            QueueOptions {
                capacity: config.jobs.queue_capacity,
                max_attempts: config.jobs.max_attempts,
                retry: config.jobs.retry_policy(&config.retry),
                job_timeout: config.jobs.job_timeout.map(|t| t.as_duration()),
                shutdown_grace: QueueOptions::default().shutdown_grace,
            },
            handlers.clone(),
            metrics.clone(),
        ));

        let scheduler = Arc::new(
            Scheduler::new(queue.clone(), config.scheduler.tick.as_duration(), clock.clone())
                .with_metrics(metrics.clone()),
        );
        for task in &config.scheduler.tasks {
            scheduler.add_task(
                task.name.clone(),
                JobTemplate::new(task.job.clone(), task.payload.clone()),
                task.interval.as_duration(),
                task.run_on_start,
            )?;
            if !task.enabled {
                scheduler.set_enabled(&task.name, false)?;
            }
        }

        Ok(Self {
            config,
            clock,
            metrics,
            breakers,
            cache,
            handlers,
            queue,
            scheduler,
            http,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn http(&self) -> &Arc<ResilientHttpClient> {
        &self.http
    }

    /// A retry executor with the configured outbound policy
    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.config.retry.to_policy()).with_metrics(self.metrics.clone())
    }

    /// A batch buffer with the configured thresholds and a background flush
    /// timer that performs a final flush when the engine stops
    pub fn batch_buffer<T: BatchItem>(
        &self,
        name: impl Into<String>,
        writer: Arc<dyn BulkWriter<T>>,
    ) -> Arc<BatchBuffer<T>> {
        let buffer = Arc::new(
            BatchBuffer::new(
                name,
                self.config.batch.max_size,
                self.config.batch.max_wait.as_duration(),
                writer,
                self.clock.clone(),
            )
            .with_metrics(self.metrics.clone()),
        );

        let timer = buffer.clone().spawn_flush_timer(None, self.shutdown.child_token());
        self.background.lock().push(timer);
        buffer
    }

    /// Start the workers, the scheduler and housekeeping loops
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine already started");
            return;
        }

        let jobs = &self.config.jobs;
        self.queue.start(jobs.workers);
        self.scheduler.start();

        let mut background = self.background.lock();
        background.push(
            self.cache
                .spawn_sweeper(self.config.cache.sweep_interval.as_duration(), self.shutdown.child_token()),
        );
        background.push(self.queue.spawn_retention_cleanup(
            jobs.cleanup_interval.as_duration(),
            jobs.retention.as_duration(),
            self.shutdown.child_token(),
        ));

        info!(
            workers = jobs.workers,
            queue_capacity = jobs.queue_capacity,
            scheduled_tasks = self.config.scheduler.tasks.len(),
            "Engine started"
        );
    }

    /// Stop the scheduler, drain the queue within the configured timeout and
    /// stop housekeeping (batch buffers get a final flush)
    pub async fn stop(&self) -> ShutdownReport {
        self.scheduler.stop().await;
        let report = self
            .queue
            .stop(self.config.jobs.drain_timeout.as_duration())
            .await;

        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!(drained = report.drained, abandoned = report.abandoned.len(), "Engine stopped");
        report
    }

    /// Gauge values for the Prometheus exposition
    pub fn gauges(&self) -> Gauges {
        let stats = self.queue.stats();
        Gauges {
            queue_depth: stats.queue_depth,
            queue_capacity: stats.queue_capacity,
            jobs_by_status: stats.by_status(),
            breakers: self
                .breakers
                .snapshots()
                .into_iter()
                .map(|snapshot| (snapshot.name, snapshot.state))
                .collect(),
            cache_entries: self.cache.local().len(),
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render(&self.gauges())
    }

    pub fn health(&self) -> HealthReport {
        let jobs = self.queue.stats();
        let open_breakers: Vec<String> = self
            .breakers
            .snapshots()
            .into_iter()
            .filter(|snapshot| snapshot.state == BreakerState::Open)
            .map(|snapshot| snapshot.name)
            .collect();
        let accepting_jobs = self.queue.is_accepting();

        let status = if !accepting_jobs {
            "stopping"
        } else if open_breakers.is_empty() {
            "ok"
        } else {
            "degraded"
        };

        HealthReport {
            status,
            accepting_jobs,
            workers: jobs.workers,
            jobs,
            open_breakers,
            cache: self.cache.stats(),
        }
    }
}

#[cfg(feature = "redis")]
async fn attach_shared_tier(cache: TieredCache, url: &str, breakers: &BreakerRegistry) -> TieredCache {
    match crate::cache::redis::RedisSharedTier::connect(url).await {
        Ok(tier) => cache.with_shared(Arc::new(tier), Some(breakers.get(SHARED_CACHE_DEPENDENCY))),
        Err(e) => {
            warn!(error = %e, "Shared cache unavailable at startup, running local-only");
            cache
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn attach_shared_tier(cache: TieredCache, url: &str, _breakers: &BreakerRegistry) -> TieredCache {
    warn!(url, "cache.shared_url is set but the redis feature is disabled, running local-only");
    cache
}
