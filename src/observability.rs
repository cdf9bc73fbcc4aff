//! Metrics recording, Prometheus exposition and tracing setup

use metrics::{
    Counter, Histogram, Unit, counter, describe_counter, describe_gauge, describe_histogram,
    gauge, histogram, with_local_recorder,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::fmt;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::breaker::BreakerState;
use crate::config::TelemetryConfig;

const BATCH_FLUSH_SIZE: &str = "bulwark_batch_flush_size";
const BATCH_FLUSH_DURATION: &str = "bulwark_batch_flush_duration_seconds";
const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];
const BATCH_DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level. Safe to call more than once
/// (later calls are no-ops).
pub fn init_tracing(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Prometheus recorder owned by one engine
///
/// Nothing is installed globally: every `Metrics` carries its own recorder
/// and records through it with `with_local_recorder`, so two engines in one
/// process (or two tests) never share counters. Gauges that describe live
/// state (queue depth, breaker state) are sampled at render time instead of
/// being mirrored here.
pub struct Metrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    instruments: Instruments,
}

/// Handles registered once against the owning recorder
struct Instruments {
    cache_local_hits: Counter,
    cache_shared_hits: Counter,
    cache_misses: Counter,
    cache_degraded: Counter,
    cache_evictions: Counter,

    retry_attempts: Counter,
    retry_exhausted: Counter,

    batch_flush_size: Histogram,
    batch_flush_duration: Histogram,
    batch_items_failed: Counter,

    jobs_submitted: Counter,
    jobs_rejected: Counter,
    jobs_completed: Counter,
    jobs_failed: Counter,
    jobs_retried: Counter,
    jobs_cancelled: Counter,
    scheduler_submissions: Counter,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn build_recorder() -> PrometheusRecorder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(BATCH_FLUSH_SIZE.to_string()), BATCH_SIZE_BUCKETS)
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full(BATCH_FLUSH_DURATION.to_string()),
                BATCH_DURATION_BUCKETS,
            )
        })
        .unwrap_or_else(|err| {
            warn!(error = %err, "Invalid histogram buckets, falling back to summaries");
            PrometheusBuilder::new()
        })
        .build_recorder()
}

fn describe() {
    describe_counter!("bulwark_breaker_transitions_total", "Circuit breaker state transitions");
    describe_counter!("bulwark_breaker_rejections_total", "Calls rejected by an open breaker");
    describe_gauge!("bulwark_breaker_state", "Breaker state (0=closed, 1=open, 2=half_open)");
    describe_counter!("bulwark_cache_hits_total", "Cache hits by tier");
    describe_counter!("bulwark_cache_misses_total", "Cache misses");
    describe_counter!(
        "bulwark_cache_degraded_total",
        "Shared-tier operations that fell back to local-only"
    );
    describe_counter!("bulwark_cache_evictions_total", "Local-tier LRU evictions");
    describe_gauge!("bulwark_cache_entries", "Entries in the local tier");
    describe_counter!("bulwark_retry_attempts_total", "Retry attempts after the first");
    describe_counter!("bulwark_retry_exhausted_total", "Retry executions that gave up");
    describe_histogram!(BATCH_FLUSH_SIZE, Unit::Count, "Items per bulk write");
    describe_histogram!(BATCH_FLUSH_DURATION, Unit::Seconds, "Bulk write duration");
    describe_counter!("bulwark_batch_items_failed_total", "Items reported failed by bulk writes");
    describe_counter!("bulwark_jobs_submitted_total", "Jobs accepted by the queue");
    describe_counter!("bulwark_jobs_rejected_total", "Submissions rejected at capacity");
    describe_counter!("bulwark_jobs_completed_total", "Jobs completed");
    describe_counter!("bulwark_jobs_failed_total", "Jobs failed terminally");
    describe_counter!("bulwark_jobs_retried_total", "Job retries scheduled");
    describe_counter!("bulwark_jobs_cancelled_total", "Jobs cancelled");
    describe_counter!("bulwark_scheduler_submissions_total", "Jobs submitted by the scheduler");
    describe_gauge!("bulwark_job_queue_depth", "Jobs waiting in the queue");
    describe_gauge!("bulwark_job_queue_capacity", "Queue capacity");
    describe_gauge!("bulwark_jobs", "Tracked jobs by status");
}

impl Metrics {
    pub fn new() -> Self {
        let recorder = build_recorder();
        let handle = recorder.handle();

        let instruments = with_local_recorder(&recorder, || {
            describe();
            Instruments {
                cache_local_hits: counter!("bulwark_cache_hits_total", "tier" => "local"),
                cache_shared_hits: counter!("bulwark_cache_hits_total", "tier" => "shared"),
                cache_misses: counter!("bulwark_cache_misses_total"),
                cache_degraded: counter!("bulwark_cache_degraded_total"),
                cache_evictions: counter!("bulwark_cache_evictions_total"),
                retry_attempts: counter!("bulwark_retry_attempts_total"),
                retry_exhausted: counter!("bulwark_retry_exhausted_total"),
                batch_flush_size: histogram!(BATCH_FLUSH_SIZE),
                batch_flush_duration: histogram!(BATCH_FLUSH_DURATION),
                batch_items_failed: counter!("bulwark_batch_items_failed_total"),
                jobs_submitted: counter!("bulwark_jobs_submitted_total"),
                jobs_rejected: counter!("bulwark_jobs_rejected_total"),
                jobs_completed: counter!("bulwark_jobs_completed_total"),
                jobs_failed: counter!("bulwark_jobs_failed_total"),
                jobs_retried: counter!("bulwark_jobs_retried_total"),
                jobs_cancelled: counter!("bulwark_jobs_cancelled_total"),
                scheduler_submissions: counter!("bulwark_scheduler_submissions_total"),
            }
        });

        Self {
            recorder,
            handle,
            instruments,
        }
    }

    /// Run `f` with this instance's recorder as the thread-local recorder
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        with_local_recorder(&self.recorder, f)
    }

    pub fn breaker_transition(&self, dependency: &str, to: BreakerState) {
        self.scoped(|| {
            counter!(
                "bulwark_breaker_transitions_total",
                "dependency" => dependency.to_string(),
                "to" => to.as_str()
            )
            .increment(1)
        });
    }

    pub fn breaker_rejected(&self, dependency: &str) {
        self.scoped(|| {
            counter!("bulwark_breaker_rejections_total", "dependency" => dependency.to_string())
                .increment(1)
        });
    }

    pub fn cache_local_hit(&self) {
        self.instruments.cache_local_hits.increment(1);
    }

    pub fn cache_shared_hit(&self) {
        self.instruments.cache_shared_hits.increment(1);
    }

    pub fn cache_miss(&self) {
        self.instruments.cache_misses.increment(1);
    }

    pub fn cache_degraded(&self) {
        self.instruments.cache_degraded.increment(1);
    }

    pub fn cache_evicted(&self, count: u64) {
        self.instruments.cache_evictions.increment(count);
    }

    pub fn retry_attempt(&self) {
        self.instruments.retry_attempts.increment(1);
    }

    pub fn retry_exhausted(&self) {
        self.instruments.retry_exhausted.increment(1);
    }

    /// Record one bulk write
    pub fn batch_flushed(&self, size: usize, failed: usize, duration: Duration) {
        self.instruments.batch_flush_size.record(size as f64);
        self.instruments.batch_flush_duration.record(duration.as_secs_f64());
        self.instruments.batch_items_failed.increment(failed as u64);
    }

    pub fn job_submitted(&self) {
        self.instruments.jobs_submitted.increment(1);
    }

    pub fn job_rejected(&self) {
        self.instruments.jobs_rejected.increment(1);
    }

    pub fn job_completed(&self) {
        self.instruments.jobs_completed.increment(1);
    }

    pub fn job_failed(&self) {
        self.instruments.jobs_failed.increment(1);
    }

    pub fn job_retried(&self) {
        self.instruments.jobs_retried.increment(1);
    }

    pub fn job_cancelled(&self) {
        self.instruments.jobs_cancelled.increment(1);
    }

    pub fn scheduler_submitted(&self) {
        self.instruments.scheduler_submissions.increment(1);
    }

    /// Prometheus text exposition after publishing the sampled gauges
    pub fn render(&self, gauges: &Gauges) -> String {
        self.scoped(|| {
            for (dependency, state) in &gauges.breakers {
                gauge!("bulwark_breaker_state", "dependency" => dependency.clone())
                    .set(f64::from(state.as_gauge()));
            }
            gauge!("bulwark_cache_entries").set(gauges.cache_entries as f64);
            gauge!("bulwark_job_queue_depth").set(gauges.queue_depth as f64);
            gauge!("bulwark_job_queue_capacity").set(gauges.queue_capacity as f64);
            for (status, count) in &gauges.jobs_by_status {
                gauge!("bulwark_jobs", "status" => *status).set(*count as f64);
            }
        });

        self.handle.render()
    }
}

/// Live values sampled at render time
#[derive(Debug, Clone, Default)]
pub struct Gauges {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub jobs_by_status: Vec<(&'static str, usize)>,
    pub breakers: Vec<(String, BreakerState)>,
    pub cache_entries: usize,
}
