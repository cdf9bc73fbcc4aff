use crate::humanize::HumanDuration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Operator HTTP server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_body_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

/// Two-tier cache
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Entries held by the local tier before LRU eviction
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl: HumanDuration,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: HumanDuration,
    /// Budget for one shared-tier operation before it counts as degraded
    #[serde(default = "default_shared_timeout")]
    pub shared_timeout: HumanDuration,
    /// Shared tier URL (`redis://...`); local-only when absent
    #[serde(default)]
    pub shared_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            default_ttl: default_cache_ttl(),
            sweep_interval: default_sweep_interval(),
            shared_timeout: default_shared_timeout(),
            shared_url: None,
        }
    }
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_cache_ttl() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_sweep_interval() -> HumanDuration {
    HumanDuration::from_secs(60)
}

fn default_shared_timeout() -> HumanDuration {
    HumanDuration::from_millis(250)
}

/// Default breaker settings applied to every dependency
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: HumanDuration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> HumanDuration {
    HumanDuration::from_secs(60)
}

/// Retry executor used for outbound calls
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: HumanDuration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub max_delay: Option<HumanDuration>,
    /// Overall budget across attempts
    #[serde(default)]
    pub deadline: Option<HumanDuration>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_delay: None,
            deadline: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> HumanDuration {
    HumanDuration::from_millis(100)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

/// Batch write buffers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub max_size: usize,
    #[serde(default = "default_batch_wait")]
    pub max_wait: HumanDuration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_size(),
            max_wait: default_batch_wait(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_wait() -> HumanDuration {
    HumanDuration::from_secs(5)
}

/// Job queue and worker pool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_job_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_job_retry_delay")]
    pub retry_base_delay: HumanDuration,
    #[serde(default)]
    pub job_timeout: Option<HumanDuration>,
    /// How long finished jobs stay queryable
    #[serde(default = "default_retention")]
    pub retention: HumanDuration,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: HumanDuration,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: HumanDuration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_job_attempts(),
            retry_base_delay: default_job_retry_delay(),
            job_timeout: None,
            retention: default_retention(),
            cleanup_interval: default_cleanup_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_job_attempts() -> u32 {
    3
}

fn default_job_retry_delay() -> HumanDuration {
    HumanDuration::from_secs(1)
}

fn default_retention() -> HumanDuration {
    HumanDuration::from_secs(24 * 3600)
}

fn default_cleanup_interval() -> HumanDuration {
    HumanDuration::from_secs(3600)
}

fn default_drain_timeout() -> HumanDuration {
    HumanDuration::from_secs(30)
}

/// Periodic job submission
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick")]
    pub tick: HumanDuration,
    #[serde(default)]
    pub tasks: Vec<ScheduledTaskConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            tasks: Vec::new(),
        }
    }
}

fn default_tick() -> HumanDuration {
    HumanDuration::from_secs(1)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduledTaskConfig {
    pub name: String,
    /// Registered job handler name
    pub job: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    pub interval: HumanDuration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Submit on the first tick instead of waiting one interval
    #[serde(default)]
    pub run_on_start: bool,
}

fn default_enabled() -> bool {
    true
}

/// Logging
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
