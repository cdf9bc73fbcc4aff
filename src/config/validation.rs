use super::models::Config;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("retry.multiplier must be at least 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("retry.jitter must be within [0, 1], got {0}")]
    InvalidJitter(f64),

    #[error("Scheduled task name '{0}' is used more than once")]
    DuplicateTask(String),

    #[error("Scheduled task '{0}' has a zero interval")]
    ZeroTaskInterval(String),

    #[error("Scheduled task '{task}' references unknown job '{job}'")]
    UnknownJob { task: String, job: String },

    #[error("telemetry.log_level '{0}' is not a valid filter directive")]
    InvalidLogLevel(String),
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_limits(config)?;
    validate_retry(config)?;
    validate_scheduler(config)?;
    validate_telemetry(config)?;
    Ok(())
}

/// Job names provided by the binary out of the box
pub const BUILTIN_JOBS: [&str; 2] = ["echo", "http.fetch"];

fn positive(value: bool, field: &'static str) -> Result<(), ValidationError> {
    if value {
        Ok(())
    } else {
        Err(ValidationError::NotPositive { field })
    }
}

fn validate_limits(config: &Config) -> Result<(), ValidationError> {
    positive(config.server.max_body_bytes > 0, "server.max_body_bytes")?;
    positive(config.cache.capacity > 0, "cache.capacity")?;
    positive(!config.cache.sweep_interval.is_zero(), "cache.sweep_interval")?;
    positive(config.breaker.failure_threshold > 0, "breaker.failure_threshold")?;
    positive(!config.breaker.recovery_timeout.is_zero(), "breaker.recovery_timeout")?;
    positive(config.batch.max_size > 0, "batch.max_size")?;
    positive(!config.batch.max_wait.is_zero(), "batch.max_wait")?;
    positive(config.jobs.workers > 0, "jobs.workers")?;
    positive(config.jobs.queue_capacity > 0, "jobs.queue_capacity")?;
    positive(config.jobs.max_attempts > 0, "jobs.max_attempts")?;
    positive(!config.jobs.cleanup_interval.is_zero(), "jobs.cleanup_interval")?;
    positive(!config.scheduler.tick.is_zero(), "scheduler.tick")?;
    Ok(())
}

fn validate_retry(config: &Config) -> Result<(), ValidationError> {
    let retry = &config.retry;
    positive(retry.max_attempts > 0, "retry.max_attempts")?;

    if !(retry.multiplier >= 1.0 && retry.multiplier.is_finite()) {
        return Err(ValidationError::InvalidMultiplier(retry.multiplier));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(ValidationError::InvalidJitter(retry.jitter));
    }
    Ok(())
}

fn validate_scheduler(config: &Config) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();

    for task in &config.scheduler.tasks {
        if !seen.insert(task.name.as_str()) {
            return Err(ValidationError::DuplicateTask(task.name.clone()));
        }
        if task.interval.is_zero() {
            return Err(ValidationError::ZeroTaskInterval(task.name.clone()));
        }
        if !BUILTIN_JOBS.contains(&task.job.as_str()) {
            return Err(ValidationError::UnknownJob {
                task: task.name.clone(),
                job: task.job.clone(),
            });
        }
    }
    Ok(())
}

fn validate_telemetry(config: &Config) -> Result<(), ValidationError> {
    tracing_subscriber::EnvFilter::try_new(&config.telemetry.log_level)
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidLogLevel(config.telemetry.log_level.clone()))
}
