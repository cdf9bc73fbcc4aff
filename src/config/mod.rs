//! Configuration management for Bulwark
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. `.env` file
//! 4. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use bulwark::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Server listening on: {}", config.server.bind_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `BULWARK__<section>__<key>`
//!
//! Examples:
//! - `BULWARK__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `BULWARK__JOBS__WORKERS=16`
//! - `BULWARK__CACHE__DEFAULT_TTL=10m`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/bulwark.toml`.
//! This can be overridden using the `BULWARK_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::HumanDuration;
pub use models::{
    BatchConfig, BreakerSettings, CacheConfig, Config, JobsConfig, RetrySettings,
    ScheduledTaskConfig, SchedulerConfig, ServerConfig, TelemetryConfig,
};
pub use sources::config_path;
pub use validation::{BUILTIN_JOBS, ValidationError};

use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or a value
    /// fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Layers `.env` and the environment over the file exactly like [`load`](Self::load).
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig::new(self.failure_threshold, self.recovery_timeout.as_duration())
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(self.base_delay.as_duration())
            .multiplier(self.multiplier)
            .jitter_fraction(self.jitter)
            .maybe_max_delay(self.max_delay.map(|d| d.as_duration()))
            .maybe_deadline(self.deadline.map(|d| d.as_duration()))
            .build()
    }
}

impl JobsConfig {
    /// Backoff between job attempts, reusing the outbound multiplier and jitter
    pub fn retry_policy(&self, retry: &RetrySettings) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(self.retry_base_delay.as_duration())
            .multiplier(retry.multiplier)
            .jitter_fraction(retry.jitter)
            .maybe_max_delay(retry.max_delay.map(|d| d.as_duration()))
            .build()
    }
}
