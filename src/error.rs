use std::time::Duration;
use thiserror::Error;

/// Error taxonomy shared by every component of the engine
///
/// The variants are deliberately coarse: callers map their own failures onto
/// them so the breaker and retry executor can classify errors without knowing
/// the concrete dependency.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResilienceError {
    /// The remote dependency failed (connection error, timeout, 5xx)
    #[error("dependency '{dependency}' unavailable: {message}")]
    DependencyUnavailable { dependency: String, message: String },

    /// The caller's input was rejected; never retried, never counted
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("gave up after {attempts} attempt(s): {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ResilienceError>,
    },

    #[error("batch write failed for {} of {total} item(s)", .failed_ids.len())]
    PartialBatchFailure { failed_ids: Vec<String>, total: usize },

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ResilienceError>;

impl ResilienceError {
    pub fn dependency(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        ResilienceError::DependencyUnavailable {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ResilienceError::Validation(message.into())
    }

    /// Whether this failure should count toward a breaker's failure threshold
    pub fn is_countable(&self) -> bool {
        match self {
            ResilienceError::DependencyUnavailable { .. } | ResilienceError::Timeout(_) => true,
            ResilienceError::RetryExhausted { last, .. } => last.is_countable(),
            _ => false,
        }
    }

    /// Whether another attempt may succeed
    ///
    /// Breaker rejections are retryable: the breaker may be half-open by the
    /// time the next attempt runs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::DependencyUnavailable { .. } | ResilienceError::BreakerOpen(_)
        )
    }

    /// Innermost error, looking through retry exhaustion
    pub fn root_cause(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ResilienceError::DependencyUnavailable { .. } => "DEPENDENCY_UNAVAILABLE",
            ResilienceError::Validation(_) => "VALIDATION_ERROR",
            ResilienceError::BreakerOpen(_) => "BREAKER_OPEN",
            ResilienceError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            ResilienceError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            ResilienceError::PartialBatchFailure { .. } => "PARTIAL_BATCH_FAILURE",
            ResilienceError::Timeout(_) => "TIMEOUT",
            ResilienceError::Cancelled(_) => "CANCELLED",
            ResilienceError::NotFound(_) => "NOT_FOUND",
        }
    }
}
