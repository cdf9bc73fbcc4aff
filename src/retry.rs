//! Bounded retries with exponential backoff and jitter
//!
//! The delay before attempt `n` (n ≥ 2) is `base_delay * multiplier^(n-2)`,
//! capped by `max_delay` when set and then scaled by a random factor in
//! `[1 - jitter_fraction, 1 + jitter_fraction]`.

use bon::Builder;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::breaker::{CircuitBreaker, ErrorPredicate};
use crate::error::ResilienceError;
use crate::observability::Metrics;
use crate::work::UnitOfWork;

fn default_retryable() -> ErrorPredicate {
    Arc::new(|err: &ResilienceError| err.is_retryable())
}

/// Immutable retry configuration
#[derive(Clone, Builder)]
pub struct RetryPolicy {
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_millis(100))]
    pub base_delay: Duration,
    #[builder(default = 2.0)]
    pub multiplier: f64,
    #[builder(default = 0.1)]
    pub jitter_fraction: f64,
    pub max_delay: Option<Duration>,
    /// Overall budget for all attempts and the sleeps between them
    pub deadline: Option<Duration>,
    #[builder(default = default_retryable())]
    pub retryable: ErrorPredicate,
}

impl RetryPolicy {
    /// Effective attempt cap (never below one)
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay before `attempt` (1-based); zero for the first attempt
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;

        let mut delay = if secs.is_finite() && secs < Duration::MAX.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            Duration::MAX
        };

        if let Some(cap) = self.max_delay {
            delay = delay.min(cap);
        }
        delay
    }

    /// Delay before `attempt` with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter_fraction.clamp(0.0, 1.0);
        if nominal.is_zero() || jitter == 0.0 {
            return nominal;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    pub fn is_retryable(&self, err: &ResilienceError) -> bool {
        (self.retryable)(err)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::builder().build()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("max_delay", &self.max_delay)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

enum Step {
    Retry,
    Stop,
}

/// Runs units of work under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `work` until it succeeds, fails with a non-retryable error or
    /// runs out of attempts
    pub async fn run<W>(&self, work: &W) -> Result<W::Output, ResilienceError>
    where
        W: UnitOfWork + ?Sized,
    {
        self.run_inner(None, work).await
    }

    /// Like [`run`](Self::run), but every attempt first asks `breaker` for
    /// permission
    ///
    /// A rejection by the breaker uses up an attempt without touching the
    /// breaker's counters.
    pub async fn run_with_breaker<W>(
        &self,
        breaker: &CircuitBreaker,
        work: &W,
    ) -> Result<W::Output, ResilienceError>
    where
        W: UnitOfWork + ?Sized,
    {
        self.run_inner(Some(breaker), work).await
    }

    async fn run_inner<W>(
        &self,
        breaker: Option<&CircuitBreaker>,
        work: &W,
    ) -> Result<W::Output, ResilienceError>
    where
        W: UnitOfWork + ?Sized,
    {
        let max_attempts = self.policy.attempts();
        let deadline = self
            .policy
            .deadline
            .map(|budget| (tokio::time::Instant::now() + budget, budget));
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                self.record_attempt();
            }

            let permit = match breaker.map(|b| b.acquire()).transpose() {
                Ok(permit) => permit,
                Err(rejected) => {
                    match self.after_failure(attempt, max_attempts, &rejected, true) {
                        Step::Retry => {
                            self.sleep_before(attempt + 1, deadline).await?;
                            continue;
                        }
                        Step::Stop => return Err(self.finish(attempt, max_attempts, rejected)),
                    }
                }
            };

            let result = match deadline {
                Some((at, budget)) => match tokio::time::timeout_at(at, work.execute()).await {
                    Ok(result) => result,
                    // cut off by the overall budget; the permit is released unsettled
                    Err(_) => return Err(ResilienceError::Timeout(budget)),
                },
                None => work.execute().await,
            };

            if let Some(permit) = permit {
                permit.record(&result);
            }

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match self.after_failure(attempt, max_attempts, &err, false) {
                Step::Retry => self.sleep_before(attempt + 1, deadline).await?,
                Step::Stop => return Err(self.finish(attempt, max_attempts, err)),
            }
        }
    }

    /// Blocking variant for synchronous work; sleeps the current thread
    /// between attempts
    pub fn run_blocking<T, F>(&self, mut op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Result<T, ResilienceError>,
    {
        let max_attempts = self.policy.attempts();
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                self.record_attempt();
            }

            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let Some(budget) = self.policy.deadline {
                if started.elapsed() >= budget {
                    return Err(ResilienceError::Timeout(budget));
                }
            }

            match self.after_failure(attempt, max_attempts, &err, false) {
                Step::Retry => {
                    let delay = self.policy.delay_for(attempt + 1);
                    if let Some(budget) = self.policy.deadline {
                        if started.elapsed().saturating_add(delay) >= budget {
                            return Err(ResilienceError::Timeout(budget));
                        }
                    }
                    std::thread::sleep(delay);
                }
                Step::Stop => return Err(self.finish(attempt, max_attempts, err)),
            }
        }
    }

    fn after_failure(
        &self,
        attempt: u32,
        max_attempts: u32,
        err: &ResilienceError,
        breaker_rejection: bool,
    ) -> Step {
        let retryable = breaker_rejection || self.policy.is_retryable(err);
        if !retryable || attempt >= max_attempts {
            return Step::Stop;
        }

        warn!(attempt, max_attempts, error = %err, "Attempt failed, retrying");
        Step::Retry
    }

    fn finish(&self, attempt: u32, max_attempts: u32, err: ResilienceError) -> ResilienceError {
        let retryable = matches!(err, ResilienceError::BreakerOpen(_)) || self.policy.is_retryable(&err);
        if !retryable || attempt < max_attempts {
            return err;
        }

        if let Some(metrics) = &self.metrics {
            metrics.retry_exhausted();
        }
        warn!(attempts = attempt, error = %err, "Retries exhausted");

        ResilienceError::RetryExhausted {
            attempts: attempt,
            last: Box::new(err),
        }
    }

    async fn sleep_before(
        &self,
        next_attempt: u32,
        deadline: Option<(tokio::time::Instant, Duration)>,
    ) -> Result<(), ResilienceError> {
        let delay = self.policy.delay_for(next_attempt);

        if let Some((at, budget)) = deadline {
            let wake = tokio::time::Instant::now().checked_add(delay);
            if wake.is_none_or(|wake| wake >= at) {
                return Err(ResilienceError::Timeout(budget));
            }
        }

        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn record_attempt(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.retry_attempt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::clock::{ManualClock, SystemClock};
    use crate::observability::Gauges;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing(calls: Arc<AtomicU32>) -> impl Fn() -> std::future::Ready<Result<(), ResilienceError>> {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(ResilienceError::dependency("geo", "503")))
        }
    }

    #[test]
    fn test_builder_defaults() {
        let policy = RetryPolicy::builder().build();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.max_delay.is_none());
    }

    #[test]
    fn test_nominal_delays_grow_exponentially() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(350))
            .build();

        assert_eq!(policy.nominal_delay(1), Duration::ZERO);
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(4), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(1000))
            .jitter_fraction(0.25)
            .build();

        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1250), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts_with_backoff() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let executor = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(3)
                .base_delay(Duration::from_millis(100))
                .multiplier(2.0)
                .jitter_fraction(0.1)
                .build(),
        );

        let work = {
            let stamps = stamps.clone();
            move || {
                stamps.lock().push(tokio::time::Instant::now());
                async { Err::<(), _>(ResilienceError::dependency("geo", "connection reset")) }
            }
        };

        let err = executor.run(&work).await.unwrap_err();
        match err {
            ResilienceError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.code(), "DEPENDENCY_UNAVAILABLE");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 3);
        let first_gap = stamps[1] - stamps[0];
        let second_gap = stamps[2] - stamps[1];
        assert!(first_gap >= Duration::from_millis(90) && first_gap <= Duration::from_millis(110));
        assert!(second_gap >= Duration::from_millis(180) && second_gap <= Duration::from_millis(220));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy::builder().max_attempts(5).build());

        let work = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ResilienceError::validation("bad id")) }
            }
        };

        let err = executor.run(&work).await.unwrap_err();
        assert_eq!(err, ResilienceError::validation("bad id"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let metrics = Arc::new(Metrics::new());
        let executor = RetryExecutor::new(RetryPolicy::default()).with_metrics(metrics.clone());

        let work = {
            let calls = calls.clone();
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ResilienceError::dependency("geo", "timeout"))
                    } else {
                        Ok(n)
                    }
                }
            }
        };

        assert_eq!(executor.run(&work).await.unwrap(), 1);
        let text = metrics.render(&Gauges::default());
        assert!(text.contains("bulwark_retry_attempts_total 1"));
        assert!(!text.contains("bulwark_retry_exhausted_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_timeout() {
        let executor = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(10)
                .base_delay(Duration::from_millis(400))
                .jitter_fraction(0.0)
                .deadline(Duration::from_secs(1))
                .build(),
        );

        let calls = Arc::new(AtomicU32::new(0));
        let err = executor.run(&failing(calls.clone())).await.unwrap_err();

        assert_eq!(err, ResilienceError::Timeout(Duration::from_secs(1)));
        // 0ms, 400ms; the third attempt would start past the deadline
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_off_slow_attempt() {
        let executor = RetryExecutor::new(
            RetryPolicy::builder()
                .deadline(Duration::from_millis(500))
                .build(),
        );

        let work = || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ResilienceError>(())
        };

        let err = executor.run(&work).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_rejections_consume_attempts_without_counting() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            "geo",
            BreakerConfig::new(2, Duration::from_secs(60)),
            Arc::new(clock),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(5)
                .base_delay(Duration::from_millis(10))
                .build(),
        );

        let err = executor
            .run_with_breaker(&breaker, &failing(calls.clone()))
            .await
            .unwrap_err();

        // two real calls open the breaker, the remaining three are rejected
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
        match err {
            ResilienceError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last, ResilienceError::BreakerOpen(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_once_breaker_recovers() {
        let breaker = CircuitBreaker::new(
            "geo",
            BreakerConfig::new(1, Duration::from_millis(100)),
            SystemClock::shared(),
        );
        let _ = breaker
            .call(&|| async { Err::<(), _>(ResilienceError::dependency("geo", "down")) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let work = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ResilienceError>("found") }
            }
        };
        let executor = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(5)
                .base_delay(Duration::from_millis(60))
                .multiplier(1.0)
                .jitter_fraction(0.0)
                .build(),
        );

        let started = tokio::time::Instant::now();
        let value = executor.run_with_breaker(&breaker, &work).await.unwrap();

        // rejected at 0ms and 60ms, let through as the half-open trial at 120ms
        assert_eq!(value, "found");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().rejected, 2);
    }

    #[test]
    fn test_run_blocking() {
        let executor = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(3)
                .base_delay(Duration::from_millis(1))
                .build(),
        );

        let mut calls = 0;
        let value = executor
            .run_blocking(|| {
                calls += 1;
                if calls < 3 {
                    Err(ResilienceError::dependency("fs", "busy"))
                } else {
                    Ok("done")
                }
            })
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_custom_retryable_predicate() {
        let executor = RetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(2)
                .base_delay(Duration::ZERO)
                .retryable(Arc::new(|err: &ResilienceError| matches!(err, ResilienceError::Timeout(_))))
                .build(),
        );

        let mut calls = 0;
        let err = executor
            .run_blocking(|| -> Result<(), _> {
                calls += 1;
                Err(ResilienceError::dependency("x", "down"))
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, ResilienceError::DependencyUnavailable { .. }));
    }
}
