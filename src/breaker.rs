//! Per-dependency circuit breakers
//!
//! # States
//! - Closed: calls pass through, consecutive countable failures are tracked
//! - Open: calls fail fast with [`ResilienceError::BreakerOpen`]
//! - Half-open: a single trial call is let through
//!
//! # Transitions
//! ```text
//! Closed    → Open:      consecutive_failures >= failure_threshold
//! Open      → Half-open: recovery_timeout elapsed (checked lazily on the next call)
//! Half-open → Closed:    trial call succeeds
//! Half-open → Open:      trial call fails (opened_at is reset)
//! any       → Closed:    reset()
//! ```
//!
//! Breakers are created lazily by [`BreakerRegistry::get`], one per dependency
//! name. The state lock is a synchronous mutex and is never held while the
//! wrapped call runs.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::ResilienceError;
use crate::observability::Metrics;
use crate::work::UnitOfWork;

/// Classifies an error as countable toward the failure threshold
pub type ErrorPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker configuration
#[derive(Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub countable: ErrorPredicate,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            countable: Arc::new(|err: &ResilienceError| err.is_countable()),
        }
    }

    /// Replace the countable-error predicate
    pub fn with_countable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.countable = Arc::new(predicate);
        self
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_trial_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
    rejected: u64,
}

/// Point-in-time view of a breaker, for operators and metrics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_trial_in_flight: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub rejected: u64,
}

/// Circuit breaker guarding one named dependency
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            metrics: None,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_trial_in_flight: false,
                last_failure_at: None,
                rejected: 0,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Stored state; an expired OPEN breaker only turns HALF_OPEN on the next call
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Ask permission to make one call
    ///
    /// The returned permit must be settled with [`BreakerPermit::record`]. A
    /// trial permit dropped without an outcome frees the trial slot and leaves
    /// the breaker half-open.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, ResilienceError> {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open {
            let now = self.clock.now();
            let recovered = inner
                .opened_at
                .is_none_or(|opened| now.saturating_duration_since(opened) >= self.config.recovery_timeout);

            if recovered {
                self.transition(&mut inner, BreakerState::HalfOpen);
            } else {
                return Err(self.reject(&mut inner));
            }
        }

        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, false)),
            BreakerState::HalfOpen if !inner.half_open_trial_in_flight => {
                inner.half_open_trial_in_flight = true;
                Ok(BreakerPermit::new(self, true))
            }
            _ => Err(self.reject(&mut inner)),
        }
    }

    /// Run a unit of work through the breaker
    pub async fn call<W>(&self, work: &W) -> Result<W::Output, ResilienceError>
    where
        W: UnitOfWork + ?Sized,
    {
        let permit = self.acquire()?;
        let result = work.execute().await;
        permit.record(&result);
        result
    }

    /// Run a blocking operation through the breaker
    pub fn call_blocking<T, F>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Result<T, ResilienceError>,
    {
        let permit = self.acquire()?;
        let result = op();
        permit.record(&result);
        result
    }

    /// Force the breaker closed, discarding its history
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_trial_in_flight = false;
        info!(dependency = %self.name, "Circuit breaker manually reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout.as_millis() as u64,
            half_open_trial_in_flight: inner.half_open_trial_in_flight,
            last_failure_at: inner.last_failure_at,
            rejected: inner.rejected,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen if trial => {
                inner.half_open_trial_in_flight = false;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                self.transition(&mut inner, BreakerState::Closed);
            }
            BreakerState::Closed => inner.consecutive_failures = 0,
            // A call admitted before the breaker opened says nothing about recovery
            _ => {}
        }
    }

    fn on_failure(&self, err: &ResilienceError, trial: bool) {
        let mut inner = self.inner.lock();

        if !(self.config.countable)(err) {
            if trial {
                inner.half_open_trial_in_flight = false;
            }
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            BreakerState::HalfOpen if trial => {
                inner.half_open_trial_in_flight = false;
                inner.opened_at = Some(self.clock.now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.opened_at = Some(self.clock.now());
                self.transition(&mut inner, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        self.inner.lock().half_open_trial_in_flight = false;
    }

    fn reject(&self, inner: &mut Inner) -> ResilienceError {
        inner.rejected += 1;
        if let Some(metrics) = &self.metrics {
            metrics.breaker_rejected(&self.name);
        }
        ResilienceError::BreakerOpen(self.name.clone())
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;

        if to == BreakerState::Open {
            warn!(
                dependency = %self.name,
                %from,
                failures = inner.consecutive_failures,
                "Circuit breaker opened"
            );
        } else {
            info!(dependency = %self.name, %from, %to, "Circuit breaker transition");
        }

        if let Some(metrics) = &self.metrics {
            metrics.breaker_transition(&self.name, to);
        }
    }
}

/// Permission to make one call through a breaker
#[must_use = "a permit must be settled with `record`"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Feed the outcome of the guarded call back into the breaker
    pub fn record<T>(mut self, outcome: &Result<T, ResilienceError>) {
        self.settled = true;
        match outcome {
            Ok(_) => self.breaker.on_success(self.trial),
            Err(err) => self.breaker.on_failure(err, self.trial),
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Process-wide map of dependency name → breaker
///
/// Injected into the components that need it rather than held in a global, so
/// tests can build isolated registries.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: Mutex<HashMap<String, BreakerConfig>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            overrides: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use a dedicated configuration for one dependency
    ///
    /// Only affects breakers created after the call.
    pub fn configure(&self, name: impl Into<String>, config: BreakerConfig) {
        self.overrides.lock().insert(name.into(), config);
    }

    /// Breaker for `name`, created on first use
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(existing) = breakers.get(name) {
            return existing.clone();
        }

        let config = self
            .overrides
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());

        let mut breaker = CircuitBreaker::new(name, config, self.clock.clone());
        if let Some(metrics) = &self.metrics {
            breaker = breaker.with_metrics(metrics.clone());
        }

        let breaker = Arc::new(breaker);
        breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }

    pub fn reset(&self, name: &str) -> Result<(), ResilienceError> {
        let breaker = self
            .find(name)
            .ok_or_else(|| ResilienceError::NotFound(format!("breaker {name}")))?;
        breaker.reset();
        Ok(())
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default(), SystemClock::shared())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery: Duration) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(
            "geo-api",
            BreakerConfig::new(threshold, recovery),
            Arc::new(clock.clone()),
        );
        (breaker, clock)
    }

    fn fail() -> Result<(), ResilienceError> {
        Err(ResilienceError::dependency("geo-api", "503"))
    }

    #[test]
    fn test_opens_after_threshold_and_skips_underlying_call() {
        let (breaker, _clock) = breaker(3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result = breaker.call_blocking(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                fail()
            });
            assert!(matches!(result, Err(ResilienceError::DependencyUnavailable { .. })));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let result = breaker.call_blocking(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(result, Err(ResilienceError::BreakerOpen("geo-api".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.snapshot().rejected, 1);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (breaker, _clock) = breaker(3, Duration::from_secs(30));

        let _ = breaker.call_blocking(fail);
        let _ = breaker.call_blocking(fail);
        breaker.call_blocking(|| Ok(())).unwrap();
        let _ = breaker.call_blocking(fail);
        let _ = breaker.call_blocking(fail);

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_validation_errors_are_not_counted() {
        let (breaker, _clock) = breaker(2, Duration::from_secs(30));

        for _ in 0..5 {
            let _ = breaker.call_blocking(|| -> Result<(), _> {
                Err(ResilienceError::validation("bad coordinates"))
            });
        }

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_custom_countable_predicate() {
        let clock = ManualClock::new();
        let config = BreakerConfig::new(1, Duration::from_secs(5))
            .with_countable(|err| matches!(err, ResilienceError::Validation(_)));
        let breaker = CircuitBreaker::new("strict", config, Arc::new(clock));

        let _ = breaker.call_blocking(fail);
        assert_eq!(breaker.state(), BreakerState::Closed);

        let _ = breaker.call_blocking(|| -> Result<(), _> { Err(ResilienceError::validation("x")) });
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_allows_single_trial_call() {
        let (breaker, clock) = breaker(1, Duration::from_secs(10));
        let _ = breaker.call_blocking(fail);
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(Duration::from_secs(9));
        assert!(breaker.acquire().is_err());

        clock.advance(Duration::from_secs(1));
        let trial = breaker.acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // siblings are rejected while the trial is in flight
        assert!(matches!(breaker.acquire(), Err(ResilienceError::BreakerOpen(_))));
        assert!(matches!(breaker.acquire(), Err(ResilienceError::BreakerOpen(_))));

        trial.record(&Ok::<_, ResilienceError>(()));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_failed_trial_call_reopens_with_fresh_timer() {
        let (breaker, clock) = breaker(1, Duration::from_secs(10));
        let _ = breaker.call_blocking(fail);

        clock.advance(Duration::from_secs(10));
        let _ = breaker.call_blocking(fail);
        assert_eq!(breaker.state(), BreakerState::Open);

        // opened_at was reset by the failed trial
        clock.advance(Duration::from_secs(5));
        assert!(breaker.acquire().is_err());

        clock.advance(Duration::from_secs(5));
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn test_abandoned_trial_frees_slot() {
        let (breaker, clock) = breaker(1, Duration::from_secs(1));
        let _ = breaker.call_blocking(fail);
        clock.advance(Duration::from_secs(1));

        {
            let _trial = breaker.acquire().unwrap();
        }

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.acquire().unwrap().is_trial());
    }

    #[test]
    fn test_manual_reset() {
        let (breaker, _clock) = breaker(1, Duration::from_secs(600));
        let _ = breaker.call_blocking(fail);
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.call_blocking(|| Ok(())).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_half_open_admits_exactly_one() {
        let clock = ManualClock::new();
        let breaker = Arc::new(CircuitBreaker::new(
            "db",
            BreakerConfig::new(1, Duration::from_secs(1)),
            Arc::new(clock.clone()),
        ));
        let _ = breaker.call_blocking(fail);
        clock.advance(Duration::from_secs(2));

        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let admitted = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let breaker = breaker.clone();
            let admitted = admitted.clone();
            let release_rx = release_rx.clone();
            tasks.push(tokio::spawn(async move {
                let work = move || {
                    let admitted = admitted.clone();
                    let mut release_rx = release_rx.clone();
                    async move {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.wait_for(|released| *released).await;
                        Ok::<_, ResilienceError>(())
                    }
                };
                breaker.call(&work).await
            }));
        }

        // let every task reach the breaker before releasing the trial
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(true).unwrap();

        let mut rejected = 0;
        for task in tasks {
            if let Err(ResilienceError::BreakerOpen(_)) = task.await.unwrap() {
                rejected += 1;
            }
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(rejected, 7);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_registry_creates_lazily_and_isolates() {
        let clock = ManualClock::new();
        let registry = BreakerRegistry::new(BreakerConfig::new(2, Duration::from_secs(1)), Arc::new(clock));
        registry.configure("payments", BreakerConfig::new(1, Duration::from_secs(1)));

        assert!(registry.find("payments").is_none());
        let payments = registry.get("payments");
        let geo = registry.get("geo");
        assert!(Arc::ptr_eq(&payments, &registry.get("payments")));

        let _ = payments.call_blocking(fail);
        assert_eq!(payments.state(), BreakerState::Open);
        assert_eq!(geo.state(), BreakerState::Closed);

        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["geo", "payments"]);

        registry.reset("payments").unwrap();
        assert_eq!(payments.state(), BreakerState::Closed);
        assert!(matches!(registry.reset("missing"), Err(ResilienceError::NotFound(_))));
    }
}
