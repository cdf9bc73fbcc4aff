//! Two-tier cache: a bounded local LRU in front of an optional shared tier
//!
//! Reads try the local tier, then the shared tier; a shared hit is copied
//! into the local tier with the remaining TTL the backend reports, unless a
//! local write, delete or clear landed while the shared read was in flight.
//! Writes go to the shared tier first and then the local tier, so a read
//! racing a write can never leave the old value behind locally. Shared-tier
//! failures (errors, timeouts, an open breaker)
//! never reach the caller: the operation continues against the local tier,
//! a warning is logged and the degraded counter is bumped.

pub mod key;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis;
pub mod shared;

pub use key::KeyBuilder;
pub use local::{LocalTier, LocalTierStats};
pub use shared::{MemorySharedTier, SharedHit, SharedTier};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::error::ResilienceError;
use crate::observability::Metrics;

const DEFAULT_SHARED_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
}

/// Cache statistics for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    pub degraded: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    pub shared_tier: Option<String>,
}

pub struct TieredCache {
    local: LocalTier,
    shared: Option<Arc<dyn SharedTier>>,
    breaker: Option<Arc<CircuitBreaker>>,
    shared_timeout: Duration,
    default_ttl: Duration,
    metrics: Arc<Metrics>,
    counters: Counters,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("local", &self.local)
            .field("shared", &self.shared.as_ref().map(|s| s.name().to_string()))
            .field("shared_timeout", &self.shared_timeout)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl TieredCache {
    /// Local-only cache
    pub fn new(capacity: usize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            local: LocalTier::new(capacity, clock),
            shared: None,
            breaker: None,
            shared_timeout: DEFAULT_SHARED_TIMEOUT,
            default_ttl,
            metrics: Arc::new(Metrics::new()),
            counters: Counters::default(),
        }
    }

    /// Attach a shared tier, optionally guarded by a breaker
    pub fn with_shared(
        mut self,
        shared: Arc<dyn SharedTier>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        self.shared = Some(shared);
        self.breaker = breaker;
        self
    }

    pub fn with_shared_timeout(mut self, timeout: Duration) -> Self {
        self.shared_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let generation = self.local.generation();
        if let Some(value) = self.local.get(key) {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_local_hit();
            return Some(value);
        }

        if let Some(shared) = &self.shared {
            if let Some(Some(hit)) = self.shared_op("get", key, shared.get(key)).await {
                let ttl = hit.ttl.unwrap_or(self.default_ttl);
                match self.local.set_if_unchanged(key, hit.value.clone(), ttl, generation) {
                    Some(evicted) if evicted > 0 => self.metrics.cache_evicted(evicted as u64),
                    Some(_) => {}
                    None => debug!(key, "Local tier changed during shared read, not filling"),
                }
                self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_shared_hit();
                return Some(hit.value);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_miss();
        None
    }

    pub async fn set(&self, key: &str, value: impl Into<Bytes>, ttl: Duration) {
        let value = value.into();

        if let Some(shared) = &self.shared {
            if ttl.is_zero() {
                self.shared_op("delete", key, shared.delete(key)).await;
            } else {
                self.shared_op("set", key, shared.set(key, value.clone(), ttl)).await;
            }
        }

        self.store_local(key, value, ttl);
    }

    /// Store with the cache's default TTL
    pub async fn put(&self, key: &str, value: impl Into<Bytes>) {
        self.set(key, value, self.default_ttl).await;
    }

    pub async fn delete(&self, key: &str) {
        if let Some(shared) = &self.shared {
            self.shared_op("delete", key, shared.delete(key)).await;
        }
        self.local.delete(key);
    }

    /// Drop every key under `namespace` (`namespace:*`), or everything
    ///
    /// Returns how many local entries were removed.
    pub async fn clear(&self, namespace: Option<&str>) -> usize {
        let prefix = namespace.map(|ns| format!("{ns}:"));

        if let Some(shared) = &self.shared {
            let label = prefix.as_deref().unwrap_or("*");
            self.shared_op("clear", label, shared.clear(prefix.as_deref()))
                .await;
        }

        let removed = self.local.clear_prefix(prefix.as_deref());

        debug!(namespace = ?namespace, removed, "Cache cleared");
        removed
    }

    /// Read and decode a JSON value; undecodable entries count as a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "Dropping undecodable cache entry");
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), ResilienceError> {
        let raw = serde_json::to_vec(value)
            .map_err(|err| ResilienceError::validation(format!("cache value for {key}: {err}")))?;
        self.set(key, raw, ttl).await;
        Ok(())
    }

    /// Return the cached value for `key`, or compute, store and return it
    ///
    /// Errors from `compute` are returned as-is and nothing is cached.
    pub async fn get_or_insert_with<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, ResilienceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        if let Some(cached) = self.get_json(key).await {
            return Ok(cached);
        }

        let value = compute().await?;
        self.set_json(key, &value, ttl).await?;
        Ok(value)
    }

    /// Drop expired local entries; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        self.local.sweep_expired()
    }

    /// Periodically sweep expired local entries until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }

    pub fn stats(&self) -> CacheStats {
        let local = self.local.stats();
        let local_hits = self.counters.local_hits.load(Ordering::Relaxed);
        let shared_hits = self.counters.shared_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = local_hits + shared_hits + misses;

        CacheStats {
            entries: local.entries,
            capacity: local.capacity,
            local_hits,
            shared_hits,
            misses,
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            evictions: local.evictions,
            expirations: local.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (local_hits + shared_hits) as f64 / lookups as f64
            },
            shared_tier: self.shared.as_ref().map(|s| s.name().to_string()),
        }
    }

    fn store_local(&self, key: &str, value: Bytes, ttl: Duration) {
        let evicted = self.local.set(key, value, ttl);
        if evicted > 0 {
            self.metrics.cache_evicted(evicted as u64);
        }
    }

    /// Run one shared-tier operation; `None` means the tier was unavailable
    async fn shared_op<T, Fut>(&self, op: &'static str, key: &str, fut: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let permit = match self.breaker.as_ref().map(|b| b.acquire()).transpose() {
            Ok(permit) => permit,
            Err(err) => {
                self.degrade(op, key, &err);
                return None;
            }
        };

        let result = tokio::time::timeout(self.shared_timeout, fut)
            .await
            .unwrap_or(Err(ResilienceError::Timeout(self.shared_timeout)));

        if let Some(permit) = permit {
            permit.record(&result);
        }

        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.degrade(op, key, &err);
                None
            }
        }
    }

    fn degrade(&self, op: &'static str, key: &str, err: &ResilienceError) {
        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_degraded();
        warn!(op, key, error = %err, "Shared cache unavailable, continuing with local tier");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::clock::ManualClock;
    use crate::observability::Gauges;
    use serde::Deserialize;
    use std::sync::atomic::AtomicU32;

    fn local_only(clock: &ManualClock) -> TieredCache {
        TieredCache::new(100, Duration::from_secs(60), Arc::new(clock.clone()))
    }

    fn tiered(clock: &ManualClock) -> (TieredCache, Arc<MemorySharedTier>) {
        let shared = Arc::new(MemorySharedTier::new(100, Arc::new(clock.clone())));
        let cache = local_only(clock).with_shared(shared.clone(), None);
        (cache, shared)
    }

    #[tokio::test]
    async fn test_set_get_and_expire() {
        let clock = ManualClock::new();
        let (cache, _shared) = tiered(&clock);

        cache.set("k", "v", Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));

        clock.advance(Duration::from_millis(1100));
        assert_eq!(cache.get("k").await, None);

        // expired keys are not repopulated from anywhere
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_shared_hit_populates_local_with_remaining_ttl() {
        let clock = ManualClock::new();
        let (cache, shared) = tiered(&clock);

        shared.set("k", Bytes::from_static(b"remote"), Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(4));

        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"remote")));
        assert_eq!(cache.stats().shared_hits, 1);

        let local = cache.local().get_entry("k").unwrap();
        assert_eq!(local.remaining, Duration::from_secs(6));

        // the second read is served locally
        assert!(cache.get("k").await.is_some());
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_shared_outage_degrades_to_local() {
        let clock = ManualClock::new();
        let metrics = Arc::new(Metrics::new());
        let (cache, shared) = tiered(&clock);
        let cache = cache.with_metrics(metrics.clone());
        shared.set_available(false);

        cache.set("k", "v", Duration::from_secs(30)).await;
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));
        assert_eq!(cache.get("missing").await, None);

        let stats = cache.stats();
        // set + the shared lookup for "missing"
        assert_eq!(stats.degraded, 2);
        assert!(metrics.render(&Gauges::default()).contains("bulwark_cache_degraded_total 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_shared_read_stays_deleted() {
        let clock = ManualClock::new();
        let (cache, shared) = tiered(&clock);
        let cache = Arc::new(cache);
        shared.set("k", Bytes::from_static(b"v1"), Duration::from_secs(60)).await.unwrap();
        shared.set_latency(Duration::from_millis(50));

        let reader = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get("k").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.delete("k").await;
        reader.await.unwrap();

        assert!(cache.local().get("k").is_none());
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_during_shared_read_wins() {
        let clock = ManualClock::new();
        let (cache, shared) = tiered(&clock);
        let cache = Arc::new(cache);
        shared.set("k", Bytes::from_static(b"v1"), Duration::from_secs(60)).await.unwrap();
        shared.set_latency(Duration::from_millis(50));

        let reader = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get("k").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("k", "v2", Duration::from_secs(60)).await;
        reader.await.unwrap();

        assert_eq!(cache.local().get("k"), Some(Bytes::from_static(b"v2")));
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_shared_tier_times_out() {
        let clock = ManualClock::new();
        let (cache, shared) = tiered(&clock);
        let cache = cache.with_shared_timeout(Duration::from_millis(50));
        shared.set_latency(Duration::from_secs(2));

        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().degraded, 1);
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_shared_tier() {
        let clock = ManualClock::new();
        let shared = Arc::new(MemorySharedTier::new(100, Arc::new(clock.clone())));
        let breaker = Arc::new(CircuitBreaker::new(
            "shared-cache",
            BreakerConfig::new(2, Duration::from_secs(30)),
            Arc::new(clock.clone()),
        ));
        let cache = local_only(&clock).with_shared(shared.clone(), Some(breaker.clone()));
        shared.set_available(false);

        cache.get("a").await;
        cache.get("b").await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // the tier is back but the breaker still rejects until recovery
        shared.set_available(true);
        shared.set("c", Bytes::from_static(b"1"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("c").await, None);
        assert_eq!(cache.stats().degraded, 3);

        clock.advance(Duration::from_secs(30));
        assert_eq!(cache.get("c").await, Some(Bytes::from_static(b"1")));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_clear_namespace() {
        let clock = ManualClock::new();
        let (cache, shared) = tiered(&clock);

        cache.put("stations:1", "a").await;
        cache.put("stations:2", "b").await;
        cache.put("users:1", "c").await;

        assert_eq!(cache.clear(Some("stations")).await, 2);
        assert!(cache.get("stations:1").await.is_none());
        assert!(cache.get("users:1").await.is_some());
        assert_eq!(shared.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_removes_from_both_tiers() {
        let clock = ManualClock::new();
        let (cache, shared) = tiered(&clock);

        cache.put("k", "v").await;
        cache.set("k", "v2", Duration::ZERO).await;

        assert!(cache.get("k").await.is_none());
        assert!(shared.is_empty());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Station {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_get_or_insert_with_computes_once() {
        let clock = ManualClock::new();
        let cache = local_only(&clock);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let station = cache
                .get_or_insert_with("stations:7", Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Station { id: 7, name: "Central".into() })
                })
                .await
                .unwrap();
            assert_eq!(station.id, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_insert_with_does_not_cache_errors() {
        let clock = ManualClock::new();
        let cache = local_only(&clock);

        let result: Result<Station, _> = cache
            .get_or_insert_with("k", Duration::from_secs(60), || async {
                Err(ResilienceError::dependency("db", "down"))
            })
            .await;

        assert!(result.is_err());
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_json_is_a_miss() {
        let clock = ManualClock::new();
        let cache = local_only(&clock);
        cache.put("k", "not json").await;

        assert!(cache.get_json::<Station>("k").await.is_none());
        assert!(cache.local().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_expired_entries() {
        let cache = Arc::new(TieredCache::new(
            100,
            Duration::from_secs(60),
            crate::clock::SystemClock::shared(),
        ));
        cache.set("short", "x", Duration::from_millis(500)).await;

        let token = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(1), token.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.local().len(), 0);

        token.cancel();
        handle.await.unwrap();
    }
}
