//! Shared (out-of-process) cache tier

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cache::local::LocalTier;
use crate::clock::Clock;
use crate::error::ResilienceError;

/// A value read from the shared tier
#[derive(Debug, Clone, PartialEq)]
pub struct SharedHit {
    pub value: Bytes,
    /// Remaining lifetime as reported by the backend, if it tracks one
    pub ttl: Option<Duration>,
}

/// Backend for the shared tier
///
/// Any error means "tier unavailable"; the tiered cache logs it, counts it
/// and carries on with the local tier only.
#[async_trait]
pub trait SharedTier: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<SharedHit>, ResilienceError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), ResilienceError>;

    async fn delete(&self, key: &str) -> Result<(), ResilienceError>;

    /// Remove keys starting with `prefix`, or every key when `None`
    async fn clear(&self, prefix: Option<&str>) -> Result<(), ResilienceError>;
}

/// In-memory shared tier
///
/// Stands in for a remote cache in tests and single-process deployments. It
/// can be switched offline or slowed down to exercise degraded operation.
#[derive(Debug)]
pub struct MemorySharedTier {
    store: LocalTier,
    available: AtomicBool,
    latency: Mutex<Duration>,
}

impl MemorySharedTier {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: LocalTier::new(capacity, clock),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    async fn check(&self) -> Result<(), ResilienceError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResilienceError::dependency("memory-cache", "connection refused"))
        }
    }
}

#[async_trait]
impl SharedTier for MemorySharedTier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<SharedHit>, ResilienceError> {
        self.check().await?;
        Ok(self.store.get_entry(key).map(|hit| SharedHit {
            value: hit.value,
            ttl: Some(hit.remaining),
        }))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), ResilienceError> {
        self.check().await?;
        self.store.set(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ResilienceError> {
        self.check().await?;
        self.store.delete(key);
        Ok(())
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<(), ResilienceError> {
        self.check().await?;
        self.store.clear_prefix(prefix);
        Ok(())
    }
}
