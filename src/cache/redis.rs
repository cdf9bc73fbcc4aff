//! Redis-backed shared tier (`redis` feature)

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::info;

use crate::cache::shared::{SharedHit, SharedTier};
use crate::error::ResilienceError;

const SCAN_BATCH: usize = 500;

fn unavailable(err: redis::RedisError) -> ResilienceError {
    ResilienceError::dependency("redis", err.to_string())
}

/// Shared tier on a multiplexed Redis connection
#[derive(Clone)]
pub struct RedisSharedTier {
    conn: MultiplexedConnection,
}

impl RedisSharedTier {
    pub async fn connect(redis_url: &str) -> Result<Self, ResilienceError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        info!(url = %redis_url, "Connected to shared cache");
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedTier for RedisSharedTier {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<SharedHit>, ResilienceError> {
        let mut conn = self.conn.clone();
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        // PTTL is -1 for keys without expiry and -2 for missing keys
        let ttl = u64::try_from(pttl).ok().map(Duration::from_millis);
        Ok(value.map(|value| SharedHit {
            value: Bytes::from(value),
            ttl,
        }))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), ResilienceError> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().max(1) as u64;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ResilienceError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<(), ResilienceError> {
        let mut conn = self.conn.clone();

        let Some(prefix) = prefix else {
            let _: () = redis::cmd("FLUSHDB")
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            return Ok(());
        };

        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            if !keys.is_empty() {
                let _: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
            }

            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}
