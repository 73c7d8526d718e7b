//! Redis-backed cache shared between server replicas.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::Cache;
use crate::error::{Result, ServerError};

const KEY_PREFIX: &str = "ota:";
/// Keys examined per SCAN round trip
const SCAN_COUNT: usize = 500;

pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    /// Connect and ping; fails if the server is unreachable within `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| ServerError::Cache(e.to_string()))?;

        let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| ServerError::Cache("redis connection timed out".to_string()))?
            .map_err(|e| ServerError::Cache(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| ServerError::Cache(e.to_string()))?;

        Ok(Self { conn })
    }

    fn key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match redis::cmd("GET")
            .arg(Self::key(key))
            .query_async::<_, Option<String>>(&mut conn)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("redis GET {} failed, treating as miss: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(Self::key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| ServerError::Cache(e.to_string()))
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("DEL")
            .arg(Self::key(key))
            .query_async::<_, ()>(&mut conn)
            .await
        {
            tracing::warn!("redis DEL {} failed: {}", key, e);
        }
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| ServerError::Cache(e.to_string()))?;

            if !keys.is_empty() {
                removed += keys.len();
                redis::cmd("DEL")
                    .arg(keys)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| ServerError::Cache(e.to_string()))?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tracing::debug!("Cleared {} redis cache keys", removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs against a live server when `REDIS_URL` is set
    async fn cache() -> Option<RedisCache> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisCache::connect(&url, Duration::from_secs(2)).await.unwrap())
    }

    #[tokio::test]
    async fn test_clear_only_removes_prefixed_keys() {
        let Some(cache) = cache().await else {
            return;
        };
        let mut conn = cache.conn.clone();
        redis::cmd("SET")
            .arg("foreign:key")
            .arg("kept")
            .query_async::<_, ()>(&mut conn)
            .await
            .unwrap();
        // More keys than one SCAN page
        for i in 0..(SCAN_COUNT * 2 + 7) {
            cache.set(&format!("k{}", i), i.to_string(), None).await.unwrap();
        }

        cache.clear().await.unwrap();

        assert_eq!(cache.get("k0").await, None);
        assert_eq!(cache.get(&format!("k{}", SCAN_COUNT * 2)).await, None);
        let foreign: Option<String> = redis::cmd("GET")
            .arg("foreign:key")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(foreign.as_deref(), Some("kept"));
        redis::cmd("DEL")
            .arg("foreign:key")
            .query_async::<_, ()>(&mut conn)
            .await
            .unwrap();
    }
}
