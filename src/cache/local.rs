//! In-process cache with per-key expiry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::Cache;
use crate::error::Result;

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Writes between two sweeps of expired entries
const SWEEP_EVERY: usize = 256;

/// Cache backed by a concurrent map. Expired entries are dropped on read and
/// by a periodic sweep on write, so keys that are never read again do not
/// accumulate.
#[derive(Default)]
pub struct LocalCache {
    entries: DashMap<String, CacheEntry>,
    writes: AtomicUsize,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not swept yet
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn sweep(&self, now: Instant) {
        let before = self.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            tracing::debug!("Swept {} expired cache entries ({} left)", removed, self.len());
        }
    }
}

#[async_trait]
impl Cache for LocalCache {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let value = {
            let entry = self.entries.get(key)?;
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.value.clone())
            }
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        value
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = LocalCache::new();
        assert_eq!(cache.get("missing").await, None);

        cache.set("k", "v".to_string(), None).await.unwrap();
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        cache.set("k", "v2".to_string(), None).await.unwrap();
        assert_eq!(cache.get("k").await.as_deref(), Some("v2"));

        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = LocalCache::new();
        cache
            .set("short", "old".to_string(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        cache.set("forever", "kept".to_string(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("forever").await.as_deref(), Some("kept"));
        // The expired entry was dropped by the read
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let cache = LocalCache::new();
        for i in 0..10 {
            cache.set(&format!("k{}", i), i.to_string(), None).await.unwrap();
        }
        cache.clear().await.unwrap();
        for i in 0..10 {
            assert_eq!(cache.get(&format!("k{}", i)).await, None);
        }
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_unread_expired_entries_are_swept_on_write() {
        let cache = LocalCache::new();
        for i in 0..10 {
            cache
                .set(&format!("stale{}", i), "old".to_string(), Some(Duration::from_millis(10)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Never read the stale keys again; only write fresh ones
        for i in 0..SWEEP_EVERY {
            cache.set(&format!("fresh{}", i), i.to_string(), None).await.unwrap();
        }
        assert_eq!(cache.len(), SWEEP_EVERY);
        assert_eq!(cache.get("fresh0").await.as_deref(), Some("0"));
    }
}
