//! Key/value cache for disposable derivations (branch mapping documents,
//! computed manifests, account lookups).
//!
//! Exactly one cache is built at startup and shared behind `Arc<dyn Cache>`.
//! Nothing canonical lives here: clearing it only costs latency.

mod local;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use local::LocalCache;
pub use self::redis::RedisCache;

use crate::error::Result;

#[async_trait]
pub trait Cache: Send + Sync {
    /// Short backend name for logs
    fn kind(&self) -> &'static str;

    /// Value for `key`; misses, expired entries and backend read failures are
    /// all `None`.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store `value`; without a TTL the entry lives until deleted or cleared.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str);

    async fn clear(&self) -> Result<()>;
}

/// Cache backend selection
#[derive(Debug, Clone, Default)]
pub enum CacheConfig {
    #[default]
    Local,
    Redis {
        host: String,
        port: u16,
        password: Option<String>,
    },
}

impl CacheConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            CacheConfig::Local => "local",
            CacheConfig::Redis { .. } => "redis",
        }
    }

    fn redis_url(host: &str, port: u16, password: Option<&str>) -> String {
        let mut url = match url::Url::parse("redis://localhost") {
            Ok(url) => url,
            Err(_) => return format!("redis://{}:{}", host, port),
        };
        let _ = url.set_host(Some(host));
        let _ = url.set_port(Some(port));
        if let Some(password) = password {
            let _ = url.set_password(Some(password));
        }
        url.to_string()
    }

    /// Build the process-wide cache. A redis backend that cannot be reached
    /// falls back to the local cache instead of failing startup.
    pub async fn build(&self) -> Arc<dyn Cache> {
        match self {
            CacheConfig::Local => Arc::new(LocalCache::new()),
            CacheConfig::Redis {
                host,
                port,
                password,
            } => {
                let url = Self::redis_url(host, *port, password.as_deref());
                match RedisCache::connect(&url, Duration::from_secs(5)).await {
                    Ok(cache) => Arc::new(cache),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to initialize Redis cache (host: {}, port: {}): {}. Falling back to local cache.",
                            host,
                            port,
                            e
                        );
                        Arc::new(LocalCache::new())
                    }
                }
            }
        }
    }
}
