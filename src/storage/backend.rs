//! Storage backend trait definition.
//!
//! Provides an abstraction over different storage backends (local filesystem, S3)
//! addressed by namespace and a `/`-separated key, so an update folder is just a
//! key prefix.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Storage error types
#[derive(Debug)]
pub enum StorageError {
    /// Object not found
    NotFound(String),
    /// Key rejected before reaching the backend
    InvalidKey(String),
    /// IO error
    Io(std::io::Error),
    /// Other error
    Other(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(key) => write!(f, "Object not found: {}", key),
            StorageError::InvalidKey(key) => write!(f, "Invalid key: {}", key),
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Other(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage backend trait for pluggable storage.
///
/// Keys may contain `/`; a prefix ending at a `/` boundary behaves like a
/// directory for `list_children` and `delete_prefix`.
///
/// `put` must be atomic: a concurrent reader sees either no object or the
/// complete object, never a partial write.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs
    fn kind(&self) -> &'static str;

    /// Object path as the backing store (and a CDN in front of it) sees it
    fn object_key(&self, namespace: &str, key: &str) -> String {
        format!("{}/{}", namespace, key)
    }

    /// Get an object by namespace and key
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Bytes>;

    /// Get a reader for streaming large objects
    async fn get_stream(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Box<dyn tokio::io::AsyncRead + Unpin + Send>>;

    /// Put an object by namespace and key, atomically
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> StorageResult<()>;

    /// Check if an object exists
    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// List the immediate children (one path segment) below `prefix`.
    /// Names starting with `.` are hidden.
    async fn list_children(&self, namespace: &str, prefix: &str) -> StorageResult<Vec<String>>;

    /// Delete every object below `prefix`. Deleting an absent prefix succeeds.
    async fn delete_prefix(&self, namespace: &str, prefix: &str) -> StorageResult<()>;

    /// Issue a pre-signed PUT URL for direct client upload, if the backend
    /// supports it
    async fn presign_put(
        &self,
        namespace: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<Option<String>>;
}

/// Storage namespaces
pub mod namespaces {
    /// Published updates: `{branch}/{runtimeVersion}/{updateId}/{file}`
    pub const UPDATES: &str = "updates";
}
