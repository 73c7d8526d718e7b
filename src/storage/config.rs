//! Storage configuration.

use std::path::PathBuf;
use std::sync::Arc;

use super::{LocalStorage, S3Config, S3Storage, StorageBackend};

/// Storage backend type
#[derive(Debug, Clone)]
pub enum StorageType {
    /// Local filesystem storage
    Local { path: PathBuf },
    /// S3-compatible storage (AWS S3, MinIO, R2, etc.)
    S3(S3Config),
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Local {
            path: PathBuf::from("./updates-storage"),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Storage backend type
    pub storage_type: StorageType,
}

impl StorageConfig {
    /// Create config for local storage at the given path
    pub fn local(path: PathBuf) -> Self {
        Self {
            storage_type: StorageType::Local { path },
        }
    }

    /// Create config for S3-compatible storage
    pub fn s3(config: S3Config) -> Self {
        Self {
            storage_type: StorageType::S3(config),
        }
    }

    /// Human-readable mode for startup logs
    pub fn mode(&self) -> &'static str {
        match &self.storage_type {
            StorageType::Local { .. } => "local",
            StorageType::S3(_) => "s3",
        }
    }

    /// Build a storage backend from this config
    pub async fn build(&self) -> std::io::Result<Arc<dyn StorageBackend>> {
        match &self.storage_type {
            StorageType::Local { path } => {
                tokio::fs::create_dir_all(path).await?;
                Ok(Arc::new(LocalStorage::new(path.clone())))
            }
            StorageType::S3(config) => Ok(Arc::new(S3Storage::new(config.clone()).await)),
        }
    }
}
