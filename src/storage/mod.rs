//! Storage backend abstraction.
//!
//! Provides a pluggable storage layer that can be backed by:
//! - Local filesystem (default)
//! - S3-compatible object storage (AWS S3, MinIO, R2, etc.)
//!
//! [`Bucket`] lays updates out on top of either backend and is the only
//! component that knows the folder layout.

mod backend;
mod bucket;
mod config;
mod local;
mod s3;
mod upload_url;

pub use backend::{namespaces, StorageBackend, StorageError};
pub use bucket::{
    validate_file_name, Bucket, FileUploadRequest, UpdateLocation, UPDATE_METADATA_FILE,
};
pub use config::{StorageConfig, StorageType};
pub use local::LocalStorage;
pub use s3::{S3Config, S3Storage};
pub use upload_url::{UploadUrlParams, UploadUrlSigner};
