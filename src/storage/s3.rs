//! S3-compatible storage backend.
//!
//! Provides update storage on S3 with:
//! - Delimiter listing so update folders behave like directories
//! - Pre-signed PUT URLs so publishers upload straight to the bucket
//! - Compatible with AWS S3, MinIO, R2, etc.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{
        http::HttpResponse, Builder, Credentials, Region, RequestChecksumCalculation,
        ResponseChecksumValidation,
    },
    error::{DisplayErrorContext, SdkError},
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use std::time::Duration;

use super::backend::{StorageBackend, StorageError, StorageResult};

/// S3 storage backend configuration
#[derive(Clone, Debug)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Optional prefix for all keys (e.g., "ota/")
    pub prefix: Option<String>,
    /// AWS region
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, etc.)
    pub endpoint: Option<String>,
    /// Force path-style URLs (required for MinIO)
    pub force_path_style: bool,
    /// Static access key pair; the default AWS credential chain is used when unset
    pub credentials: Option<(String, String)>,
}

impl S3Config {
    /// Create config for AWS S3
    pub fn aws(bucket: String, region: String) -> Self {
        Self {
            bucket,
            prefix: None,
            region,
            endpoint: None,
            force_path_style: false,
            credentials: None,
        }
    }

    /// Set a custom endpoint (MinIO, R2, ...)
    pub fn with_endpoint(mut self, endpoint: String, force_path_style: bool) -> Self {
        self.endpoint = Some(endpoint);
        self.force_path_style = force_path_style;
        self
    }

    /// Set a key prefix
    pub fn with_prefix(mut self, prefix: String) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Use a static access key pair
    pub fn with_credentials(mut self, access_key_id: String, secret_access_key: String) -> Self {
        self.credentials = Some((access_key_id, secret_access_key));
        self
    }
}

/// S3-compatible storage backend
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

/// Bare 404 responses (HEAD has no error body to carry a code)
fn status_not_found<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response()
        .is_some_and(|response| response.status().as_u16() == 404)
}

fn get_object_error(
    err: SdkError<GetObjectError, HttpResponse>,
    namespace: &str,
    key: &str,
) -> StorageError {
    if err.as_service_error().is_some_and(GetObjectError::is_no_such_key) || status_not_found(&err) {
        StorageError::NotFound(format!("{}/{}", namespace, key))
    } else {
        StorageError::Other(DisplayErrorContext(&err).to_string())
    }
}

fn other<E: std::error::Error>(err: E) -> StorageError {
    StorageError::Other(DisplayErrorContext(&err).to_string())
}

impl S3Storage {
    /// Create a new S3 storage backend from config
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some((access_key_id, secret_access_key)) = &config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "ota-server",
            ));
        }
        let sdk_config = loader.load().await;

        // Checksums only where an operation requires them (MinIO, R2)
        let mut builder = Builder::from(&sdk_config)
            .behavior_version(BehaviorVersion::latest())
            .force_path_style(config.force_path_style)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        }
    }

    /// Build the full S3 key from namespace and key
    fn full_key(&self, namespace: &str, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}/{}", prefix, namespace, key),
            None => format!("{}/{}", namespace, key),
        }
    }

    /// Full key prefix of a "directory", always ending in `/`
    fn dir_prefix(&self, namespace: &str, prefix: &str) -> String {
        let trimmed = prefix.trim_matches('/');
        if trimmed.is_empty() {
            self.full_key(namespace, "")
        } else {
            format!("{}/", self.full_key(namespace, trimmed))
        }
    }

    /// List full object keys under a full prefix, following continuation tokens
    async fn list_full_keys(&self, full_prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(full_prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let result = request
                .send()
                .await
                .map_err(other)?;

            if let Some(contents) = result.contents {
                keys.extend(contents.into_iter().filter_map(|obj| obj.key));
            }

            if result.is_truncated.unwrap_or(false) {
                continuation_token = result.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn object_key(&self, namespace: &str, key: &str) -> String {
        self.full_key(namespace, key)
    }

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Bytes> {
        let s3_key = self.full_key(namespace, key);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| get_object_error(e, namespace, key))?;

        let data = result
            .body
            .collect()
            .await
            .map_err(other)?;

        Ok(data.into_bytes())
    }

    async fn get_stream(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Box<dyn tokio::io::AsyncRead + Unpin + Send>> {
        let s3_key = self.full_key(namespace, key);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| get_object_error(e, namespace, key))?;

        Ok(Box::new(result.body.into_async_read()))
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> StorageResult<()> {
        // A single PutObject is atomic for readers
        let s3_key = self.full_key(namespace, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(other)?;

        Ok(())
    }

    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let s3_key = self.full_key(namespace, key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error().is_some_and(HeadObjectError::is_not_found)
                    || status_not_found(&e) =>
            {
                Ok(false)
            }
            Err(e) => Err(other(e)),
        }
    }

    async fn list_children(&self, namespace: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = self.dir_prefix(namespace, prefix);
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&dir)
                .delimiter("/");

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let result = request
                .send()
                .await
                .map_err(other)?;

            for common in result.common_prefixes.unwrap_or_default() {
                if let Some(p) = common.prefix {
                    if let Some(name) = p.strip_prefix(&dir) {
                        names.push(name.trim_end_matches('/').to_string());
                    }
                }
            }
            for obj in result.contents.unwrap_or_default() {
                if let Some(key) = obj.key {
                    if let Some(name) = key.strip_prefix(&dir) {
                        names.push(name.to_string());
                    }
                }
            }

            if result.is_truncated.unwrap_or(false) {
                continuation_token = result.next_continuation_token;
            } else {
                break;
            }
        }

        names.retain(|n| !n.is_empty() && !n.starts_with('.'));
        Ok(names)
    }

    async fn delete_prefix(&self, namespace: &str, prefix: &str) -> StorageResult<()> {
        let dir = self.dir_prefix(namespace, prefix);

        // S3 deletes of missing keys succeed, so this is idempotent
        for key in self.list_full_keys(&dir).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(other)?;
        }

        Ok(())
    }

    async fn presign_put(
        &self,
        namespace: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<Option<String>> {
        let s3_key = self.full_key(namespace, key);
        let presigning =
            PresigningConfig::expires_in(expires_in).map_err(other)?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .presigned(presigning)
            .await
            .map_err(other)?;

        Ok(Some(request.uri().to_string()))
    }
}
