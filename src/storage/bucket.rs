//! Update-addressed object store.
//!
//! Lays updates out as `updates/{branch}/{runtimeVersion}/{updateId}/{file}` on
//! whichever [`StorageBackend`] is configured. An update folder becomes
//! discoverable only once its completion marker exists; the marker is written
//! after every asset and the final metadata record.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use super::backend::{namespaces, StorageBackend, StorageError, StorageResult};
use super::upload_url::UploadUrlSigner;

/// Server-owned metadata record of an update
pub const UPDATE_METADATA_FILE: &str = "update-metadata.json";
/// Completion marker; present only on checked updates
pub const CHECK_MARKER_FILE: &str = ".check";
/// Marker making an otherwise empty branch visible
pub const BRANCH_MARKER_FILE: &str = ".branch";

/// Storage address of one update folder
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpdateLocation {
    pub branch: String,
    pub runtime_version: String,
    pub update_id: String,
}

fn validate_segment(segment: &str) -> StorageResult<()> {
    if segment.is_empty()
        || segment.contains('/')
        || segment.contains('\\')
        || segment.starts_with('.')
    {
        return Err(StorageError::InvalidKey(segment.to_string()));
    }
    Ok(())
}

/// Check a publisher-supplied file name: relative, no dot segments, and not
/// one of the server-owned files.
pub fn validate_file_name(name: &str) -> StorageResult<()> {
    if name.starts_with('/') || name == UPDATE_METADATA_FILE {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    for segment in name.split('/') {
        validate_segment(segment)?;
    }
    Ok(())
}

impl UpdateLocation {
    pub fn new(
        branch: impl Into<String>,
        runtime_version: impl Into<String>,
        update_id: impl Into<String>,
    ) -> StorageResult<Self> {
        let location = Self {
            branch: branch.into(),
            runtime_version: runtime_version.into(),
            update_id: update_id.into(),
        };
        validate_segment(&location.branch)?;
        validate_segment(&location.runtime_version)?;
        validate_segment(&location.update_id)?;
        Ok(location)
    }

    /// Key prefix of the update folder
    pub fn prefix(&self) -> String {
        format!("{}/{}/{}", self.branch, self.runtime_version, self.update_id)
    }

    /// Key of a file inside the update folder
    pub fn file_key(&self, file_name: &str) -> String {
        format!("{}/{}", self.prefix(), file_name)
    }
}

impl std::fmt::Display for UpdateLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// One upload descriptor returned to the publisher
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadRequest {
    pub request_upload_url: String,
    pub file_name: String,
    pub file_path: String,
}

pub struct Bucket {
    backend: Arc<dyn StorageBackend>,
    signer: UploadUrlSigner,
}

impl Bucket {
    pub fn new(backend: Arc<dyn StorageBackend>, signer: UploadUrlSigner) -> Self {
        Self { backend, signer }
    }

    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn signer(&self) -> &UploadUrlSigner {
        &self.signer
    }

    pub async fn branch_exists(&self, branch: &str) -> StorageResult<bool> {
        validate_segment(branch)?;
        if self
            .backend
            .exists(namespaces::UPDATES, &format!("{}/{}", branch, BRANCH_MARKER_FILE))
            .await?
        {
            return Ok(true);
        }
        Ok(!self.list_runtime_versions(branch).await?.is_empty())
    }

    pub async fn create_branch(&self, branch: &str) -> StorageResult<()> {
        validate_segment(branch)?;
        self.backend
            .put(
                namespaces::UPDATES,
                &format!("{}/{}", branch, BRANCH_MARKER_FILE),
                Bytes::new(),
            )
            .await
    }

    pub async fn list_runtime_versions(&self, branch: &str) -> StorageResult<Vec<String>> {
        validate_segment(branch)?;
        let mut versions = self.backend.list_children(namespaces::UPDATES, branch).await?;
        versions.sort();
        Ok(versions)
    }

    /// Numeric update ids under a branch/runtime version, newest first.
    /// Folders whose name is not a number are ignored.
    pub async fn list_update_ids(&self, branch: &str, runtime_version: &str) -> StorageResult<Vec<u64>> {
        validate_segment(branch)?;
        validate_segment(runtime_version)?;
        let children = self
            .backend
            .list_children(namespaces::UPDATES, &format!("{}/{}", branch, runtime_version))
            .await?;

        let mut ids: Vec<u64> = children.iter().filter_map(|c| c.parse().ok()).collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.dedup();
        Ok(ids)
    }

    pub async fn is_update_complete(&self, location: &UpdateLocation) -> StorageResult<bool> {
        self.backend
            .exists(namespaces::UPDATES, &location.file_key(CHECK_MARKER_FILE))
            .await
    }

    /// Write the completion marker. Everything else in the folder must already
    /// be in place.
    pub async fn mark_update_complete(&self, location: &UpdateLocation) -> StorageResult<()> {
        self.backend
            .put(
                namespaces::UPDATES,
                &location.file_key(CHECK_MARKER_FILE),
                Bytes::from_static(b"checked"),
            )
            .await
    }

    /// Store one publisher file. Distinct files of the same update may be
    /// uploaded concurrently.
    pub async fn upload_file_into_update(
        &self,
        location: &UpdateLocation,
        file_name: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        validate_file_name(file_name)?;
        tracing::debug!("Uploading {} into update {} ({} bytes)", file_name, location, data.len());
        self.backend
            .put(namespaces::UPDATES, &location.file_key(file_name), data)
            .await
    }

    /// Store a server-owned file (metadata record)
    pub async fn write_file(
        &self,
        location: &UpdateLocation,
        file_name: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        self.backend
            .put(namespaces::UPDATES, &location.file_key(file_name), data)
            .await
    }

    pub async fn read_file(&self, location: &UpdateLocation, file_name: &str) -> StorageResult<Bytes> {
        self.backend
            .get(namespaces::UPDATES, &location.file_key(file_name))
            .await
    }

    pub async fn stream_file(
        &self,
        location: &UpdateLocation,
        file_name: &str,
    ) -> StorageResult<Box<dyn tokio::io::AsyncRead + Unpin + Send>> {
        validate_file_name(file_name)?;
        self.backend
            .get_stream(namespaces::UPDATES, &location.file_key(file_name))
            .await
    }

    pub async fn file_exists(&self, location: &UpdateLocation, file_name: &str) -> StorageResult<bool> {
        self.backend
            .exists(namespaces::UPDATES, &location.file_key(file_name))
            .await
    }

    /// Object path of a publisher file as the backing store exposes it, for
    /// CDN origins that mirror the bucket
    pub fn public_key(&self, location: &UpdateLocation, file_name: &str) -> StorageResult<String> {
        validate_file_name(file_name)?;
        Ok(self
            .backend
            .object_key(namespaces::UPDATES, &location.file_key(file_name)))
    }

    /// Recursive, idempotent delete of an update folder
    pub async fn delete_update_folder(&self, location: &UpdateLocation) -> StorageResult<()> {
        tracing::info!("Deleting update folder {}", location);
        self.backend
            .delete_prefix(namespaces::UPDATES, &location.prefix())
            .await
    }

    /// One upload descriptor per file: a pre-signed backend URL when the
    /// backend supports it, otherwise a signed URL to this server.
    pub async fn request_upload_urls_for_files(
        &self,
        location: &UpdateLocation,
        file_names: &[String],
    ) -> StorageResult<Vec<FileUploadRequest>> {
        let mut requests = Vec::with_capacity(file_names.len());
        for file_name in file_names {
            validate_file_name(file_name)?;
            let key = location.file_key(file_name);
            let url = match self
                .backend
                .presign_put(namespaces::UPDATES, &key, self.signer.expiry())
                .await?
            {
                Some(url) => url,
                None => self.signer.sign(
                    &location.branch,
                    &location.runtime_version,
                    &location.update_id,
                    file_name,
                )?,
            };
            requests.push(FileUploadRequest {
                request_upload_url: url,
                file_name: file_name.clone(),
                file_path: key,
            });
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bucket(dir: &TempDir) -> Bucket {
        Bucket::new(
            Arc::new(LocalStorage::new(dir.path().to_path_buf())),
            UploadUrlSigner::new(
                url::Url::parse("http://ota.test").unwrap(),
                b"secret".to_vec(),
                Duration::from_secs(600),
            ),
        )
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("metadata.json").is_ok());
        assert!(validate_file_name("_expo/static/js/ios/index-abc.hbc").is_ok());
        assert!(validate_file_name("assets/0123abcd").is_ok());

        assert!(validate_file_name("../metadata.json").is_err());
        assert!(validate_file_name("/etc/passwd").is_err());
        assert!(validate_file_name("assets//x").is_err());
        assert!(validate_file_name(UPDATE_METADATA_FILE).is_err());
        assert!(validate_file_name(CHECK_MARKER_FILE).is_err());
    }

    #[tokio::test]
    async fn test_update_ids_are_numeric_newest_first() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);

        for id in ["900", "1000", "20"] {
            let location = UpdateLocation::new("main", "1.0", id).unwrap();
            bucket
                .upload_file_into_update(&location, "metadata.json", Bytes::from("{}"))
                .await
                .unwrap();
            bucket.mark_update_complete(&location).await.unwrap();
        }
        // Newest id but still pending
        let pending = UpdateLocation::new("main", "1.0", "5000").unwrap();
        bucket
            .upload_file_into_update(&pending, "metadata.json", Bytes::from("{}"))
            .await
            .unwrap();

        assert_eq!(
            bucket.list_update_ids("main", "1.0").await.unwrap(),
            vec![5000, 1000, 900, 20]
        );
        assert!(!bucket.is_update_complete(&pending).await.unwrap());
        assert!(bucket
            .is_update_complete(&UpdateLocation::new("main", "1.0", "1000").unwrap())
            .await
            .unwrap());
        assert!(bucket.list_update_ids("main", "2.0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_branch_upsert_and_listing() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);

        assert!(!bucket.branch_exists("main").await.unwrap());
        bucket.create_branch("main").await.unwrap();
        bucket.create_branch("main").await.unwrap();
        assert!(bucket.branch_exists("main").await.unwrap());
        assert!(!bucket.branch_exists("other").await.unwrap());
        assert!(bucket.list_runtime_versions("main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_upload_urls_point_back_at_server() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);
        let location = UpdateLocation::new("main", "1.0", "100").unwrap();

        let urls = bucket
            .request_upload_urls_for_files(
                &location,
                &["metadata.json".to_string(), "assets/a".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1].file_name, "assets/a");
        assert_eq!(urls[1].file_path, "main/1.0/100/assets/a");
        assert!(urls[0]
            .request_upload_url
            .starts_with("http://ota.test/uploads/main/1.0/100?fileName=metadata.json"));

        let bad = bucket
            .request_upload_urls_for_files(&location, &["../x".to_string()])
            .await;
        assert!(bad.is_err());
    }

    #[test]
    fn test_public_key_includes_namespace() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);
        let location = UpdateLocation::new("main", "1.0", "100").unwrap();

        assert_eq!(
            bucket.public_key(&location, "assets/a").unwrap(),
            "updates/main/1.0/100/assets/a"
        );
        assert!(bucket.public_key(&location, "../a").is_err());
    }

    #[tokio::test]
    async fn test_delete_update_folder_twice() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);
        let location = UpdateLocation::new("main", "1.0", "100").unwrap();
        bucket
            .upload_file_into_update(&location, "metadata.json", Bytes::from("{}"))
            .await
            .unwrap();

        bucket.delete_update_folder(&location).await.unwrap();
        bucket.delete_update_folder(&location).await.unwrap();
        assert!(bucket.list_update_ids("main", "1.0").await.unwrap().is_empty());
    }
}
