//! Local filesystem storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use super::backend::{StorageBackend, StorageError, StorageResult};

/// Prefix of in-flight upload files; hidden from listings
const TEMP_PREFIX: &str = ".tmp-";

/// Local filesystem storage backend.
///
/// Stores objects in a directory structure mirroring the key:
/// ```text
/// {base_path}/
///   {namespace}/
///     {branch}/{runtimeVersion}/{updateId}/{file}
/// ```
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Get the full path for a key
    fn key_path(&self, namespace: &str, key: &str) -> StorageResult<PathBuf> {
        let mut path = self.base_path.join(namespace);
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Ensure parent directory exists
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn not_found(namespace: &str, key: &str) -> impl FnOnce(std::io::Error) -> StorageError {
        let name = format!("{}/{}", namespace, key);
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(name)
            } else {
                StorageError::Io(e)
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(namespace, key)?;
        let data = fs::read(&path)
            .await
            .map_err(Self::not_found(namespace, key))?;
        Ok(Bytes::from(data))
    }

    async fn get_stream(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Box<dyn tokio::io::AsyncRead + Unpin + Send>> {
        let path = self.key_path(namespace, key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(Self::not_found(namespace, key))?;
        Ok(Box::new(file))
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(namespace, key)?;
        self.ensure_parent(&path).await?;

        // Write next to the target, then rename into place
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let temp_path = path.with_file_name(format!(
            "{}{}-{}",
            TEMP_PREFIX,
            uuid::Uuid::new_v4(),
            file_name
        ));

        if let Err(e) = fs::write(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }

    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let path = self.key_path(namespace, key)?;
        Ok(fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false))
    }

    async fn list_children(&self, namespace: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = self.key_path(namespace, prefix)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    async fn delete_prefix(&self, namespace: &str, prefix: &str) -> StorageResult<()> {
        let path = self.key_path(namespace, prefix)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // Already deleted
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn presign_put(
        &self,
        _namespace: &str,
        _key: &str,
        _expires_in: Duration,
    ) -> StorageResult<Option<String>> {
        // Uploads go through the server's own endpoint
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_local_storage_basic() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        // Put and get
        let data = Bytes::from("hello world");
        storage.put("test", "main/1.0/100/bundle.js", data.clone()).await.unwrap();

        let retrieved = storage.get("test", "main/1.0/100/bundle.js").await.unwrap();
        assert_eq!(retrieved, data);

        // Exists
        assert!(storage.exists("test", "main/1.0/100/bundle.js").await.unwrap());
        assert!(!storage.exists("test", "main/1.0/100/missing.js").await.unwrap());
        // Directories are not objects
        assert!(!storage.exists("test", "main/1.0/100").await.unwrap());

        // Stream
        let mut stream = storage.get_stream("test", "main/1.0/100/bundle.js").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");

        // Missing objects map to NotFound
        let missing = storage.get("test", "main/1.0/100/missing.js").await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_storage_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        let result = storage.put("test", "main/../../escape", Bytes::from("x")).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_local_storage_listing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        storage.put("ns", "main/1.0/100/a.js", Bytes::from("1")).await.unwrap();
        storage.put("ns", "main/1.0/100/assets/b.png", Bytes::from("2")).await.unwrap();
        storage.put("ns", "main/1.0/200/a.js", Bytes::from("3")).await.unwrap();
        storage.put("ns", "main/1.0/.hidden", Bytes::from("4")).await.unwrap();

        let mut children = storage.list_children("ns", "main/1.0").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["100", "200"]);

        let mut files = storage.list_children("ns", "main/1.0/100").await.unwrap();
        files.sort();
        assert_eq!(files, vec!["a.js", "assets"]);

        // Absent prefixes list as empty
        assert!(storage.list_children("ns", "nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_storage_delete_prefix_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        storage.put("ns", "main/1.0/100/a.js", Bytes::from("1")).await.unwrap();
        storage.delete_prefix("ns", "main/1.0/100").await.unwrap();
        assert!(!storage.exists("ns", "main/1.0/100/a.js").await.unwrap());

        // Second delete of the same folder is not an error
        storage.delete_prefix("ns", "main/1.0/100").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_storage_concurrent_puts() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path().to_path_buf()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("main/1.0/100/assets/file-{}", i);
                storage.put("ns", &key, Bytes::from(vec![i as u8; 4096])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // No temp files are left behind next to the objects
        let dir = temp_dir.path().join("ns/main/1.0/100/assets");
        let names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 16);
        assert!(names.iter().all(|n| !n.starts_with(TEMP_PREFIX)));
    }

    #[tokio::test]
    async fn test_local_storage_has_no_presigned_urls() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());
        let url = storage
            .presign_put("ns", "main/1.0/100/a.js", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.is_none());
    }
}
