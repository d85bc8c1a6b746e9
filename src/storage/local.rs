//! Local filesystem storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::backend::{StorageBackend, StorageError, StorageResult};

/// Directory (under the base path) holding in-flight writes
const TMP_DIR: &str = ".tmp";

/// Local filesystem storage backend.
///
/// Stores objects in a directory structure:
/// ```text
/// {base_path}/
///   .tmp/              # in-flight writes, renamed into place when complete
///   {namespace}/
///     {key[0..2]}/     # First 2 chars of key for sharding
///       {key[2..]}     # Rest of key as filename
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
    fn key_path(&self, namespace: &str, key: &str) -> PathBuf {
        if key.len() >= 2 {
            self.base_path
                .join(namespace)
                .join(&key[..2])
                .join(&key[2..])
        } else {
            self.base_path.join(namespace).join(key)
        }
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(TMP_DIR)
            .join(format!("{}.{}", key, uuid::Uuid::new_v4().simple()))
    }

    /// Remove temp files left behind by writes that never completed
    /// (process crash, cancelled request). Returns how many were removed.
    pub async fn sweep_temp_files(&self) -> StorageResult<usize> {
        let tmp_dir = self.base_path.join(TMP_DIR);
        if !fs::try_exists(&tmp_dir).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(&tmp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove stale temp file {:?}: {}", entry.path(), e),
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} abandoned temp files from {:?}", removed, tmp_dir);
        }
        Ok(removed)
    }

    async fn open_existing(&self, namespace: &str, key: &str) -> StorageResult<fs::File> {
        let path = self.key_path(namespace, key);
        fs::File::open(&path).await.map_err(|e| not_found_or(e, namespace, key))
    }
}

fn not_found_or(e: std::io::Error, namespace: &str, key: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(format!("{}/{}", namespace, key))
    } else {
        StorageError::from(e)
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(namespace, key);
        let data = fs::read(&path).await.map_err(|e| not_found_or(e, namespace, key))?;
        Ok(Bytes::from(data))
    }

    async fn get_range(&self, namespace: &str, key: &str, range: Range<u64>) -> StorageResult<Bytes> {
        let mut file = self.open_existing(namespace, key).await?;

        let file_size = file.metadata().await?.len();
        if range.start >= file_size || range.end > file_size || range.start >= range.end {
            return Err(StorageError::InvalidRange(format!(
                "{}..{} for object of size {}",
                range.start, range.end, file_size
            )));
        }

        file.seek(std::io::SeekFrom::Start(range.start)).await?;

        let len = (range.end - range.start) as usize;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await?;

        Ok(Bytes::from(buffer))
    }

    async fn get_stream(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Box<dyn tokio::io::AsyncRead + Unpin + Send>> {
        let file = self.open_existing(namespace, key).await?;
        Ok(Box::new(file))
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let dest = self.key_path(namespace, key);
        let tmp = self.tmp_path(key);

        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &dest).await?;
            if let Some(parent) = dest.parent() {
                sync_dir(parent).await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::from(e));
        }

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        let path = self.key_path(namespace, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let path = self.key_path(namespace, key);
        Ok(fs::try_exists(&path).await?)
    }

    async fn size(&self, namespace: &str, key: &str) -> StorageResult<u64> {
        let path = self.key_path(namespace, key);
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or(e, namespace, key))?;
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        let data = Bytes::from("hello firmware");
        storage.put("fw", "abc123def456", data.clone()).await.unwrap();

        assert_eq!(storage.get("fw", "abc123def456").await.unwrap(), data);
        assert!(storage.exists("fw", "abc123def456").await.unwrap());
        assert!(!storage.exists("fw", "nonexistent").await.unwrap());
        assert_eq!(storage.size("fw", "abc123def456").await.unwrap(), 14);

        // Sharded layout
        assert!(temp_dir.path().join("fw").join("ab").join("c123def456").exists());

        storage.delete("fw", "abc123def456").await.unwrap();
        assert!(!storage.exists("fw", "abc123def456").await.unwrap());
        // Deleting twice is fine
        storage.delete("fw", "abc123def456").await.unwrap();
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        storage.put("fw", "aabbcc", Bytes::from("one")).await.unwrap();
        storage.put("fw", "aabbcc", Bytes::from("two")).await.unwrap();

        let mut entries = std::fs::read_dir(temp_dir.path().join(TMP_DIR)).unwrap();
        assert!(entries.next().is_none());
        assert_eq!(storage.get("fw", "aabbcc").await.unwrap().as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        assert!(matches!(
            storage.get("fw", "deadbeef").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.get_range("fw", "deadbeef", 0..1).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.size("fw", "deadbeef").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_range_reads() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        storage.put("fw", "abcdef123456", Bytes::from("0123456789")).await.unwrap();

        let range_data = storage.get_range("fw", "abcdef123456", 2..5).await.unwrap();
        assert_eq!(range_data.as_ref(), b"234");

        let range_data = storage.get_range("fw", "abcdef123456", 7..10).await.unwrap();
        assert_eq!(range_data.as_ref(), b"789");

        let result = storage.get_range("fw", "abcdef123456", 5..20).await;
        assert!(matches!(result, Err(StorageError::InvalidRange(_))));
    }

    #[tokio::test]
    async fn test_stream() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        storage.put("fw", "streamkey", Bytes::from("streaming test data")).await.unwrap();

        let mut stream = storage.get_stream("fw", "streamkey").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"streaming test data");
    }

    #[tokio::test]
    async fn test_sweep_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf());

        assert_eq!(storage.sweep_temp_files().await.unwrap(), 0);

        let tmp_dir = temp_dir.path().join(TMP_DIR);
        std::fs::create_dir_all(&tmp_dir).unwrap();
        std::fs::write(tmp_dir.join("abandoned.1"), b"partial").unwrap();
        std::fs::write(tmp_dir.join("abandoned.2"), b"partial").unwrap();

        assert_eq!(storage.sweep_temp_files().await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(&tmp_dir).unwrap().count(), 0);
    }
}
