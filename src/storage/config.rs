//! Storage configuration.

use std::path::PathBuf;
use std::sync::Arc;

use super::{LocalStorage, S3Config, S3Storage, StorageBackend, StorageResult};

/// Storage backend type
#[derive(Debug, Clone)]
pub enum StorageType {
    /// Local filesystem storage
    Local { path: PathBuf },
    /// S3-compatible storage (AWS S3, MinIO, R2, etc.)
    S3(S3Config),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub storage_type: StorageType,
}

impl StorageConfig {
    /// Create config for local storage at the given path
    pub fn local(path: PathBuf) -> Self {
        Self {
            storage_type: StorageType::Local { path },
        }
    }

    pub fn s3(config: S3Config) -> Self {
        Self {
            storage_type: StorageType::S3(config),
        }
    }

    /// Build the storage backend described by this config.
    ///
    /// For local storage this creates the base directory and clears out temp
    /// files from writes that never finished.
    pub async fn build(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        match &self.storage_type {
            StorageType::Local { path } => {
                tokio::fs::create_dir_all(path).await?;
                let storage = LocalStorage::new(path.clone());
                storage.sweep_temp_files().await?;
                tracing::info!("Using local firmware storage at {:?}", path);
                Ok(Arc::new(storage))
            }
            StorageType::S3(config) => {
                tracing::info!(
                    "Using S3 firmware storage: bucket={} endpoint={:?}",
                    config.bucket,
                    config.endpoint
                );
                let storage = match &config.credentials {
                    Some((access_key, secret_key)) => {
                        S3Storage::with_credentials(config.clone(), access_key, secret_key).await
                    }
                    None => S3Storage::new(config.clone()).await,
                };
                Ok(Arc::new(storage))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_local_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("blobs");
        let backend = StorageConfig::local(path.clone()).build().await.unwrap();

        assert!(path.is_dir());
        backend.put("firmware", "abcdef", Bytes::from("x")).await.unwrap();
        assert!(backend.exists("firmware", "abcdef").await.unwrap());
    }
}
