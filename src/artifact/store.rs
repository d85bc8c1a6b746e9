//! Content-addressed artifact store.
//!
//! Bytes go to the storage backend under their SHA-256; metadata goes to the
//! catalog and is cached in memory. A blob without a catalog row is not an
//! artifact: `exists` says no and the next upload of the same bytes rewrites it.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use dashmap::DashMap;
use sea_orm::{sea_query::OnConflict, DatabaseConnection, EntityTrait, Set};
use tokio::sync::Mutex;

use super::{Artifact, ArtifactId, ContentHash};
use crate::db::entities::{self, artifact};
use crate::error::{FirmwareError, Result};
use crate::storage::{namespaces, StorageBackend, StorageError};

pub struct ArtifactStore {
    backend: Arc<dyn StorageBackend>,
    db: Arc<DatabaseConnection>,
    /// Catalog cache, authoritative for `exists`
    artifacts: DashMap<ArtifactId, Artifact>,
    /// Serializes the write path per id; entries are dropped once idle
    put_locks: DashMap<ArtifactId, Arc<Mutex<()>>>,
    quota_bytes: Option<u64>,
    stored_bytes: AtomicU64,
}

impl ArtifactStore {
    /// Open the store and load every known artifact from the catalog
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        db: Arc<DatabaseConnection>,
        quota_bytes: Option<u64>,
    ) -> Result<Self> {
        let rows = entities::Artifact::find().all(db.as_ref()).await?;

        let artifacts = DashMap::with_capacity(rows.len());
        let mut stored = 0u64;
        for row in rows {
            let artifact = Artifact::try_from(row)?;
            stored += artifact.size_bytes;
            artifacts.insert(artifact.id, artifact);
        }

        tracing::info!(
            "Loaded {} artifacts ({} bytes) from catalog",
            artifacts.len(),
            stored
        );

        Ok(Self {
            backend,
            db,
            artifacts,
            put_locks: DashMap::new(),
            quota_bytes,
            stored_bytes: AtomicU64::new(stored),
        })
    }

    /// Store a firmware image. Storing bytes that are already present returns
    /// the existing artifact unchanged, including its original filename, and
    /// rewrites its blob if the stored copy is missing or damaged.
    pub async fn put(
        &self,
        data: Bytes,
        filename: &str,
        uploaded_by: Option<&str>,
    ) -> Result<Artifact> {
        let id = ContentHash::from_data_blocking(data.clone()).await;

        let lock = self
            .put_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.put_locked(id, data, filename, uploaded_by).await
        };

        drop(lock);
        self.put_locks.remove_if(&id, |_, l| Arc::strong_count(l) == 1);

        result
    }

    async fn put_locked(
        &self,
        id: ArtifactId,
        data: Bytes,
        filename: &str,
        uploaded_by: Option<&str>,
    ) -> Result<Artifact> {
        if let Some(existing) = self.lookup(&id) {
            tracing::debug!("Artifact {} already stored, reusing", id);
            self.repair_blob(&existing, data).await?;
            return Ok(existing);
        }

        let size = data.len() as u64;
        self.reserve(size)?;

        let key = id.to_hex();
        if let Err(e) = self.backend.put(namespaces::FIRMWARE, &key, data).await {
            self.release(size);
            return Err(FirmwareError::Storage(format!("writing artifact {}: {}", id, e)));
        }

        let artifact = Artifact {
            id,
            filename: filename.to_string(),
            size_bytes: size,
            checksum: id.to_checksum(),
            uploaded_at: Utc::now().trunc_subsecs(6),
            uploaded_by: uploaded_by.map(str::to_string),
        };

        if let Err(e) = self.insert_row(&artifact).await {
            // Unreachable without a catalog row
            if let Err(cleanup) = self.backend.delete(namespaces::FIRMWARE, &key).await {
                tracing::warn!("Failed to remove orphaned blob {}: {}", key, cleanup);
            }
            self.release(size);
            return Err(e);
        }

        self.artifacts.insert(id, artifact.clone());
        tracing::info!(
            "Stored artifact {} ({}, {} bytes)",
            id,
            artifact.filename,
            size
        );

        Ok(artifact)
    }

    /// Rewrite a catalogued artifact's blob from `data` unless the stored
    /// copy already matches it byte for byte
    async fn repair_blob(&self, artifact: &Artifact, data: Bytes) -> Result<()> {
        let key = artifact.id.to_hex();
        match self.backend.get(namespaces::FIRMWARE, &key).await {
            Ok(stored) if stored == data => return Ok(()),
            Ok(_) => tracing::warn!("Blob for artifact {} is damaged, rewriting", artifact.id),
            Err(StorageError::NotFound(_)) => {
                tracing::warn!("Blob for artifact {} is missing, rewriting", artifact.id)
            }
            Err(e) => {
                return Err(FirmwareError::Storage(format!(
                    "reading artifact {}: {}",
                    artifact.id, e
                )))
            }
        }

        self.backend
            .put(namespaces::FIRMWARE, &key, data)
            .await
            .map_err(|e| FirmwareError::Storage(format!("rewriting artifact {}: {}", artifact.id, e)))
    }

    async fn insert_row(&self, artifact: &Artifact) -> Result<()> {
        let model = artifact::ActiveModel {
            id: Set(artifact.id.to_hex()),
            filename: Set(artifact.filename.clone()),
            size: Set(artifact.size_bytes as i64),
            checksum: Set(artifact.checksum.clone()),
            uploaded_at: Set(artifact.uploaded_at.timestamp_micros()),
            uploaded_by: Set(artifact.uploaded_by.clone()),
        };

        entities::Artifact::insert(model)
            .on_conflict(
                OnConflict::column(artifact::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;

        Ok(())
    }

    fn reserve(&self, size: u64) -> Result<()> {
        let Some(quota) = self.quota_bytes else {
            self.stored_bytes.fetch_add(size, Ordering::SeqCst);
            return Ok(());
        };

        let before = self.stored_bytes.fetch_add(size, Ordering::SeqCst);
        if before + size > quota {
            self.stored_bytes.fetch_sub(size, Ordering::SeqCst);
            return Err(FirmwareError::Storage(format!(
                "storage quota exhausted: {} of {} bytes used, {} requested",
                before, quota, size
            )));
        }
        Ok(())
    }

    fn release(&self, size: u64) {
        self.stored_bytes.fetch_sub(size, Ordering::SeqCst);
    }

    /// Read and verify a whole artifact
    pub async fn get(&self, id: &ArtifactId) -> Result<(Bytes, Artifact)> {
        let artifact = self.metadata(id)?;

        let data = self
            .backend
            .get(namespaces::FIRMWARE, &id.to_hex())
            .await
            .map_err(|e| blob_error(&artifact, e))?;

        let actual = ContentHash::from_data_blocking(data.clone()).await;
        verify(&artifact, actual, data.len() as u64)?;

        Ok((data, artifact))
    }

    /// Read `range` of an artifact. The whole object is verified first (by
    /// streaming, without buffering it) so a corrupted image is never served
    /// even in part.
    pub async fn read_range(&self, id: &ArtifactId, range: Range<u64>) -> Result<(Bytes, Artifact)> {
        let artifact = self.metadata(id)?;
        if range.start >= range.end || range.end > artifact.size_bytes {
            return Err(FirmwareError::RangeNotSatisfiable {
                size: artifact.size_bytes,
            });
        }

        let key = id.to_hex();

        // Cheap check first: a truncated or swapped blob fails without hashing
        let stored_size = self
            .backend
            .size(namespaces::FIRMWARE, &key)
            .await
            .map_err(|e| blob_error(&artifact, e))?;
        if stored_size != artifact.size_bytes {
            return Err(FirmwareError::Integrity {
                id: key,
                expected: format!("{} bytes", artifact.size_bytes),
                actual: format!("{} bytes", stored_size),
            });
        }

        let reader = self
            .backend
            .get_stream(namespaces::FIRMWARE, &key)
            .await
            .map_err(|e| blob_error(&artifact, e))?;
        let (actual, len) = ContentHash::from_reader(reader)
            .await
            .map_err(|e| FirmwareError::Storage(format!("reading artifact {}: {}", id, e)))?;
        verify(&artifact, actual, len)?;

        let data = self
            .backend
            .get_range(namespaces::FIRMWARE, &key, range)
            .await
            .map_err(|e| blob_error(&artifact, e))?;

        Ok((data, artifact))
    }

    /// Whether an artifact with this id has been stored. Never fails.
    pub fn exists(&self, id: &ArtifactId) -> bool {
        self.artifacts.contains_key(id)
    }

    pub fn metadata(&self, id: &ArtifactId) -> Result<Artifact> {
        self.lookup(id)
            .ok_or_else(|| FirmwareError::NotFound(format!("artifact {}", id)))
    }

    /// All artifacts, newest first
    pub fn list(&self) -> Vec<Artifact> {
        let mut all: Vec<Artifact> = self.artifacts.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: &ArtifactId) -> Option<Artifact> {
        self.artifacts.get(id).map(|r| r.clone())
    }
}

fn verify(artifact: &Artifact, actual: ContentHash, len: u64) -> Result<()> {
    let expected = artifact.expected_hash()?;
    if actual != expected || len != artifact.size_bytes {
        return Err(FirmwareError::Integrity {
            id: artifact.id.to_hex(),
            expected: format!("{} ({} bytes)", artifact.checksum, artifact.size_bytes),
            actual: format!("{} ({} bytes)", actual.to_checksum(), len),
        });
    }
    Ok(())
}

/// A catalogued artifact whose blob is gone is corruption, not absence
fn blob_error(artifact: &Artifact, e: StorageError) -> FirmwareError {
    match e {
        StorageError::NotFound(_) => FirmwareError::Integrity {
            id: artifact.id.to_hex(),
            expected: artifact.checksum.clone(),
            actual: "blob missing from storage".to_string(),
        },
        other => FirmwareError::Storage(format!("reading artifact {}: {}", artifact.id, other)),
    }
}
