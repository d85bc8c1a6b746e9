//! Shared fixtures for unit tests.

use std::path::PathBuf;
use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tempfile::TempDir;

use crate::artifact::{ArtifactId, ArtifactStore};
use crate::config::UploadPolicy;
use crate::db::init_database;
use crate::pipeline::UploadPipeline;
use crate::retrieval::RetrievalService;
use crate::storage::{namespaces, LocalStorage, StorageBackend};
use crate::targeting::TargetingResolver;

pub async fn open_store(dir: &TempDir, quota_bytes: Option<u64>) -> ArtifactStore {
    let backend: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path().join("blobs")));
    let db = Arc::new(init_database(&dir.path().join("catalog.db")).await.unwrap());
    ArtifactStore::open(backend, db, quota_bytes).await.unwrap()
}

/// Where `LocalStorage` keeps an artifact's bytes under `dir`
pub fn blob_path(dir: &TempDir, id: &ArtifactId) -> PathBuf {
    let hex = id.to_hex();
    dir.path()
        .join("blobs")
        .join(namespaces::FIRMWARE)
        .join(&hex[..2])
        .join(&hex[2..])
}

/// A fully wired core over a temp directory
pub struct Fixture {
    pub store: Arc<ArtifactStore>,
    pub resolver: Arc<TargetingResolver>,
    pub pipeline: UploadPipeline,
    pub retrieval: RetrievalService,
    pub db: Arc<DatabaseConnection>,
}

pub async fn fixture(dir: &TempDir) -> Fixture {
    fixture_with_policy(dir, UploadPolicy::default()).await
}

pub async fn fixture_with_policy(dir: &TempDir, policy: UploadPolicy) -> Fixture {
    let backend: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path().join("blobs")));
    let db = Arc::new(init_database(&dir.path().join("catalog.db")).await.unwrap());
    let store = Arc::new(ArtifactStore::open(backend, db.clone(), None).await.unwrap());
    let resolver = Arc::new(TargetingResolver::open(store.clone(), db.clone()).await.unwrap());

    Fixture {
        pipeline: UploadPipeline::new(store.clone(), resolver.clone(), policy),
        retrieval: RetrievalService::new(store.clone(), resolver.clone()),
        store,
        resolver,
        db,
    }
}
