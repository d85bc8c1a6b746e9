//! Upload pipeline: validate, store, publish.
//!
//! A run moves `Received → Validating → Storing → Publishing → Done` and stops
//! at the first failing stage. Nothing is bound unless the artifact was stored,
//! and nothing is stored unless validation passed.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::artifact::{Artifact, ArtifactStore};
use crate::config::UploadPolicy;
use crate::error::{FirmwareError, UploadError};
use crate::targeting::{DeviceId, Scope, TargetBinding, TargetingResolver};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStage {
    Received,
    Validating,
    Storing,
    Publishing,
    Done,
    Failed,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStage::Received => "received",
            UploadStage::Validating => "validating",
            UploadStage::Storing => "storing",
            UploadStage::Publishing => "publishing",
            UploadStage::Done => "done",
            UploadStage::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully received upload
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub filename: String,
    /// Raw device id as submitted; absent or blank means the global scope
    pub device_id: Option<String>,
    pub data: Bytes,
    pub uploaded_by: Option<String>,
}

/// What a completed upload stored and the binding it published
#[derive(Clone, Debug)]
pub struct UploadReceipt {
    pub artifact: Artifact,
    pub scope: Scope,
    pub binding: TargetBinding,
}

pub struct UploadPipeline {
    store: Arc<ArtifactStore>,
    resolver: Arc<TargetingResolver>,
    policy: UploadPolicy,
}

impl UploadPipeline {
    pub fn new(
        store: Arc<ArtifactStore>,
        resolver: Arc<TargetingResolver>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            store,
            resolver,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub async fn run(&self, request: UploadRequest) -> Result<UploadReceipt, UploadError> {
        tracing::debug!(
            "Upload {}: {} ({} bytes, device={:?})",
            UploadStage::Received,
            request.filename,
            request.data.len(),
            request.device_id
        );

        let scope = self
            .stage(UploadStage::Validating, &request.filename, async {
                self.validate(&request)
            })
            .await?;

        let artifact = self
            .stage(UploadStage::Storing, &request.filename, async {
                self.store
                    .put(
                        request.data.clone(),
                        request.filename.trim(),
                        request.uploaded_by.as_deref(),
                    )
                    .await
            })
            .await?;

        let binding = self
            .stage(UploadStage::Publishing, &request.filename, async {
                self.resolver
                    .bind(scope.clone(), artifact.id, request.uploaded_by.as_deref())
                    .await
            })
            .await?;

        tracing::info!(
            "Upload {}: {} published to {} as {}",
            UploadStage::Done,
            request.filename,
            scope,
            artifact.id
        );

        Ok(UploadReceipt {
            artifact,
            scope,
            binding,
        })
    }

    async fn stage<T, F>(&self, stage: UploadStage, filename: &str, work: F) -> Result<T, UploadError>
    where
        F: std::future::Future<Output = crate::error::Result<T>>,
    {
        tracing::debug!("Upload {}: {}", stage, filename);
        work.await.map_err(|source| {
            tracing::warn!(
                "Upload {} at {}: {}: {}",
                UploadStage::Failed,
                stage,
                filename,
                source
            );
            UploadError { stage, source }
        })
    }

    /// Check the request against the policy and work out its target scope
    fn validate(&self, request: &UploadRequest) -> crate::error::Result<Scope> {
        let filename = request.filename.trim();
        if filename.is_empty() {
            return Err(FirmwareError::Validation("filename must not be empty".into()));
        }
        if filename.contains(['/', '\\']) || filename == "." || filename == ".." {
            return Err(FirmwareError::Validation(format!(
                "filename {:?} must not contain path separators",
                filename
            )));
        }

        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.policy.allowed_extensions.iter().any(|e| *e == extension) {
            return Err(FirmwareError::Validation(format!(
                "unsupported file type {:?}; accepted: {}",
                filename,
                self.policy
                    .allowed_extensions
                    .iter()
                    .map(|e| format!(".{}", e))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        if request.data.is_empty() {
            return Err(FirmwareError::Validation("firmware file is empty".into()));
        }
        let size = request.data.len() as u64;
        if size > self.policy.max_size_bytes {
            return Err(FirmwareError::Validation(format!(
                "firmware is {} bytes, limit is {} bytes",
                size, self.policy.max_size_bytes
            )));
        }

        if !self.policy.magic_prefixes.is_empty()
            && !self
                .policy
                .magic_prefixes
                .iter()
                .any(|magic| request.data.starts_with(magic))
        {
            return Err(FirmwareError::Validation(
                "content does not look like a firmware image".into(),
            ));
        }

        let device = match request.device_id.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(DeviceId::parse(raw)?),
            _ => None,
        };

        Ok(Scope::for_device(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, fixture_with_policy};
    use tempfile::TempDir;

    fn request(filename: &str, device: Option<&str>, data: &'static [u8]) -> UploadRequest {
        UploadRequest {
            filename: filename.to_string(),
            device_id: device.map(str::to_string),
            data: Bytes::from_static(data),
            uploaded_by: Some("ops".to_string()),
        }
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_global_then_device_upload() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir).await;

        let v1 = fx
            .pipeline
            .run(request("v1.bin", None, b"firmware v1"))
            .await
            .unwrap();
        assert_eq!(v1.scope, Scope::Global);
        assert_eq!(v1.artifact.uploaded_by.as_deref(), Some("ops"));

        let v2 = fx
            .pipeline
            .run(request("v2.bin", Some("device-42"), b"firmware v2"))
            .await
            .unwrap();
        assert_eq!(v2.scope, Scope::Device(device("device-42")));

        let for_42 = fx.resolver.resolve(Some(&device("device-42"))).unwrap();
        assert_eq!(for_42.artifact.filename, "v2.bin");
        let for_other = fx.resolver.resolve(Some(&device("device-7"))).unwrap();
        assert_eq!(for_other.artifact.filename, "v1.bin");
    }

    #[tokio::test]
    async fn test_fleet_rollout_scenario() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir).await;

        let v1 = UploadRequest {
            filename: "v1.bin".to_string(),
            device_id: None,
            data: Bytes::from(vec![0xa5u8; 1024]),
            uploaded_by: None,
        };
        fx.pipeline.run(v1).await.unwrap();

        let status = fx.retrieval.current_firmware_info(None).unwrap();
        assert_eq!(status.artifact.filename, "v1.bin");
        assert_eq!(status.artifact.size_bytes, 1024);

        let v2 = UploadRequest {
            filename: "v2.bin".to_string(),
            device_id: Some("sensor-7".to_string()),
            data: Bytes::from(vec![0x5au8; 2048]),
            uploaded_by: None,
        };
        fx.pipeline.run(v2).await.unwrap();

        let sensor_7 = fx.resolver.resolve(Some(&device("sensor-7"))).unwrap();
        assert_eq!(sensor_7.artifact.filename, "v2.bin");
        let sensor_9 = fx.resolver.resolve(Some(&device("sensor-9"))).unwrap();
        assert_eq!(sensor_9.artifact.filename, "v1.bin");
    }

    #[tokio::test]
    async fn test_validation_failures_touch_nothing() {
        let dir = TempDir::new().unwrap();
        let policy = UploadPolicy {
            max_size_bytes: 8,
            magic_prefixes: vec![vec![0xe9]],
            ..UploadPolicy::default()
        };
        let fx = fixture_with_policy(&dir, policy).await;

        let cases: Vec<UploadRequest> = vec![
            request("fw.bin", None, b""),
            request("fw.bin", None, b"\xe9 too large image"),
            request("fw.hex", None, b"\xe9abc"),
            request("noext", None, b"\xe9abc"),
            request("../fw.bin", None, b"\xe9abc"),
            request("  ", None, b"\xe9abc"),
            request("fw.bin", None, b"MZabc"),
            request("fw.bin", Some("global"), b"\xe9abc"),
            request("fw.bin", Some("bad id!"), b"\xe9abc"),
        ];

        for req in cases {
            let name = req.filename.clone();
            let err = fx.pipeline.run(req).await.unwrap_err();
            assert_eq!(err.stage, UploadStage::Validating, "{}", name);
            assert!(matches!(err.source, FirmwareError::Validation(_)), "{}", name);
        }

        assert!(fx.store.list().is_empty());
        assert_eq!(fx.store.stored_bytes(), 0);
        assert!(fx.resolver.bindings().is_empty());

        // Extension match is case-insensitive
        fx.pipeline
            .run(request("FW.BIN", None, b"\xe9abc"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blank_device_id_means_global() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir).await;

        let receipt = fx
            .pipeline
            .run(request("fw.bin", Some("   "), b"image"))
            .await
            .unwrap();
        assert_eq!(receipt.scope, Scope::Global);
    }

    #[tokio::test]
    async fn test_storing_failure_keeps_previous_binding() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn crate::storage::StorageBackend> =
            Arc::new(crate::storage::LocalStorage::new(dir.path().join("blobs")));
        let db = Arc::new(
            crate::db::init_database(&dir.path().join("catalog.db"))
                .await
                .unwrap(),
        );
        let store = Arc::new(ArtifactStore::open(backend, db.clone(), Some(16)).await.unwrap());
        let resolver = Arc::new(TargetingResolver::open(store.clone(), db).await.unwrap());
        let pipeline = UploadPipeline::new(store.clone(), resolver.clone(), UploadPolicy::default());

        let v1 = pipeline
            .run(request("v1.bin", None, b"small"))
            .await
            .unwrap();

        let err = pipeline
            .run(request("v2.bin", None, b"this image does not fit"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, UploadStage::Storing);
        assert!(matches!(err.source, FirmwareError::Storage(_)));

        assert_eq!(resolver.resolve(None).unwrap().artifact.id, v1.artifact.id);
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn test_publishing_failure_keeps_previous_binding() {
        use sea_orm::{ConnectionTrait, Statement};

        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir).await;

        let v1 = fx
            .pipeline
            .run(request("v1.bin", Some("sensor-7"), b"first image"))
            .await
            .unwrap();

        fx.db
            .execute(Statement::from_string(
                fx.db.get_database_backend(),
                "DROP TABLE target_bindings".to_string(),
            ))
            .await
            .unwrap();

        let err = fx
            .pipeline
            .run(request("v2.bin", Some("sensor-7"), b"second image"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, UploadStage::Publishing);
        assert!(matches!(err.source, FirmwareError::Storage(_)));

        // v2 was stored but never published
        assert_eq!(fx.store.list().len(), 2);
        let resolved = fx.resolver.resolve(Some(&device("sensor-7"))).unwrap();
        assert_eq!(resolved.artifact.id, v1.artifact.id);
        assert_eq!(resolved.binding, v1.binding);
    }

    #[tokio::test]
    async fn test_reupload_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir).await;

        let first = fx
            .pipeline
            .run(request("fw.bin", Some("sensor-1"), b"same bytes"))
            .await
            .unwrap();
        let second = fx
            .pipeline
            .run(request("renamed.bin", Some("sensor-1"), b"same bytes"))
            .await
            .unwrap();

        assert_eq!(first.artifact, second.artifact);
        assert!(second.binding.updated_at > first.binding.updated_at);
        assert_eq!(fx.store.list().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_to_one_device() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir).await;
        let pipeline = Arc::new(fx.pipeline);

        let images: [&'static [u8]; 5] = [b"img-0", b"img-1", b"img-2", b"img-3", b"img-4"];
        let mut handles = Vec::new();
        for (i, data) in images.into_iter().enumerate() {
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                pipeline
                    .run(request(&format!("fw-{}.bin", i), Some("device-1"), data))
                    .await
                    .unwrap()
            }));
        }
        let mut receipts = Vec::new();
        for handle in handles {
            receipts.push(handle.await.unwrap());
        }

        // Exactly one binding, and it is the latest publish
        let latest = receipts.iter().max_by_key(|r| r.binding.updated_at).unwrap();
        let resolved = fx.resolver.resolve(Some(&device("device-1"))).unwrap();
        assert_eq!(resolved.artifact.id, latest.artifact.id);
        assert_eq!(fx.resolver.bindings().len(), 1);
        assert_eq!(fx.store.list().len(), 5);
    }
}
