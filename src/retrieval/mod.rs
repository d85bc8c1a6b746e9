//! Read side: what a device should run, and the verified bytes to send it.

mod range;

pub use range::{content_range, ByteRange, RangeRequest};

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;

use crate::artifact::{Artifact, ArtifactId, ArtifactStore};
use crate::error::Result;
use crate::targeting::{DeviceId, Resolution, Scope, TargetingResolver};

/// Verified firmware bytes ready to send
#[derive(Clone, Debug)]
pub struct FirmwareDownload {
    pub artifact: Artifact,
    /// Scope that selected the artifact; `None` for downloads by id
    pub scope: Option<Scope>,
    pub body: Bytes,
    /// Set when `body` is a partial range of the artifact
    pub range: Option<Range<u64>>,
}

impl FirmwareDownload {
    pub fn total_size(&self) -> u64 {
        self.artifact.size_bytes
    }
}

pub struct RetrievalService {
    store: Arc<ArtifactStore>,
    resolver: Arc<TargetingResolver>,
}

impl RetrievalService {
    pub fn new(store: Arc<ArtifactStore>, resolver: Arc<TargetingResolver>) -> Self {
        Self { store, resolver }
    }

    /// Metadata for the firmware a device should run. No bytes are read.
    pub fn current_firmware_info(&self, device: Option<&DeviceId>) -> Result<Resolution> {
        self.resolver.resolve(device)
    }

    /// Resolve the device's firmware and return its verified bytes
    pub async fn download_firmware(
        &self,
        device: Option<&DeviceId>,
        range: Option<&RangeRequest>,
    ) -> Result<FirmwareDownload> {
        let resolution = self.resolver.resolve(device)?;
        tracing::debug!(
            "Serving {} to {} via {} binding",
            resolution.artifact.id,
            device.map(|d| d.as_str()).unwrap_or("anonymous device"),
            resolution.scope()
        );

        let mut download = self.read(&resolution.artifact, range).await?;
        download.scope = Some(resolution.binding.scope);
        Ok(download)
    }

    /// Download a specific artifact, bound or not
    pub async fn download_artifact(
        &self,
        id: &ArtifactId,
        range: Option<&RangeRequest>,
    ) -> Result<FirmwareDownload> {
        let artifact = self.store.metadata(id)?;
        self.read(&artifact, range).await
    }

    async fn read(
        &self,
        artifact: &Artifact,
        range: Option<&RangeRequest>,
    ) -> Result<FirmwareDownload> {
        let etag = artifact.id.to_hex();
        let range = match range {
            Some(req) if req.applies_to(&etag) => Some(req.range.to_range(artifact.size_bytes)?),
            _ => None,
        };

        let (body, artifact) = match &range {
            Some(r) => self.store.read_range(&artifact.id, r.clone()).await?,
            None => self.store.get(&artifact.id).await?,
        };

        Ok(FirmwareDownload {
            artifact,
            scope: None,
            body,
            range,
        })
    }
}
