//! Request and response bodies for the firmware API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactId};
use crate::pipeline::UploadReceipt;
use crate::targeting::{Resolution, Scope, TargetBinding};

// ============================================================================
// Request Types
// ============================================================================

/// `?device_id=` on status and download endpoints
#[derive(Debug, Deserialize, Default)]
pub struct DeviceQuery {
    pub device_id: Option<String>,
}

/// PUT /api/bindings/:scope request body
#[derive(Debug, Deserialize)]
pub struct BindRequest {
    pub artifact_id: ArtifactId,
}

// ============================================================================
// Response Types
// ============================================================================

/// POST /api/firmware response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub artifact: Artifact,
    pub scope: Scope,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_by: Option<String>,
}

impl From<UploadReceipt> for UploadResponse {
    fn from(receipt: UploadReceipt) -> Self {
        Self {
            artifact: receipt.artifact,
            scope: receipt.scope,
            updated_at: receipt.binding.updated_at,
            bound_by: receipt.binding.bound_by,
        }
    }
}

/// GET /api/firmware/status response
#[derive(Debug, Serialize)]
pub struct FirmwareStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FirmwareStatus {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            firmware: None,
            scope: None,
            updated_at: None,
        }
    }
}

impl From<Resolution> for FirmwareStatus {
    fn from(resolution: Resolution) -> Self {
        Self {
            available: true,
            firmware: Some(resolution.artifact),
            scope: Some(resolution.binding.scope),
            updated_at: Some(resolution.binding.updated_at),
        }
    }
}

/// Artifact metadata plus the scopes currently bound to it
#[derive(Debug, Serialize)]
pub struct ArtifactInfo {
    #[serde(flatten)]
    pub artifact: Artifact,
    pub bound_to: Vec<Scope>,
}

impl ArtifactInfo {
    pub fn new(artifact: Artifact, bindings: &[TargetBinding]) -> Self {
        let bound_to = bindings
            .iter()
            .filter(|b| b.artifact_id == artifact.id)
            .map(|b| b.scope.clone())
            .collect();
        Self { artifact, bound_to }
    }
}

/// GET /health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub artifacts: usize,
    pub bindings: usize,
    pub stored_bytes: u64,
}
