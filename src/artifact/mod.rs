//! Firmware artifacts: immutable, content-addressed binaries plus metadata.

mod hash;
mod store;

pub use hash::ContentHash;
pub use store::ArtifactStore;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::entities::artifact;
use crate::error::{FirmwareError, Result};

/// An artifact's identifier is the SHA-256 of its bytes
pub type ArtifactId = ContentHash;

/// A stored firmware binary's metadata. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub filename: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
}

impl Artifact {
    /// Digest the recorded checksum refers to
    pub fn expected_hash(&self) -> Result<ContentHash> {
        ContentHash::from_checksum(&self.checksum).ok_or_else(|| FirmwareError::Integrity {
            id: self.id.to_hex(),
            expected: self.checksum.clone(),
            actual: "unparseable checksum".to_string(),
        })
    }
}

impl TryFrom<artifact::Model> for Artifact {
    type Error = FirmwareError;

    fn try_from(model: artifact::Model) -> Result<Self> {
        let id = ContentHash::from_hex(&model.id).ok_or_else(|| {
            FirmwareError::Internal(format!("catalog holds malformed artifact id '{}'", model.id))
        })?;
        let uploaded_at = DateTime::from_timestamp_micros(model.uploaded_at).ok_or_else(|| {
            FirmwareError::Internal(format!("artifact {} has invalid upload time", model.id))
        })?;

        Ok(Self {
            id,
            filename: model.filename,
            size_bytes: model.size as u64,
            checksum: model.checksum,
            uploaded_at,
            uploaded_by: model.uploaded_by,
        })
    }
}
