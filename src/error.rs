use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::pipeline::UploadStage;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum FirmwareError {
    /// Bad operator input. The message is safe to show verbatim.
    #[error("{0}")]
    Validation(String),

    /// I/O or capacity failure. Retryable by the caller.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Stored bytes no longer match the checksum recorded at ingest
    #[error("integrity check failed for artifact {id}: expected {expected}, found {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no firmware available for {0}")]
    NoFirmwareAvailable(String),

    #[error("range not satisfiable for firmware of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl FirmwareError {
    /// Stable machine-readable kind, used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            FirmwareError::Validation(_) => "validation",
            FirmwareError::Storage(_) => "storage",
            FirmwareError::Integrity { .. } => "integrity",
            FirmwareError::NotFound(_) => "not_found",
            FirmwareError::NoFirmwareAvailable(_) => "no_firmware_available",
            FirmwareError::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            FirmwareError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FirmwareError::Validation(_) => StatusCode::BAD_REQUEST,
            FirmwareError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            FirmwareError::Integrity { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            FirmwareError::NotFound(_) => StatusCode::NOT_FOUND,
            FirmwareError::NoFirmwareAvailable(_) => StatusCode::NOT_FOUND,
            FirmwareError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            FirmwareError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Server-side faults get a generic text;
    /// the detail only goes to the log.
    pub fn public_message(&self) -> String {
        match self {
            FirmwareError::Storage(_) => {
                "Firmware storage is temporarily unavailable. Please try again.".to_string()
            }
            FirmwareError::Integrity { id, .. } => {
                format!("Firmware {} failed integrity verification", id)
            }
            FirmwareError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    fn log(&self) {
        match self {
            FirmwareError::Storage(_) | FirmwareError::Internal(_) => {
                tracing::error!("{}", self)
            }
            FirmwareError::Integrity { .. } => tracing::error!("CORRUPTED FIRMWARE: {}", self),
            _ => tracing::debug!("{}", self),
        }
    }
}

impl From<StorageError> for FirmwareError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => FirmwareError::NotFound(key),
            other => FirmwareError::Storage(other.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for FirmwareError {
    fn from(e: sea_orm::DbErr) -> Self {
        FirmwareError::Storage(format!("catalog: {}", e))
    }
}

impl IntoResponse for FirmwareError {
    fn into_response(self) -> Response {
        self.log();
        let body = json!({
            "error": self.kind(),
            "message": self.public_message(),
        });
        let mut response = (self.status_code(), Json(body)).into_response();
        if let FirmwareError::RangeNotSatisfiable { size } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

/// An upload that stopped at `stage`. Nothing was published.
#[derive(Error, Debug)]
#[error("upload failed during {stage}: {source}")]
pub struct UploadError {
    pub stage: UploadStage,
    #[source]
    pub source: FirmwareError,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        tracing::warn!("{}", self);
        self.source.log();
        let body = json!({
            "error": self.source.kind(),
            "stage": self.stage.as_str(),
            "message": self.source.public_message(),
        });
        (self.source.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, FirmwareError>;
