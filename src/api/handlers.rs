//! Firmware API request handlers.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;

use super::types::*;
use super::AppState;
use crate::artifact::ArtifactId;
use crate::error::{FirmwareError, Result, UploadError};
use crate::pipeline::{UploadRequest, UploadStage};
use crate::retrieval::{content_range, ByteRange, FirmwareDownload, RangeRequest};
use crate::targeting::{DeviceId, Scope, TargetBinding};

/// Header carrying the operator identity set by the fronting auth layer
const OPERATOR_HEADER: &str = "x-operator-id";
const MAX_OPERATOR_LEN: usize = 128;

// ============================================================================
// Helper Functions
// ============================================================================

/// Operator identity for audit fields, if the request carries one
fn operator_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(MAX_OPERATOR_LEN).collect())
}

/// Absent or blank means "no particular device"
fn parse_device(raw: Option<&str>) -> Result<Option<DeviceId>> {
    match raw.map(str::trim) {
        Some(raw) if !raw.is_empty() => DeviceId::parse(raw).map(Some),
        _ => Ok(None),
    }
}

/// Accepts a bare hex id or the `sha256:` checksum form
fn parse_artifact_id(raw: &str) -> Result<ArtifactId> {
    let hex = raw.trim();
    let hex = hex.strip_prefix("sha256:").unwrap_or(hex);
    hex.parse().map_err(FirmwareError::Validation)
}

fn range_request(headers: &HeaderMap) -> Option<RangeRequest> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse)?;

    Some(RangeRequest {
        range,
        if_range: headers
            .get(header::IF_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    })
}

/// Filename as it can appear inside a quoted header parameter
fn header_safe(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: String) {
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!("Dropping unrepresentable {} header {:?}", name, value),
    }
}

/// Binary response for a verified download, full (200) or partial (206)
fn firmware_response(download: FirmwareDownload) -> Response {
    let artifact = &download.artifact;
    let mut headers = HeaderMap::new();

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert_header(&mut headers, header::ETAG, format!("\"{}\"", artifact.id));
    insert_header(
        &mut headers,
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", header_safe(&artifact.filename)),
    );
    insert_header(
        &mut headers,
        HeaderName::from_static("x-firmware-checksum"),
        artifact.checksum.clone(),
    );
    if let Some(scope) = &download.scope {
        insert_header(
            &mut headers,
            HeaderName::from_static("x-firmware-scope"),
            scope.to_string(),
        );
    }

    let status = match &download.range {
        Some(range) => {
            insert_header(
                &mut headers,
                header::CONTENT_RANGE,
                content_range(range, download.total_size()),
            );
            StatusCode::PARTIAL_CONTENT
        }
        None => StatusCode::OK,
    };

    (status, headers, download.body).into_response()
}

fn multipart_error(e: MultipartError, max_size: u64) -> FirmwareError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        FirmwareError::Validation(format!(
            "firmware exceeds the upload limit of {} bytes",
            max_size
        ))
    } else {
        FirmwareError::Validation(format!("malformed upload: {}", e.body_text()))
    }
}

/// Drain the multipart body: a `file` part and an optional `device_id` part
async fn read_upload(mut multipart: Multipart, max_size: u64) -> Result<UploadRequest> {
    let mut file: Option<(String, Bytes)> = None;
    let mut device_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_size))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| multipart_error(e, max_size))?;
                tracing::debug!("Received {} ({} bytes)", filename, data.len());
                file = Some((filename, data));
            }
            "device_id" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| multipart_error(e, max_size))?;
                device_id = Some(value);
            }
            other => tracing::debug!("Ignoring multipart field {:?}", other),
        }
    }

    let (filename, data) = file
        .ok_or_else(|| FirmwareError::Validation("no file selected (missing 'file' part)".into()))?;

    Ok(UploadRequest {
        filename,
        device_id,
        data,
        uploaded_by: None,
    })
}

// ============================================================================
// Upload Handlers
// ============================================================================

/// POST /api/firmware - Upload a firmware image and publish it
///
/// The body is fully received before the pipeline starts. The pipeline then
/// runs in its own task so a client disconnect cannot interrupt publishing.
pub async fn upload_firmware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> std::result::Result<(StatusCode, Json<UploadResponse>), UploadError> {
    let max_size = state.pipeline.policy().max_size_bytes;
    let mut request = read_upload(multipart, max_size)
        .await
        .map_err(|source| UploadError {
            stage: UploadStage::Received,
            source,
        })?;
    request.uploaded_by = operator_id(&headers);

    let task_state = state.clone();
    let receipt = tokio::spawn(async move { task_state.pipeline.run(request).await })
        .await
        .map_err(|e| UploadError {
            stage: UploadStage::Failed,
            source: FirmwareError::Internal(format!("upload task aborted: {}", e)),
        })??;

    Ok((StatusCode::CREATED, Json(receipt.into())))
}

// ============================================================================
// Device Handlers
// ============================================================================

fn status_for(state: &AppState, device: Option<&DeviceId>) -> Result<Json<FirmwareStatus>> {
    match state.retrieval.current_firmware_info(device) {
        Ok(resolution) => Ok(Json(resolution.into())),
        Err(FirmwareError::NoFirmwareAvailable(_)) => Ok(Json(FirmwareStatus::unavailable())),
        Err(e) => Err(e),
    }
}

/// GET /api/firmware/status - What firmware a device (or the fleet) should run
pub async fn firmware_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceQuery>,
) -> Result<Json<FirmwareStatus>> {
    let device = parse_device(query.device_id.as_deref())?;
    status_for(&state, device.as_ref())
}

/// GET /api/devices/:device_id/firmware/status
pub async fn device_firmware_status(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<FirmwareStatus>> {
    let device = DeviceId::parse(&device_id)?;
    status_for(&state, Some(&device))
}

/// GET /api/firmware - Download the firmware resolved for `?device_id=`
pub async fn download_firmware(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let device = parse_device(query.device_id.as_deref())?;
    let download = state
        .retrieval
        .download_firmware(device.as_ref(), range_request(&headers).as_ref())
        .await?;
    Ok(firmware_response(download))
}

/// GET /api/devices/:device_id/firmware
pub async fn device_firmware(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let device = DeviceId::parse(&device_id)?;
    let download = state
        .retrieval
        .download_firmware(Some(&device), range_request(&headers).as_ref())
        .await?;
    Ok(firmware_response(download))
}

// ============================================================================
// Artifact Handlers
// ============================================================================

/// GET /api/artifacts - All stored artifacts, newest first
pub async fn list_artifacts(State(state): State<Arc<AppState>>) -> Json<Vec<ArtifactInfo>> {
    let bindings = state.resolver.bindings();
    Json(
        state
            .store
            .list()
            .into_iter()
            .map(|artifact| ArtifactInfo::new(artifact, &bindings))
            .collect(),
    )
}

/// GET /api/artifacts/:id
pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactInfo>> {
    let id = parse_artifact_id(&id)?;
    let artifact = state.store.metadata(&id)?;
    Ok(Json(ArtifactInfo::new(artifact, &state.resolver.bindings())))
}

/// GET /api/artifacts/:id/download - Verified download of a specific artifact
pub async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let id = parse_artifact_id(&id)?;
    let download = state
        .retrieval
        .download_artifact(&id, range_request(&headers).as_ref())
        .await?;
    Ok(firmware_response(download))
}

// ============================================================================
// Binding Handlers
// ============================================================================

/// GET /api/bindings
pub async fn list_bindings(State(state): State<Arc<AppState>>) -> Json<Vec<TargetBinding>> {
    Json(state.resolver.bindings())
}

/// GET /api/bindings/:scope - The binding for exactly this scope
pub async fn get_binding(
    State(state): State<Arc<AppState>>,
    Path(scope): Path<String>,
) -> Result<Json<TargetBinding>> {
    let scope = Scope::parse(&scope)?;
    state
        .resolver
        .binding(&scope)
        .map(Json)
        .ok_or_else(|| FirmwareError::NotFound(format!("binding for {}", scope)))
}

/// PUT /api/bindings/:scope - Point a scope at an existing artifact
/// (promotion or rollback without re-uploading)
pub async fn put_binding(
    State(state): State<Arc<AppState>>,
    Path(scope): Path<String>,
    headers: HeaderMap,
    Json(request): Json<BindRequest>,
) -> Result<Json<TargetBinding>> {
    let scope = Scope::parse(&scope)?;
    let operator = operator_id(&headers);
    let binding = state
        .resolver
        .bind(scope, request.artifact_id, operator.as_deref())
        .await?;
    Ok(Json(binding))
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        artifacts: state.store.list().len(),
        bindings: state.resolver.bindings().len(),
        stored_bytes: state.store.stored_bytes(),
    })
}
