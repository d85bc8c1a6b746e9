//! Firmware API route definitions.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use super::handlers;
use super::AppState;

/// Headroom over the firmware size limit for multipart framing and fields
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Create the firmware API router.
pub fn router(state: Arc<AppState>) -> Router {
    let max_size = state.pipeline.policy().max_size_bytes;
    let body_limit = usize::try_from(max_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        // ================================================================
        // Upload
        // ================================================================
        .route(
            "/api/firmware",
            get(handlers::download_firmware).post(handlers::upload_firmware),
        )
        .route("/api/upload-bin-file", post(handlers::upload_firmware))
        // ================================================================
        // Device-facing status and download
        // ================================================================
        .route("/api/firmware/status", get(handlers::firmware_status))
        .route("/api/devices/:device_id/firmware", get(handlers::device_firmware))
        .route(
            "/api/devices/:device_id/firmware/status",
            get(handlers::device_firmware_status),
        )
        // ================================================================
        // Artifacts
        // ================================================================
        .route("/api/artifacts", get(handlers::list_artifacts))
        .route("/api/artifacts/:id", get(handlers::get_artifact))
        .route("/api/artifacts/:id/download", get(handlers::download_artifact))
        // ================================================================
        // Bindings
        // ================================================================
        .route("/api/bindings", get(handlers::list_bindings))
        .route(
            "/api/bindings/:scope",
            get(handlers::get_binding).put(handlers::put_binding),
        )
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadPolicy;
    use crate::test_support::{blob_path, fixture};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "fw-depot-test-boundary";

    async fn app(dir: &TempDir) -> Router {
        let fx = fixture(dir).await;
        router(Arc::new(AppState::new(
            fx.store,
            fx.resolver,
            UploadPolicy::default(),
        )))
    }

    fn upload(uri: &str, filename: &str, data: &[u8], device: Option<&str>) -> Request<Body> {
        let mut body = Vec::new();
        if let Some(device) = device {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"device_id\"\r\n\r\n{}\r\n",
                    BOUNDARY, device
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .header("x-operator-id", "alice")
            .body(Body::from(body))
            .unwrap()
    }

    fn fetch(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_upload_then_device_downloads() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let response = send(&app, upload("/api/firmware", "v1.bin", b"firmware one", None)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let receipt = json(response).await;
        assert_eq!(receipt["scope"], "global");
        assert_eq!(receipt["artifact"]["filename"], "v1.bin");
        assert_eq!(receipt["artifact"]["uploaded_by"], "alice");
        assert_eq!(receipt["bound_by"], "alice");
        assert!(receipt["updated_at"].is_string());
        let v1_id = receipt["artifact"]["id"].as_str().unwrap().to_string();

        let response = send(
            &app,
            upload("/api/upload-bin-file", "v2.bin", b"firmware two", Some("device-42")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json(response).await["scope"], "device-42");

        let status = json(send(&app, fetch("/api/firmware/status?device_id=device-42")).await).await;
        assert_eq!(status["available"], true);
        assert_eq!(status["firmware"]["filename"], "v2.bin");
        assert_eq!(status["scope"], "device-42");

        let response = send(&app, fetch("/api/firmware?device_id=device-7")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ETAG].to_str().unwrap(),
            format!("\"{}\"", v1_id)
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap(),
            "attachment; filename=\"v1.bin\""
        );
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(body(response).await, b"firmware one");

        let response = send(&app, fetch("/api/devices/device-42/firmware")).await;
        assert_eq!(body(response).await, b"firmware two");
    }

    #[tokio::test]
    async fn test_nothing_published_yet() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let response = send(&app, fetch("/api/firmware/status")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!({ "available": false }));

        let response = send(&app, fetch("/api/firmware?device_id=sensor-1")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"], "no_firmware_available");
    }

    #[tokio::test]
    async fn test_rejected_upload_reports_stage() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let response = send(&app, upload("/api/firmware", "notes.txt", b"hello", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json(response).await;
        assert_eq!(error["error"], "validation");
        assert_eq!(error["stage"], "validating");

        let response = send(&app, upload("/api/firmware", "fw.bin", b"x", Some("global"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app, fetch("/api/artifacts")).await;
        assert_eq!(json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_ranged_download() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;
        send(&app, upload("/api/firmware", "fw.bin", b"0123456789", None)).await;

        let request = Request::builder()
            .uri("/api/firmware")
            .header(header::RANGE, "bytes=4-")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 4-9/10");
        assert_eq!(body(response).await, b"456789");

        let request = Request::builder()
            .uri("/api/firmware")
            .header(header::RANGE, "bytes=20-30")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn test_rollback_through_bindings() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let v1 = json(send(&app, upload("/api/firmware", "v1.bin", b"one", None)).await).await;
        send(&app, upload("/api/firmware", "v2.bin", b"two", None)).await;
        let v1_id = v1["artifact"]["id"].as_str().unwrap();

        let request = Request::builder()
            .method("PUT")
            .uri("/api/bindings/global")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-operator-id", "bob")
            .body(Body::from(
                serde_json::json!({ "artifact_id": v1_id }).to_string(),
            ))
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let binding = json(response).await;
        assert_eq!(binding["artifact_id"], v1_id);
        assert_eq!(binding["bound_by"], "bob");

        let response = send(&app, fetch("/api/firmware")).await;
        assert_eq!(body(response).await, b"one");

        let artifacts = json(send(&app, fetch("/api/artifacts")).await).await;
        assert_eq!(artifacts.as_array().unwrap().len(), 2);

        let info = json(send(&app, fetch(&format!("/api/artifacts/{}", v1_id))).await).await;
        assert_eq!(info["bound_to"], serde_json::json!(["global"]));
    }

    #[tokio::test]
    async fn test_bind_unknown_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let unknown = crate::artifact::ArtifactId::from_data(b"nope").to_hex();
        let request = Request::builder()
            .method("PUT")
            .uri("/api/bindings/sensor-1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({ "artifact_id": unknown }).to_string(),
            ))
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, fetch("/api/bindings")).await;
        assert_eq!(json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_corrupted_blob_is_500() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;
        let receipt = json(send(&app, upload("/api/firmware", "fw.bin", b"good bytes", None)).await).await;
        let id: crate::artifact::ArtifactId =
            receipt["artifact"]["id"].as_str().unwrap().parse().unwrap();

        std::fs::write(blob_path(&dir, &id), b"evil bytes").unwrap();

        let response = send(&app, fetch("/api/firmware")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json(response).await["error"], "integrity");
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let response = send(&app, fetch("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let health = json(response).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["artifacts"], 0);
    }
}
