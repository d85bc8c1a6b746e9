mod api;
mod artifact;
mod config;
mod db;
mod error;
mod pipeline;
mod retrieval;
mod storage;
mod targeting;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use artifact::ArtifactStore;
use config::ServerConfig;
use targeting::TargetingResolver;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fw_depot=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("Firmware depot failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env()?;

    // Catalog
    let db_path = config.catalog_path();
    let db = Arc::new(db::init_database(&db_path).await?);
    tracing::info!("Catalog initialized at {:?}", db_path);

    // Blob storage
    let backend = config.storage.build().await?;

    let store = Arc::new(ArtifactStore::open(backend, db.clone(), config.quota_bytes).await?);
    let resolver = Arc::new(TargetingResolver::open(store.clone(), db).await?);

    match resolver.resolve(None) {
        Ok(resolution) => tracing::info!(
            "Global firmware: {} ({})",
            resolution.artifact.filename,
            resolution.artifact.id
        ),
        Err(_) => tracing::info!("No global firmware published yet"),
    }

    let state = Arc::new(AppState::new(store, resolver, config.upload.clone()));
    let app = api::router(state).layer(TraceLayer::new_for_http());

    tracing::info!("Firmware depot starting on http://{}", config.bind_addr);
    tracing::info!(
        "Accepting {} up to {} bytes",
        config
            .upload
            .allowed_extensions
            .iter()
            .map(|e| format!(".{}", e))
            .collect::<Vec<_>>()
            .join(", "),
        config.upload.max_size_bytes
    );
    tracing::info!("");
    tracing::info!("API Endpoints:");
    tracing::info!("  POST /api/firmware               - Upload and publish firmware");
    tracing::info!("  GET  /api/firmware/status        - Current firmware for ?device_id=");
    tracing::info!("  GET  /api/firmware               - Download firmware for ?device_id=");
    tracing::info!("  PUT  /api/bindings/:scope        - Rebind a scope (rollback)");

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
