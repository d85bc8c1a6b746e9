//! HTTP surface of the firmware depot.
//!
//! Handlers are thin: they parse the request, call into the core services and
//! render the result. Every failure renders as JSON `{error, message}`.

mod handlers;
mod routes;
mod types;

use std::sync::Arc;

pub use routes::router;

use crate::artifact::ArtifactStore;
use crate::config::UploadPolicy;
use crate::pipeline::UploadPipeline;
use crate::retrieval::RetrievalService;
use crate::targeting::TargetingResolver;

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<ArtifactStore>,
    pub resolver: Arc<TargetingResolver>,
    pub pipeline: UploadPipeline,
    pub retrieval: RetrievalService,
}

impl AppState {
    pub fn new(
        store: Arc<ArtifactStore>,
        resolver: Arc<TargetingResolver>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            pipeline: UploadPipeline::new(store.clone(), resolver.clone(), policy),
            retrieval: RetrievalService::new(store.clone(), resolver.clone()),
            store,
            resolver,
        }
    }
}
