//! Shared application state.

use std::sync::Arc;

use axum::http::HeaderMap;

use recap_blob::BlobStore;
use recap_engine::{PipelineController, ProgressBus};
use recap_store::{JobStore, QuotaLedger};

use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub blobs: Arc<dyn BlobStore>,
    pub bus: Arc<ProgressBus>,
    pub controller: Arc<PipelineController>,
    pub config: ServerConfig,
}

/// Caller identity from the fronting session layer.
pub fn owner_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::unauthenticated("missing x-user-id header"))
}
