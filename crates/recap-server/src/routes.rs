//! Route definitions.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::handlers::{jobs, quota};
use crate::state::AppState;
use crate::ws;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/api/jobs/:id", get(jobs::get_job))
        .route("/api/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/api/jobs/:id/output", get(jobs::output_url))
        .route("/api/jobs/:id/events", get(ws::ws_events))
        .route("/api/quota", get(quota::get_quota))
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
