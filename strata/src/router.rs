//! HTTP router for Strata

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use strata_s3::S3State;
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(state: Arc<S3State>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/_strata/health", get(health_check))
        .merge(strata_s3::router(state))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status": "running", "services": ["s3"]}"#,
    )
}
