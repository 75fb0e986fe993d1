//! Route definitions for the gateway API.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{handlers, middleware, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        // OpenAI-compatible endpoints
        .nest("/v1", api_routes())
        // Admin endpoints
        .nest("/admin", admin_routes())
        // Apply middleware
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        // Add state
        .with_state(state)
}

/// OpenAI-compatible API routes
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/embeddings", post(handlers::embeddings))
        .route("/models", get(handlers::list_models))
}

/// Admin/management routes
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/breakers", get(handlers::breaker_stats))
        .route("/breakers/:provider/reset", post(handlers::breaker_reset))
        .route("/quota", get(handlers::quota_stats))
        .route("/quota/:subject", get(handlers::quota_stats_for))
        .route("/quota/:subject/reset", post(handlers::quota_reset))
        .route("/cache", get(handlers::cache_stats))
        .route("/cache", delete(handlers::cache_invalidate))
}
