//! HTTP request handlers for the gateway API.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::{GatewayError, GatewayRequest};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::{
    error::ApiError,
    extractors::Subject,
    pipeline::{self, ResponseMeta},
    state::AppState,
};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.registry.all().is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no providers configured");
    }
    if state.cache.health_check().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "cache backend unavailable");
    }
    (StatusCode::OK, "ready")
}

/// Liveness check endpoint
pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, "alive")
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

/// List models endpoint (OpenAI compatible)
#[instrument(skip(state))]
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": state.registry.list_models(),
    }))
}

/// Chat completion endpoint (OpenAI compatible)
#[instrument(skip(state, request), fields(model = %request.model))]
pub async fn chat_completions(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Json(request): Json<GatewayRequest>,
) -> Result<Response, ApiError> {
    // Streaming requests bypass cache and batching inside the pipeline
    // but still pay quota and walk the breaker-aware dispatch path.
    let outcome = pipeline::handle(&state, &subject, request).await?;
    Ok(with_meta(Json(outcome.response), &outcome.meta))
}

/// Embeddings endpoint (OpenAI compatible)
#[instrument(skip(state, request), fields(model = %request.model))]
pub async fn embeddings(
    State(state): State<AppState>,
    Subject(subject): Subject,
    Json(request): Json<GatewayRequest>,
) -> Result<Response, ApiError> {
    if !request.is_embedding() {
        return Err(ApiError(GatewayError::validation(
            "input is required for embeddings",
            Some("input".to_string()),
            "missing_input",
        )));
    }
    let outcome = pipeline::handle(&state, &subject, request).await?;
    Ok(with_meta(Json(outcome.response), &outcome.meta))
}

/// Circuit breaker stats for every provider seen so far
pub async fn breaker_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.breakers.all_stats()))
}

/// Manually reset a provider's circuit breaker
#[instrument(skip(state))]
pub async fn breaker_reset(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    if state.breakers.reset(&provider) {
        info!(provider = %provider, "circuit breaker manually reset");
        Json(json!({ "provider": provider, "reset": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "code": "unknown_provider", "message": format!("no breaker for provider: {provider}") } })),
        )
            .into_response()
    }
}

/// Quota stats for every tracked subject
pub async fn quota_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.limiter.all_stats()))
}

/// Quota stats for one subject
pub async fn quota_stats_for(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Response {
    match state.limiter.stats(&subject) {
        Some(stats) => Json(json!(stats)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "code": "unknown_subject", "message": format!("no quota record for subject: {subject}") } })),
        )
            .into_response(),
    }
}

/// Clear a subject's quota window
#[instrument(skip(state))]
pub async fn quota_reset(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Json<serde_json::Value> {
    let cleared = state.limiter.reset(&subject);
    if cleared {
        info!(subject = %subject, "quota window manually reset");
    }
    Json(json!({ "subject": subject, "reset": cleared }))
}

/// Cache hit/miss/error counters
pub async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.cache.stats()))
}

/// Drop every cached response
#[instrument(skip(state))]
pub async fn cache_invalidate(State(state): State<AppState>) -> Json<serde_json::Value> {
    let invalidated = state.cache.invalidate_all().await;
    info!(invalidated, "cache flushed");
    Json(json!({ "invalidated": invalidated }))
}

/// Attach the metadata headers to a successful response
fn with_meta(body: impl IntoResponse, meta: &ResponseMeta) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    if let Some(provider) = &meta.provider {
        insert(headers, "x-provider", provider);
    }
    insert(headers, "x-model", &meta.model);
    insert(headers, "x-cache-status", meta.cache_status);
    insert(
        headers,
        "x-response-time-ms",
        &meta.response_time.as_millis().to_string(),
    );
    insert(headers, "x-tokens-used", &meta.tokens_used.to_string());
    if let Some(cost) = meta.estimated_cost {
        insert(headers, "x-estimated-cost", &format!("{cost:.6}"));
    }
    if let Some(quota) = &meta.quota {
        insert(
            headers,
            "x-ratelimit-remaining-requests",
            &quota.requests_remaining().to_string(),
        );
        insert(
            headers,
            "x-ratelimit-remaining-tokens",
            &quota.tokens_remaining().to_string(),
        );
        insert(
            headers,
            "x-ratelimit-reset",
            &quota.reset_after_secs.to_string(),
        );
    }
    response
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
