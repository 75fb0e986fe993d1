//! # Gateway Server
//!
//! Axum HTTP surface for the AI Model Gateway:
//! - OpenAI-compatible `/v1` endpoints backed by the resilience pipeline
//! - Admin endpoints for breakers, quotas, and the response cache
//! - Health, readiness, and Prometheus metrics endpoints
//! - Graceful shutdown handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use pipeline::{DispatchCore, PipelineOutcome, ResponseMeta};
pub use routes::create_router;
pub use server::serve;
pub use state::AppState;
