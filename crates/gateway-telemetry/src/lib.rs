//! # Gateway Telemetry
//!
//! Observability for the AI Model Gateway:
//! - Structured logging initialization (tracing + env-filter)
//! - Prometheus metrics for the request pipeline

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod metrics;
pub mod tracing_setup;

pub use metrics::{GatewayMetrics, RequestMetrics};
pub use tracing_setup::{init_tracing, TracingConfig, TracingError};
