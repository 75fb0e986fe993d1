//! # AI Model Gateway
//!
//! Resilient, OpenAI-compatible gateway in front of multiple AI model
//! providers: cost-aware provider selection, per-provider circuit
//! breakers, token-aware rate limiting, response caching and batch
//! aggregation.
//!
//! ## Usage
//!
//! ```bash
//! # Start with the default configuration file
//! ai-model-gateway
//!
//! # Start with a custom config file
//! ai-model-gateway --config /path/to/config.yaml
//!
//! # Or point at it via the environment
//! GATEWAY_CONFIG=/path/to/config.yaml ai-model-gateway
//! ```

use anyhow::Context;
use gateway_config::{load_config, GatewayConfig, LogFormat};
use gateway_server::AppState;
use gateway_telemetry::{init_tracing, TracingConfig};
use std::env;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "gateway failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = resolve_config()?;

    init_tracing(&TracingConfig {
        service_name: "ai-model-gateway".to_string(),
        log_level: config.logging.level.clone(),
        json: config.logging.format == LogFormat::Json,
    })
    .context("failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        providers = config.providers.len(),
        "starting AI Model Gateway"
    );

    let state = AppState::from_config(config).context("failed to wire application state")?;

    gateway_server::serve(state)
        .await
        .context("server terminated with an error")?;

    Ok(())
}

/// Resolve the configuration from `--config`, `GATEWAY_CONFIG`, or the
/// default path, falling back to built-in defaults when no file exists.
fn resolve_config() -> anyhow::Result<GatewayConfig> {
    let mut args = env::args().skip(1);
    let explicit = loop {
        match args.next().as_deref() {
            Some("--config" | "-c") => break args.next(),
            Some(_) => continue,
            None => break None,
        }
    };

    let path = explicit
        .or_else(|| env::var("GATEWAY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if std::path::Path::new(&path).exists() {
        load_config(&path).with_context(|| format!("failed to load config from {path}"))
    } else {
        // Logging is not up yet at this point
        eprintln!("config file {path} not found, using built-in defaults");
        Ok(GatewayConfig::default())
    }
}
