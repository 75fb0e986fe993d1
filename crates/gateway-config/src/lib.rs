//! # Gateway Config
//!
//! Configuration management for the AI Model Gateway.
//!
//! Configuration is loaded from a YAML or TOML file; every tunable has a
//! default matching the gateway's documented behavior, so an empty file is a
//! valid configuration (with no providers registered).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod models;

pub use loader::{load_config, ConfigError};
pub use models::{
    BatchSettings, BreakerSettings, CacheSettings, DispatchSettings, GatewayConfig, LogFormat,
    LogSettings, ModelConfig, ProviderConfig, RateLimitSettings, ServerSettings,
};
