//! Configuration file loading and validation.

use crate::models::GatewayConfig;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// File extension is not a supported format
    #[error("unsupported config format: {0} (expected .yaml, .yml or .toml)")]
    UnsupportedFormat(String),

    /// YAML parse failure
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parse failure
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Semantic validation failure
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Cross-field consistency failure
    #[error("invalid configuration: {0}")]
    Inconsistent(String),
}

/// Load and validate a configuration file.
///
/// The format is chosen by file extension; `.yaml`/`.yml` and `.toml` are
/// supported.
///
/// # Errors
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    let config: GatewayConfig = match extension {
        "yaml" | "yml" => serde_yaml::from_str(&raw)?,
        "toml" => toml::from_str(&raw)?,
        other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
    };

    config.validate()?;
    check_consistency(&config)?;

    info!(
        path = %path.display(),
        providers = config.providers.len(),
        "Configuration loaded"
    );

    Ok(config)
}

/// Cross-field checks that `validator` attributes cannot express.
fn check_consistency(config: &GatewayConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for provider in &config.providers {
        if !seen.insert(provider.name.as_str()) {
            return Err(ConfigError::Inconsistent(format!(
                "duplicate provider name: {}",
                provider.name
            )));
        }

        for model in &provider.models {
            if model.cost_per_1k_tokens < 0.0 {
                return Err(ConfigError::Inconsistent(format!(
                    "negative cost for model {} on provider {}",
                    model.name, provider.name
                )));
            }
        }

        match provider.wire_format.as_str() {
            "openai" | "anthropic" => {}
            other => {
                return Err(ConfigError::Inconsistent(format!(
                    "unknown wire format {other:?} for provider {}",
                    provider.name
                )))
            }
        }
    }

    if config.batch.enabled && config.batch.max_size == 0 {
        return Err(ConfigError::Inconsistent(
            "batch.max_size must be positive when batching is enabled".to_string(),
        ));
    }

    Ok(())
}
