//! Configuration model types with spec-matching defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server settings
    pub server: ServerSettings,

    /// Registered upstream providers, in declaration order.
    /// Declaration order breaks cost ties during selection.
    #[validate(nested)]
    pub providers: Vec<ProviderConfig>,

    /// Circuit breaker settings applied to every provider
    #[validate(nested)]
    pub breaker: BreakerSettings,

    /// Token-aware rate limiter settings
    pub rate_limit: RateLimitSettings,

    /// Response cache settings
    pub cache: CacheSettings,

    /// Batch window aggregator settings
    pub batch: BatchSettings,

    /// Upstream dispatch settings
    pub dispatch: DispatchSettings,

    /// Logging settings
    pub logging: LogSettings,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// One upstream provider entry
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProviderConfig {
    /// Provider name (unique)
    #[validate(length(min = 1))]
    pub name: String,

    /// Base endpoint URL
    #[validate(url)]
    pub base_url: String,

    /// Header used to carry the credential (e.g. "authorization")
    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    /// Credential value prefix (e.g. "Bearer "); empty for raw keys
    #[serde(default)]
    pub auth_prefix: String,

    /// Environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Wire format spoken by this provider ("openai" or "anthropic")
    #[serde(default = "default_wire_format")]
    pub wire_format: String,

    /// Models served by this provider
    #[validate(length(min = 1))]
    pub models: Vec<ModelConfig>,
}

fn default_auth_header() -> String {
    "authorization".to_string()
}

fn default_wire_format() -> String {
    "openai".to_string()
}

/// One model served by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name as requested by callers
    pub name: String,

    /// Unit cost in USD per 1000 tokens, used for cheapest-provider selection
    pub cost_per_1k_tokens: f64,

    /// Whether the model serves embedding requests
    #[serde(default)]
    pub embedding: bool,

    /// Whether the provider accepts multiple inputs in one call for this
    /// model (enables merged batch dispatch)
    #[serde(default)]
    pub native_batching: bool,
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BreakerSettings {
    /// Rolling error rate at which the breaker opens (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub error_threshold: f64,

    /// Minimum recorded outcomes before the threshold applies
    pub min_samples: u32,

    /// How long an open breaker waits before allowing a trial request
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            min_samples: 10,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Token-aware rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Whether rate limiting is enabled
    pub enabled: bool,

    /// Fixed window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Maximum requests per subject per window
    pub max_requests: u32,

    /// Maximum tokens per subject per window
    pub max_tokens: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
            max_tokens: 100_000,
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether the response cache is enabled
    pub enabled: bool,

    /// Entry time-to-live
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum entries held by the in-memory backend
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
        }
    }
}

/// Batch window aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Whether request batching is enabled
    pub enabled: bool,

    /// Coalescing window before a flush
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Maximum members per window; reaching it flushes immediately
    pub max_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_millis(200),
            max_size: 10,
        }
    }
}

/// Upstream dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Per-call timeout for upstream provider requests
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log filter directive (overridden by RUST_LOG)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text lines
    #[default]
    Text,
    /// Structured JSON lines
    Json,
}
