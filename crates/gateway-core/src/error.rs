//! Error types for the gateway.
//!
//! The error taxonomy maps one-to-one onto the HTTP status codes surfaced at
//! the API boundary: admission errors (400/429), availability errors (503),
//! upstream errors (502) and internal faults (500).

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Unified gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request failed validation before admission
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable message
        message: String,
        /// Field that failed validation, if known
        field: Option<String>,
        /// Machine-readable error code
        code: String,
    },

    /// No registered provider serves the requested model
    #[error("unsupported model: {model}")]
    UnsupportedModel {
        /// The requested model
        model: String,
    },

    /// Subject exceeded its request or token quota
    #[error("rate limit exceeded for {subject}")]
    RateLimitExceeded {
        /// Rate-limit subject key
        subject: String,
        /// Time until the quota window resets
        retry_after: Duration,
    },

    /// Every provider serving the model is unavailable
    #[error("no available provider for model {model}")]
    NoAvailableProvider {
        /// The requested model
        model: String,
    },

    /// Circuit breaker is rejecting traffic for a provider
    #[error("circuit breaker open for provider {provider}")]
    CircuitBreakerOpen {
        /// Provider whose breaker is open
        provider: String,
        /// Time until the breaker becomes eligible for a trial
        retry_in: Duration,
    },

    /// The upstream provider call failed
    #[error("provider {provider} error: {message}")]
    Provider {
        /// Provider that failed
        provider: String,
        /// Error detail
        message: String,
        /// HTTP status returned by the provider, if any
        status_code: Option<u16>,
    },

    /// The upstream provider call timed out
    #[error("request timed out after {duration:?}")]
    Timeout {
        /// Configured timeout that elapsed
        duration: Duration,
    },

    /// A batch window member was discarded by the stale-window sweep
    #[error("batch window timed out before flush")]
    BatchTimeout,

    /// Serialization or deserialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal fault
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a validation error
    pub fn validation(
        message: impl Into<String>,
        field: Option<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            field,
            code: code.into(),
        }
    }

    /// Create an unsupported-model error
    pub fn unsupported_model(model: impl Into<String>) -> Self {
        Self::UnsupportedModel {
            model: model.into(),
        }
    }

    /// Create a rate-limit error
    pub fn rate_limit(subject: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimitExceeded {
            subject: subject.into(),
            retry_after,
        }
    }

    /// Create a no-available-provider error
    pub fn no_available_provider(model: impl Into<String>) -> Self {
        Self::NoAvailableProvider {
            model: model.into(),
        }
    }

    /// Create a circuit-breaker-open error
    pub fn circuit_breaker_open(provider: impl Into<String>, retry_in: Duration) -> Self {
        Self::CircuitBreakerOpen {
            provider: provider.into(),
            retry_in,
        }
    }

    /// Create a provider error
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Create a timeout error
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code surfaced at the API boundary
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::UnsupportedModel { .. } => 400,
            Self::RateLimitExceeded { .. } => 429,
            Self::NoAvailableProvider { .. } | Self::CircuitBreakerOpen { .. } => 503,
            Self::Provider { .. } | Self::Timeout { .. } | Self::BatchTimeout => 502,
            Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Machine-readable error code for response bodies
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "invalid_request",
            Self::UnsupportedModel { .. } => "unsupported_model",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::NoAvailableProvider { .. } => "no_available_provider",
            Self::CircuitBreakerOpen { .. } => "provider_unavailable",
            Self::Provider { .. } => "upstream_error",
            Self::Timeout { .. } => "upstream_timeout",
            Self::BatchTimeout => "batch_timeout",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Retry-after hint for quota and availability errors
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Self::CircuitBreakerOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// Whether this error records a failure against the provider's breaker.
    ///
    /// Provider 4xx responses prove the provider is alive and are the
    /// caller's fault; only 5xx, transport failures and timeouts count.
    #[must_use]
    pub fn is_provider_failure(&self) -> bool {
        match self {
            Self::Provider { status_code, .. } => {
                status_code.map_or(true, |code| code >= 500)
            }
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
