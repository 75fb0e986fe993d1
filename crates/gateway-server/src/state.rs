//! Shared application state.

use crate::pipeline::DispatchCore;
use gateway_config::GatewayConfig;
use gateway_core::GatewayError;
use gateway_providers::{HttpDispatcher, ProviderDispatcher};
use gateway_resilience::{
    BatchAggregator, CircuitBreakerConfig, CircuitBreakerRegistry, RateLimiter, ResponseCache,
    TokenEstimator,
};
use gateway_routing::{ProviderRegistry, ProviderSelector};
use gateway_telemetry::GatewayMetrics;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<GatewayConfig>,
    /// Provider catalog
    pub registry: Arc<ProviderRegistry>,
    /// Breaker-aware provider selector
    pub selector: Arc<ProviderSelector>,
    /// Per-provider circuit breakers
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Per-subject quota limiter
    pub limiter: Arc<RateLimiter>,
    /// Request token estimator
    pub estimator: Arc<TokenEstimator>,
    /// Content-addressed response cache
    pub cache: Arc<ResponseCache>,
    /// Batch window aggregator
    pub batcher: Arc<BatchAggregator>,
    /// Dispatch core shared with the batcher
    pub dispatch: Arc<DispatchCore>,
    /// Prometheus metrics
    pub metrics: Arc<GatewayMetrics>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Wire the state from configuration using the HTTP dispatcher
    ///
    /// # Errors
    /// Fails when the HTTP client or metrics registry cannot be built.
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        let dispatcher = Arc::new(HttpDispatcher::new(&config.dispatch)?);
        Self::with_dispatcher(config, dispatcher)
    }

    /// Wire the state with a caller-supplied dispatcher (tests use a mock)
    ///
    /// # Errors
    /// Fails when the metrics registry cannot be built.
    pub fn with_dispatcher(
        config: GatewayConfig,
        dispatcher: Arc<dyn ProviderDispatcher>,
    ) -> Result<Self, GatewayError> {
        let metrics = Arc::new(
            GatewayMetrics::new().map_err(|e| GatewayError::internal(format!("metrics: {e}")))?,
        );

        let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            error_threshold: config.breaker.error_threshold,
            min_samples: config.breaker.min_samples,
            reset_timeout: config.breaker.reset_timeout,
        }));
        let selector = Arc::new(ProviderSelector::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
        ));

        let dispatch = Arc::new(DispatchCore::new(
            Arc::clone(&selector),
            dispatcher,
            Arc::clone(&metrics),
        ));
        let batcher = Arc::new(BatchAggregator::new(
            config.batch.clone(),
            dispatch.clone(),
        ));

        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            estimator: Arc::new(TokenEstimator::new()),
            cache: Arc::new(ResponseCache::in_memory(config.cache.clone())),
            config: Arc::new(config),
            registry,
            selector,
            breakers,
            batcher,
            dispatch,
            metrics,
            started_at: Instant::now(),
        })
    }
}
