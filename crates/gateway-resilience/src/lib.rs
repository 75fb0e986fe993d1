//! # Gateway Resilience
//!
//! The stateful protection components shared by every request:
//!
//! - Per-provider circuit breakers with a single half-open trial slot
//! - Token-aware fixed-window rate limiting with post-hoc reconciliation
//! - Content-addressed response caching behind a pluggable backend
//! - Batch window aggregation for compatible concurrent requests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod response_cache;

pub use batch::{BatchAggregator, BatchDispatch};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use rate_limit::{
    QuotaSnapshot, QuotaStats, RateLimiter, TokenEstimator, DEFAULT_TOKEN_ESTIMATE,
};
pub use response_cache::{
    cache_key, CacheBackend, CacheError, CacheResult, CachedEntry, MemoryCacheBackend,
    ResponseCache, ResponseCacheStats, CACHE_KEY_PREFIX,
};
