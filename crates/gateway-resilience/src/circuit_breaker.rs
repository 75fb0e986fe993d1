//! Per-provider circuit breaker.
//!
//! Tracks dispatch outcomes per provider and fast-fails requests once the
//! rolling error rate crosses the configured threshold. Recovery is
//! check-driven: the first eligibility check after the reset deadline wins
//! a single half-open trial slot via compare-and-set, and the trial outcome
//! decides whether the breaker closes again or re-opens.

use chrono::{DateTime, TimeZone, Utc};
use gateway_core::GatewayError;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed = 0,
    /// Requests are rejected until the reset deadline passes
    Open = 1,
    /// Exactly one trial request is in flight
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl CircuitState {
    /// Lowercase state name for logs and metrics labels
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Error rate (failures / total) at which the circuit opens
    pub error_threshold: f64,
    /// Total outcomes required before the error rate is considered
    pub min_samples: u32,
    /// Time to wait after opening before a trial request is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            min_samples: 10,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Circuit breaker for a single provider
#[derive(Debug)]
pub struct CircuitBreaker {
    provider_id: String,
    config: CircuitBreakerConfig,
    /// Current state (atomic for lock-free reads)
    state: AtomicU8,
    success_count: AtomicU32,
    failure_count: AtomicU32,
    /// Sum of observed dispatch latencies, for the rolling average
    latency_sum_ms: AtomicU64,
    /// Milliseconds since epoch; 0 means no failure observed yet
    last_failure_ms: AtomicU64,
    /// Milliseconds since epoch after which a trial is allowed
    next_attempt_ms: AtomicU64,
    /// Serializes multi-field transitions
    transition_lock: RwLock<()>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(provider_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            success_count: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            latency_sum_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            next_attempt_ms: AtomicU64::new(0),
            transition_lock: RwLock::new(()),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(provider_id: impl Into<String>) -> Self {
        Self::new(provider_id, CircuitBreakerConfig::default())
    }

    /// Get the provider ID
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Check whether a request may be dispatched through this breaker.
    ///
    /// When the circuit is open and the reset deadline has passed, exactly
    /// one concurrent caller wins the `open -> half_open` compare-and-set
    /// and is granted the trial request; everyone else keeps seeing the
    /// circuit as unavailable until the trial resolves.
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitBreakerOpen` if the circuit rejects
    /// the request.
    pub fn check(&self) -> Result<(), GatewayError> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(self.open_error()),
            CircuitState::Open => {
                let next_attempt = self.next_attempt_ms.load(Ordering::Acquire);
                if now_millis() >= next_attempt {
                    // Single trial slot: only the CAS winner proceeds.
                    if self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u8,
                            CircuitState::HalfOpen as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        info!(
                            provider = %self.provider_id,
                            "circuit breaker half-open, allowing trial request"
                        );
                        return Ok(());
                    }
                }
                Err(self.open_error())
            }
        }
    }

    fn open_error(&self) -> GatewayError {
        let next_attempt = self.next_attempt_ms.load(Ordering::Acquire);
        let retry_in = Duration::from_millis(next_attempt.saturating_sub(now_millis()));
        GatewayError::circuit_breaker_open(&self.provider_id, retry_in)
    }

    /// Record a successful dispatch outcome
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::AcqRel);
        self.latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);

        if self.state() == CircuitState::HalfOpen {
            self.transition_to_closed();
        }
    }

    /// Record a failed dispatch outcome
    pub fn record_failure(&self, latency: Duration) {
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.last_failure_ms.store(now_millis(), Ordering::Release);

        match self.state() {
            CircuitState::Closed => {
                let successes = self.success_count.load(Ordering::Acquire);
                let total = failures + successes;
                if total > self.config.min_samples
                    && f64::from(failures) / f64::from(total) >= self.config.error_threshold
                {
                    debug!(
                        provider = %self.provider_id,
                        failures,
                        total,
                        threshold = self.config.error_threshold,
                        "error rate crossed threshold"
                    );
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                // Trial request failed, re-open with a fresh deadline
                debug!(provider = %self.provider_id, "half-open trial failed, reopening");
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self) {
        let _guard = self.transition_lock.write();

        let prev = self.state.swap(CircuitState::Open as u8, Ordering::AcqRel);
        self.next_attempt_ms.store(
            now_millis() + self.config.reset_timeout.as_millis() as u64,
            Ordering::Release,
        );

        if prev != CircuitState::Open as u8 {
            warn!(provider = %self.provider_id, "circuit breaker opened");
        }
    }

    fn transition_to_closed(&self) {
        let _guard = self.transition_lock.write();

        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.latency_sum_ms.store(0, Ordering::Release);
        self.next_attempt_ms.store(0, Ordering::Release);

        info!(provider = %self.provider_id, "circuit breaker closed");
    }

    /// Force the breaker into half-open with its error count halved.
    ///
    /// Used by the provider selector's oldest-failure recovery: when every
    /// provider serving a model is open, the one that failed longest ago is
    /// given another chance rather than failing the request outright. The
    /// half-open state still limits exposure to a single trial request.
    pub fn force_half_open(&self) {
        let _guard = self.transition_lock.write();

        let failures = self.failure_count.load(Ordering::Acquire);
        self.failure_count.store(failures / 2, Ordering::Release);
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);

        info!(
            provider = %self.provider_id,
            "circuit breaker forced half-open for recovery"
        );
    }

    /// Manually reset: counts halved, state forced closed
    pub fn reset(&self) {
        let _guard = self.transition_lock.write();

        let failures = self.failure_count.load(Ordering::Acquire);
        let successes = self.success_count.load(Ordering::Acquire);
        self.failure_count.store(failures / 2, Ordering::Release);
        self.success_count.store(successes / 2, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.next_attempt_ms.store(0, Ordering::Release);

        info!(provider = %self.provider_id, "circuit breaker manually reset");
    }

    /// Timestamp of the most recent recorded failure, if any
    #[must_use]
    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_failure_ms.load(Ordering::Acquire);
        if ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(ms as i64).single()
        }
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let failures = self.failure_count.load(Ordering::Acquire);
        let successes = self.success_count.load(Ordering::Acquire);
        let total = failures + successes;
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            self.latency_sum_ms.load(Ordering::Relaxed) as f64 / f64::from(total)
        };

        CircuitBreakerStats {
            state: self.state(),
            failures,
            successes,
            avg_latency_ms,
            last_failure: self.last_failure(),
        }
    }
}

/// Circuit breaker statistics, surfaced on the admin endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failure count in the current window
    pub failures: u32,
    /// Success count in the current window
    pub successes: u32,
    /// Rolling average dispatch latency in milliseconds
    pub avg_latency_ms: f64,
    /// Timestamp of the most recent failure
    pub last_failure: Option<DateTime<Utc>>,
}

impl CircuitBreakerStats {
    /// Observed error rate
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.failures + self.successes;
        if total == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(total)
        }
    }
}

/// Registry of circuit breakers, one per provider, created lazily
pub struct CircuitBreakerRegistry {
    breakers: dashmap::DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry using the given per-provider configuration
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: dashmap::DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker for a provider
    #[must_use]
    pub fn breaker(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(provider_id, self.config.clone()))
            })
            .clone()
    }

    /// Current state for a provider; `Closed` if never referenced
    #[must_use]
    pub fn state(&self, provider_id: &str) -> CircuitState {
        self.breakers
            .get(provider_id)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Stats for every known provider
    #[must_use]
    pub fn all_stats(&self) -> std::collections::HashMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Manually reset one provider's breaker.
    ///
    /// Returns false if the provider has no breaker yet.
    pub fn reset(&self, provider_id: &str) -> bool {
        if let Some(breaker) = self.breakers.get(provider_id) {
            breaker.reset();
            true
        } else {
            false
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_threshold: 0.5,
            min_samples: 4,
            reset_timeout: Duration::from_millis(20),
        }
    }

    fn latency() -> Duration {
        Duration::from_millis(10)
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = CircuitBreaker::with_defaults("test-provider");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_opens_when_error_rate_crosses_threshold() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        // 2 successes + 2 failures = 4 samples, not past min_samples yet
        cb.record_success(latency());
        cb.record_success(latency());
        cb.record_failure(latency());
        cb.record_failure(latency());
        assert_eq!(cb.state(), CircuitState::Closed);

        // 5th sample pushes total past min_samples with rate 3/5 >= 0.5
        cb.record_failure(latency());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        for _ in 0..8 {
            cb.record_success(latency());
        }
        cb.record_failure(latency());
        cb.record_failure(latency());

        // 2/10 failures, well under 50%
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_exactly_at_threshold_crossing() {
        // Default config: threshold 50%, min samples 10. With 6 failures in
        // the first 10 calls the breaker must open at the 11th sample (the
        // first where total > 10) and not before.
        let cb = CircuitBreaker::with_defaults("test-provider");

        for _ in 0..4 {
            cb.record_success(latency());
        }
        for _ in 0..5 {
            cb.record_failure(latency());
        }
        assert_eq!(cb.state(), CircuitState::Closed, "total not past sample floor");

        cb.record_failure(latency());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_single_trial_slot() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        for _ in 0..5 {
            cb.record_failure(latency());
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());

        std::thread::sleep(Duration::from_millis(30));

        // First check past the deadline wins the trial slot
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Concurrent callers keep getting rejected until the trial resolves
        assert!(cb.check().is_err());
        assert!(cb.check().is_err());
    }

    #[test]
    fn test_half_open_trial_success_closes() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        for _ in 0..5 {
            cb.record_failure(latency());
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.check().is_ok());

        cb.record_success(latency());
        assert_eq!(cb.state(), CircuitState::Closed);

        let stats = cb.stats();
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.successes, 0);
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        for _ in 0..5 {
            cb.record_failure(latency());
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(latency());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());
    }

    #[test]
    fn test_force_half_open_halves_failures() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        for _ in 0..6 {
            cb.record_failure(latency());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.force_half_open();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.stats().failures, 3);
    }

    #[test]
    fn test_manual_reset_halves_counts() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        for _ in 0..4 {
            cb.record_success(latency());
        }
        for _ in 0..6 {
            cb.record_failure(latency());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let stats = cb.stats();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.successes, 2);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_stats_surface() {
        let cb = CircuitBreaker::new("test-provider", fast_config());

        cb.record_success(Duration::from_millis(100));
        cb.record_failure(Duration::from_millis(200));

        let stats = cb.stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert!((stats.error_rate() - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_latency_ms - 150.0).abs() < 0.01);
        assert!(stats.last_failure.is_some());
    }

    #[test]
    fn test_registry_creates_lazily_and_resets() {
        let registry = CircuitBreakerRegistry::default();
        assert_eq!(registry.state("unknown"), CircuitState::Closed);
        assert!(!registry.reset("unknown"));

        let breaker = registry.breaker("openai");
        breaker.record_failure(latency());
        assert!(registry.reset("openai"));

        let stats = registry.all_stats();
        assert!(stats.contains_key("openai"));
    }

    #[test]
    fn test_registry_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.breaker("openai");
        let b = registry.breaker("openai");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
