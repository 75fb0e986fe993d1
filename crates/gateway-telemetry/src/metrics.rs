//! Prometheus metrics for the request pipeline.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Per-request metrics record emitted by the pipeline after completion.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Requested model
    pub model: String,
    /// Provider that produced the response ("none" when dispatch failed)
    pub provider: String,
    /// End-to-end latency
    pub latency: Duration,
    /// HTTP status returned to the caller
    pub status_code: u16,
    /// Whether the response was served from cache
    pub cache_hit: bool,
    /// Prompt tokens consumed, if known
    pub prompt_tokens: Option<u32>,
    /// Completion tokens generated, if known
    pub completion_tokens: Option<u32>,
    /// Estimated cost in USD, if known
    pub estimated_cost: Option<f64>,
}

/// Prometheus metrics registry for the gateway
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_latency: HistogramVec,
    cache_events: IntCounterVec,
    breaker_transitions: IntCounterVec,
    tokens_total: IntCounterVec,
    rate_limited_total: IntCounterVec,
}

impl GatewayMetrics {
    /// Create a new metrics registry.
    ///
    /// # Errors
    /// Returns a prometheus error if metric registration fails (duplicate
    /// names), which cannot happen with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Requests processed"),
            &["model", "provider", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "End-to-end request latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["provider"],
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        let cache_events = IntCounterVec::new(
            Opts::new("gateway_cache_events_total", "Response cache hits/misses"),
            &["result"],
        )?;
        registry.register(Box::new(cache_events.clone()))?;

        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "gateway_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["provider", "to_state"],
        )?;
        registry.register(Box::new(breaker_transitions.clone()))?;

        let tokens_total = IntCounterVec::new(
            Opts::new("gateway_tokens_total", "Tokens consumed upstream"),
            &["provider", "kind"],
        )?;
        registry.register(Box::new(tokens_total.clone()))?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new("gateway_rate_limited_total", "Requests denied by quota"),
            &["reason"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_latency,
            cache_events,
            breaker_transitions,
            tokens_total,
            rate_limited_total,
        })
    }

    /// Record a completed request
    pub fn record_request(&self, metrics: &RequestMetrics) {
        self.requests_total
            .with_label_values(&[
                &metrics.model,
                &metrics.provider,
                &metrics.status_code.to_string(),
            ])
            .inc();

        self.request_latency
            .with_label_values(&[&metrics.provider])
            .observe(metrics.latency.as_secs_f64());

        self.cache_events
            .with_label_values(&[if metrics.cache_hit { "hit" } else { "miss" }])
            .inc();

        if let Some(prompt) = metrics.prompt_tokens {
            self.tokens_total
                .with_label_values(&[&metrics.provider, "prompt"])
                .inc_by(u64::from(prompt));
        }
        if let Some(completion) = metrics.completion_tokens {
            self.tokens_total
                .with_label_values(&[&metrics.provider, "completion"])
                .inc_by(u64::from(completion));
        }
    }

    /// Record a circuit breaker transition
    pub fn record_breaker_transition(&self, provider: &str, to_state: &str) {
        self.breaker_transitions
            .with_label_values(&[provider, to_state])
            .inc();
    }

    /// Record a quota denial
    pub fn record_rate_limited(&self, reason: &str) {
        self.rate_limited_total.with_label_values(&[reason]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    #[must_use]
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
