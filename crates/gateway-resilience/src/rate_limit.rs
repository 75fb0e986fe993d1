//! Token-aware rate limiting.
//!
//! Fixed-window counters per subject with two independent caps: request
//! count and consumed tokens. Admission is optimistic (the request counter
//! is bumped immediately, gated on a conservative token estimate) and the
//! token counter is reconciled afterwards with the provider's actual usage.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use gateway_config::RateLimitSettings;
use gateway_core::{GatewayError, GatewayRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Token estimate used for unknown models or unestimable requests
pub const DEFAULT_TOKEN_ESTIMATE: u32 = 500;

/// Per-model token estimation costs
#[derive(Debug, Clone, Copy)]
struct ModelTokenCosts {
    /// Average characters per token for this model family
    chars_per_token: f64,
    /// Fixed per-message framing cost
    per_message: u32,
    /// Fixed per-request overhead
    base: u32,
}

/// Heuristic token estimator.
///
/// The estimate only gates admission; quota is reconciled with the actual
/// usage reported by the provider, so a rough per-model heuristic is enough.
pub struct TokenEstimator {
    models: Vec<(String, ModelTokenCosts)>,
}

impl TokenEstimator {
    /// Estimator with built-in costs for the common model families
    #[must_use]
    pub fn new() -> Self {
        let costs = |chars_per_token, per_message, base| ModelTokenCosts {
            chars_per_token,
            per_message,
            base,
        };
        Self {
            models: vec![
                ("gpt-4".to_string(), costs(4.0, 4, 3)),
                ("gpt-3.5".to_string(), costs(4.0, 4, 3)),
                ("claude".to_string(), costs(3.5, 5, 10)),
                ("text-embedding".to_string(), costs(4.0, 0, 0)),
            ],
        }
    }

    /// Estimate the token cost of a request.
    ///
    /// Longest-prefix match on the model name; unknown models fall back to
    /// a fixed default. The estimate is clipped to the request's own
    /// `max_tokens` ceiling when one is set, and rounded up.
    #[must_use]
    pub fn estimate(&self, request: &GatewayRequest) -> u32 {
        let Some(costs) = self.lookup(&request.model) else {
            debug!(model = %request.model, "no token costs for model, using default estimate");
            return self.clip(f64::from(DEFAULT_TOKEN_ESTIMATE), request);
        };

        let chars = request.content_chars();
        let message_count = request.messages.len();
        if chars == 0 && message_count == 0 {
            return self.clip(f64::from(DEFAULT_TOKEN_ESTIMATE), request);
        }

        let raw = f64::from(costs.base)
            + f64::from(costs.per_message) * message_count as f64
            + chars as f64 / costs.chars_per_token;
        self.clip(raw, request)
    }

    fn lookup(&self, model: &str) -> Option<ModelTokenCosts> {
        self.models
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, costs)| *costs)
    }

    #[allow(clippy::unused_self)]
    fn clip(&self, raw: f64, request: &GatewayRequest) -> u32 {
        let mut value = raw;
        if let Some(max_tokens) = request.max_tokens {
            value = value.min(f64::from(max_tokens));
        }
        value.ceil().max(1.0) as u32
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// One subject's counters for the active window
#[derive(Debug, Clone)]
struct QuotaRecord {
    requests: u32,
    tokens: u64,
    window_reset: DateTime<Utc>,
}

impl QuotaRecord {
    fn fresh(window: Duration) -> Self {
        Self {
            requests: 0,
            tokens: 0,
            window_reset: Utc::now()
                + ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero()),
        }
    }

    fn roll_if_stale(&mut self, window: Duration) {
        if Utc::now() > self.window_reset {
            *self = Self::fresh(window);
        }
    }
}

/// Counters returned to the pipeline for remaining-quota headers
#[derive(Debug, Clone, Copy)]
pub struct QuotaSnapshot {
    /// Requests consumed in the active window
    pub requests_used: u32,
    /// Request cap
    pub requests_limit: u32,
    /// Tokens consumed in the active window
    pub tokens_used: u64,
    /// Token cap
    pub tokens_limit: u64,
    /// Seconds until the window rolls over
    pub reset_after_secs: u64,
}

impl QuotaSnapshot {
    /// Requests remaining before the cap
    #[must_use]
    pub fn requests_remaining(&self) -> u32 {
        self.requests_limit.saturating_sub(self.requests_used)
    }

    /// Tokens remaining before the cap
    #[must_use]
    pub fn tokens_remaining(&self) -> u64 {
        self.tokens_limit.saturating_sub(self.tokens_used)
    }
}

/// Per-subject quota stats for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStats {
    /// Requests consumed in the active window
    pub requests: u32,
    /// Tokens consumed in the active window
    pub tokens: u64,
    /// When the window rolls over
    pub reset_time: DateTime<Utc>,
}

/// Fixed-window, dual-cap rate limiter keyed by subject
pub struct RateLimiter {
    settings: RateLimitSettings,
    records: DashMap<String, QuotaRecord>,
}

impl RateLimiter {
    /// Create a limiter from configuration
    #[must_use]
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            records: DashMap::new(),
        }
    }

    /// Admit or deny a request for a subject.
    ///
    /// Rolls the window if stale, denies if either cap would be exceeded,
    /// and otherwise consumes one request slot immediately. Token usage is
    /// only charged later via [`reconcile`](Self::reconcile). The rollover
    /// check and increment happen under the per-key map guard, so racing
    /// requests from one subject are serialized.
    ///
    /// # Errors
    /// Returns `GatewayError::RateLimitExceeded` with a retry-after hint
    /// when either cap is hit.
    pub fn check_and_consume(
        &self,
        subject: &str,
        estimated_tokens: u32,
    ) -> Result<QuotaSnapshot, GatewayError> {
        if !self.settings.enabled {
            return Ok(self.unlimited_snapshot());
        }

        let mut record = self
            .records
            .entry(subject.to_string())
            .or_insert_with(|| QuotaRecord::fresh(self.settings.window));
        record.roll_if_stale(self.settings.window);

        let over_requests = record.requests >= self.settings.max_requests;
        let over_tokens =
            record.tokens + u64::from(estimated_tokens) > self.settings.max_tokens;
        if over_requests || over_tokens {
            let retry_after = (record.window_reset - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1))
                .max(Duration::from_secs(1));
            debug!(
                subject,
                requests = record.requests,
                tokens = record.tokens,
                estimated_tokens,
                over_requests,
                over_tokens,
                "rate limit exceeded"
            );
            return Err(GatewayError::rate_limit(subject, retry_after));
        }

        record.requests += 1;
        Ok(self.snapshot_of(&record))
    }

    /// Charge a subject's token counter with actual usage.
    ///
    /// Called once per dispatched request when the provider response has
    /// reported real consumption. Returns post-reconciliation counters for
    /// the response's remaining-quota headers.
    pub fn reconcile(&self, subject: &str, actual_tokens: u32) -> QuotaSnapshot {
        if !self.settings.enabled {
            return self.unlimited_snapshot();
        }

        let mut record = self
            .records
            .entry(subject.to_string())
            .or_insert_with(|| QuotaRecord::fresh(self.settings.window));
        record.roll_if_stale(self.settings.window);
        record.tokens += u64::from(actual_tokens);
        self.snapshot_of(&record)
    }

    /// Current counters for a subject without consuming anything
    #[must_use]
    pub fn snapshot(&self, subject: &str) -> Option<QuotaSnapshot> {
        self.records.get(subject).map(|r| self.snapshot_of(&r))
    }

    /// Admin stats for one subject
    #[must_use]
    pub fn stats(&self, subject: &str) -> Option<QuotaStats> {
        self.records.get(subject).map(|r| QuotaStats {
            requests: r.requests,
            tokens: r.tokens,
            reset_time: r.window_reset,
        })
    }

    /// Admin stats for all known subjects
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, QuotaStats> {
        self.records
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    QuotaStats {
                        requests: entry.requests,
                        tokens: entry.tokens,
                        reset_time: entry.window_reset,
                    },
                )
            })
            .collect()
    }

    /// Drop a subject's counters, starting it on a fresh window.
    ///
    /// Returns false if the subject was unknown.
    pub fn reset(&self, subject: &str) -> bool {
        self.records.remove(subject).is_some()
    }

    fn snapshot_of(&self, record: &QuotaRecord) -> QuotaSnapshot {
        QuotaSnapshot {
            requests_used: record.requests,
            requests_limit: self.settings.max_requests,
            tokens_used: record.tokens,
            tokens_limit: self.settings.max_tokens,
            reset_after_secs: (record.window_reset - Utc::now())
                .num_seconds()
                .max(0) as u64,
        }
    }

    fn unlimited_snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            requests_used: 0,
            requests_limit: self.settings.max_requests,
            tokens_used: 0,
            tokens_limit: self.settings.max_tokens,
            reset_after_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ChatMessage;

    fn settings(max_requests: u32, max_tokens: u64, window: Duration) -> RateLimitSettings {
        RateLimitSettings {
            enabled: true,
            window,
            max_requests,
            max_tokens,
        }
    }

    fn chat_request(model: &str, content: &str) -> GatewayRequest {
        GatewayRequest::builder()
            .model(model)
            .message(ChatMessage::user(content))
            .build()
            .expect("valid request")
    }

    #[test]
    fn test_exactly_r_requests_admitted() {
        let limiter = RateLimiter::new(settings(3, 1_000_000, Duration::from_secs(60)));

        for _ in 0..3 {
            assert!(limiter.check_and_consume("alice", 10).is_ok());
        }

        let denied = limiter.check_and_consume("alice", 10);
        match denied {
            Err(GatewayError::RateLimitExceeded { retry_after, .. }) => {
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
    }

    #[test]
    fn test_window_rollover_resets_admission() {
        let limiter = RateLimiter::new(settings(2, 1_000_000, Duration::from_millis(50)));

        assert!(limiter.check_and_consume("bob", 10).is_ok());
        assert!(limiter.check_and_consume("bob", 10).is_ok());
        assert!(limiter.check_and_consume("bob", 10).is_err());

        std::thread::sleep(Duration::from_millis(80));

        assert!(limiter.check_and_consume("bob", 10).is_ok());
        assert!(limiter.check_and_consume("bob", 10).is_ok());
        assert!(limiter.check_and_consume("bob", 10).is_err());
    }

    #[test]
    fn test_token_cap_denies_before_request_cap() {
        let limiter = RateLimiter::new(settings(100, 1000, Duration::from_secs(60)));

        assert!(limiter.check_and_consume("carol", 400).is_ok());
        limiter.reconcile("carol", 400);

        // 400 + 700 > 1000 even though only one request was made
        assert!(limiter.check_and_consume("carol", 700).is_err());
        // A smaller request still fits
        assert!(limiter.check_and_consume("carol", 500).is_ok());
    }

    #[test]
    fn test_reconcile_uses_actual_not_estimate() {
        let limiter = RateLimiter::new(settings(100, 1000, Duration::from_secs(60)));

        assert!(limiter.check_and_consume("dave", 400).is_ok());
        let snapshot = limiter.reconcile("dave", 123);

        assert_eq!(snapshot.tokens_used, 123);
        assert_eq!(snapshot.requests_used, 1);
        assert_eq!(snapshot.tokens_remaining(), 877);
    }

    #[test]
    fn test_subjects_are_independent() {
        let limiter = RateLimiter::new(settings(1, 1000, Duration::from_secs(60)));

        assert!(limiter.check_and_consume("alice", 10).is_ok());
        assert!(limiter.check_and_consume("alice", 10).is_err());
        assert!(limiter.check_and_consume("bob", 10).is_ok());
    }

    #[test]
    fn test_disabled_limiter_always_admits() {
        let mut s = settings(1, 10, Duration::from_secs(60));
        s.enabled = false;
        let limiter = RateLimiter::new(s);

        for _ in 0..10 {
            assert!(limiter.check_and_consume("eve", 1000).is_ok());
        }
    }

    #[test]
    fn test_stats_and_reset() {
        let limiter = RateLimiter::new(settings(10, 1000, Duration::from_secs(60)));

        assert!(limiter.check_and_consume("frank", 50).is_ok());
        limiter.reconcile("frank", 60);

        let stats = limiter.stats("frank").expect("stats");
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.tokens, 60);

        assert!(limiter.reset("frank"));
        assert!(limiter.stats("frank").is_none());
        assert!(!limiter.reset("frank"));
    }

    #[test]
    fn test_estimator_known_model() {
        let estimator = TokenEstimator::new();
        let request = chat_request("gpt-3.5-turbo", "hello world");

        // base 3 + 1 message * 4 + 11 chars / 4.0 = 9.75 -> 10
        assert_eq!(estimator.estimate(&request), 10);
    }

    #[test]
    fn test_estimator_unknown_model_uses_default() {
        let estimator = TokenEstimator::new();
        let request = chat_request("totally-novel-model", "hello");
        assert_eq!(estimator.estimate(&request), DEFAULT_TOKEN_ESTIMATE);
    }

    #[test]
    fn test_estimator_clips_to_max_tokens() {
        let estimator = TokenEstimator::new();
        let mut request = chat_request("gpt-4", &"x".repeat(100_000));
        request.max_tokens = Some(64);
        assert_eq!(estimator.estimate(&request), 64);
    }

    #[test]
    fn test_estimator_embedding_input() {
        let estimator = TokenEstimator::new();
        let request = GatewayRequest::builder()
            .model("text-embedding-ada-002")
            .input(gateway_core::EmbeddingInput::Single("abcdefgh".to_string()))
            .build()
            .expect("valid request");

        // 8 chars / 4.0 = 2 tokens, no message framing
        assert_eq!(estimator.estimate(&request), 2);
    }
}
