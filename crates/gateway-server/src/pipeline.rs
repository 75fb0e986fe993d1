//! Per-request orchestration.
//!
//! Every request walks the same fixed order: quota admission, cache
//! lookup, provider selection, optional batch coalescing, dispatch, token
//! reconciliation, cache write, metrics. There are no in-request retries:
//! when a dispatch fails the error is returned and the *next* request
//! benefits from the updated breaker state, which avoids piling load onto
//! a failing provider.

use crate::state::AppState;
use async_trait::async_trait;
use gateway_core::{Dispatched, GatewayError, GatewayRequest, GatewayResponse, Usage};
use gateway_providers::ProviderDispatcher;
use gateway_resilience::{BatchDispatch, QuotaSnapshot};
use gateway_routing::{ProviderSelector, Selected};
use gateway_telemetry::{GatewayMetrics, RequestMetrics};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache status header values
pub const CACHE_HIT: &str = "HIT";
/// Cache miss marker
pub const CACHE_MISS: &str = "MISS";

/// Response metadata surfaced as headers
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    /// Provider that served the request, if any
    pub provider: Option<String>,
    /// Requested model
    pub model: String,
    /// `HIT` or `MISS`
    pub cache_status: &'static str,
    /// End-to-end handling time
    pub response_time: Duration,
    /// Total tokens reported by the provider
    pub tokens_used: u32,
    /// Estimated cost in USD based on the provider's unit cost
    pub estimated_cost: Option<f64>,
    /// Post-reconciliation quota counters
    pub quota: Option<QuotaSnapshot>,
}

/// A handled request: the unified response plus header metadata
pub struct PipelineOutcome {
    /// Unified response body
    pub response: GatewayResponse,
    /// Header metadata
    pub meta: ResponseMeta,
}

/// Selection + dispatch + breaker bookkeeping, shared between the direct
/// path and the batch aggregator's flush path.
pub struct DispatchCore {
    selector: Arc<ProviderSelector>,
    dispatcher: Arc<dyn ProviderDispatcher>,
    metrics: Arc<GatewayMetrics>,
}

impl DispatchCore {
    /// Create the dispatch core
    #[must_use]
    pub fn new(
        selector: Arc<ProviderSelector>,
        dispatcher: Arc<dyn ProviderDispatcher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            selector,
            dispatcher,
            metrics,
        }
    }

    /// Select a provider and dispatch exactly once, recording the outcome
    /// against the provider's breaker.
    ///
    /// # Errors
    /// Selection errors (unsupported model, none available) and dispatch
    /// errors propagate unchanged.
    pub async fn dispatch_once(
        &self,
        request: &GatewayRequest,
    ) -> Result<Dispatched, GatewayError> {
        let selected = self.selector.select(&request.model, &HashSet::new())?;
        if selected.recovered {
            debug!(provider = %selected.provider.name, "trial dispatch to recovering provider");
        }
        let started = Instant::now();
        let result = self.dispatcher.dispatch(&selected.provider, request).await;

        match &result {
            Ok(outcome) => self.settle_breaker(&selected, Ok(outcome.latency)),
            Err(e) => self.settle_breaker(&selected, Err((e, started.elapsed()))),
        }

        result
    }

    /// Record a dispatch outcome on the breaker; the state-transition
    /// metric fires only when the recording actually moved the state.
    fn settle_breaker(
        &self,
        selected: &Selected,
        outcome: Result<Duration, (&GatewayError, Duration)>,
    ) {
        let before = selected.breaker.state();
        match outcome {
            Ok(latency) => selected.breaker.record_success(latency),
            Err((error, elapsed)) => {
                if error.is_provider_failure() {
                    selected.breaker.record_failure(elapsed);
                } else {
                    // A client error from a live provider is not a fault
                    selected.breaker.record_success(elapsed);
                }
            }
        }
        let after = selected.breaker.state();
        if before != after {
            self.metrics
                .record_breaker_transition(&selected.provider.name, after.as_str());
        }
    }
}

#[async_trait]
impl BatchDispatch for DispatchCore {
    async fn dispatch_member(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        self.dispatch_once(&request).await.map(|d| d.response)
    }

    async fn dispatch_merged(
        &self,
        requests: Vec<GatewayRequest>,
    ) -> Result<Vec<GatewayResponse>, GatewayError> {
        let first = requests
            .first()
            .ok_or_else(|| GatewayError::internal("empty batch flush"))?;
        let selected = self.selector.select(&first.model, &HashSet::new())?;
        let started = Instant::now();
        let result = self
            .dispatcher
            .dispatch_merged(&selected.provider, &requests)
            .await;

        match &result {
            Ok(_) => self.settle_breaker(&selected, Ok(started.elapsed())),
            Err(e) => self.settle_breaker(&selected, Err((e, started.elapsed()))),
        }
        result
    }
}

/// Handle one admitted-for-processing request end to end.
///
/// # Errors
/// Returns the taxonomy error for the first stage that rejects the
/// request; the handler maps it to an HTTP response.
pub async fn handle(
    state: &AppState,
    subject: &str,
    request: GatewayRequest,
) -> Result<PipelineOutcome, GatewayError> {
    request.validate()?;
    let started = Instant::now();

    // Admission: optimistic request slot gated on a conservative estimate
    let estimate = state.estimator.estimate(&request);
    state
        .limiter
        .check_and_consume(subject, estimate)
        .map_err(|e| {
            state.metrics.record_rate_limited("quota");
            e
        })?;

    // Cache: a hit short-circuits dispatch and never touches the breaker
    if let Some(cached) = state.cache.get(&request).await {
        let tokens = cached.usage.total_tokens;
        let meta = ResponseMeta {
            provider: cached.provider.clone(),
            model: request.model.clone(),
            cache_status: CACHE_HIT,
            response_time: started.elapsed(),
            tokens_used: tokens,
            estimated_cost: estimated_cost(state, cached.provider.as_deref(), &request.model, tokens),
            quota: state.limiter.snapshot(subject),
        };
        record_metrics(state, &request, &meta, 200, true, Some(cached.usage));
        debug!(model = %request.model, "served from cache");
        return Ok(PipelineOutcome {
            response: cached,
            meta,
        });
    }

    // Dispatch, coalescing batchable shapes through the aggregator
    let dispatch_result = if state.batcher.applies_to(&request) {
        let merge_supported = state.registry.supports_native_batching(&request.model);
        state
            .batcher
            .submit(request.clone(), merge_supported)
            .await
            .map(|response| {
                let provider = response.provider.clone();
                (response, 200u16, provider)
            })
    } else {
        state.dispatch.dispatch_once(&request).await.map(|d| {
            let provider = d.provider.as_str().to_string();
            (d.response, d.status, Some(provider))
        })
    };

    let (response, status, provider) = match dispatch_result {
        Ok(parts) => parts,
        Err(e) => {
            let meta = error_meta(&request, started.elapsed());
            record_metrics(state, &request, &meta, e.status_code(), false, None);
            return Err(e);
        }
    };

    // Reconciliation charges actual usage, not the admission estimate
    let tokens = response.usage.total_tokens;
    let quota = state.limiter.reconcile(subject, tokens);

    // Best-effort cache write; only 2xx outcomes are stored
    state.cache.put(&request, &response, status).await;

    let meta = ResponseMeta {
        provider: provider.clone(),
        model: request.model.clone(),
        cache_status: CACHE_MISS,
        response_time: started.elapsed(),
        tokens_used: tokens,
        estimated_cost: estimated_cost(state, provider.as_deref(), &request.model, tokens),
        quota: Some(quota),
    };
    record_metrics(state, &request, &meta, status, false, Some(response.usage));

    Ok(PipelineOutcome { response, meta })
}

fn estimated_cost(
    state: &AppState,
    provider: Option<&str>,
    model: &str,
    tokens: u32,
) -> Option<f64> {
    state
        .registry
        .get(provider?)
        .and_then(|p| p.estimated_cost(model, tokens))
}

fn error_meta(request: &GatewayRequest, elapsed: Duration) -> ResponseMeta {
    ResponseMeta {
        provider: None,
        model: request.model.clone(),
        cache_status: CACHE_MISS,
        response_time: elapsed,
        tokens_used: 0,
        estimated_cost: None,
        quota: None,
    }
}

fn record_metrics(
    state: &AppState,
    request: &GatewayRequest,
    meta: &ResponseMeta,
    status: u16,
    cache_hit: bool,
    usage: Option<Usage>,
) {
    state.metrics.record_request(&RequestMetrics {
        model: request.model.clone(),
        provider: meta.provider.clone().unwrap_or_else(|| "none".to_string()),
        latency: meta.response_time,
        status_code: status,
        cache_hit,
        prompt_tokens: usage.map(|u| u.prompt_tokens),
        completion_tokens: usage.map(|u| u.completion_tokens),
        estimated_cost: meta.estimated_cost,
    });
}
