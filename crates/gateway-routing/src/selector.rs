//! Cost-aware provider selection filtered by breaker state.
//!
//! Among providers serving a model whose breaker admits traffic, the one
//! with the lowest configured unit cost wins; ties go to configuration
//! order. When several serving providers are all open the selector
//! performs oldest-failure recovery instead of failing the request: the
//! provider that failed longest ago is forced half-open (error count
//! halved) and given the single trial request. A lone open provider is
//! not recovered early; it rides out its own reset timeout so a failing
//! upstream is not hammered with forced trials.

use crate::registry::{Provider, ProviderRegistry};
use gateway_core::GatewayError;
use gateway_resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// A selection outcome: the provider plus its breaker handle, which the
/// pipeline uses to record the dispatch outcome.
#[derive(Debug)]
pub struct Selected {
    /// The chosen provider
    pub provider: Arc<Provider>,
    /// Its circuit breaker; the dispatch outcome must be recorded here
    pub breaker: Arc<CircuitBreaker>,
    /// True when the provider was forced half-open by recovery
    pub recovered: bool,
}

/// Breaker-aware, cheapest-first provider selector
pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ProviderSelector {
    /// Create a selector over the given catalog and breaker registry
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { registry, breakers }
    }

    /// The provider catalog
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The breaker registry
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Select a provider for a model.
    ///
    /// Candidates are walked cheapest-first and the first whose breaker
    /// admits the request wins; an open breaker past its reset deadline
    /// admits by granting the half-open trial slot. If nobody admits and
    /// two or more breakers are open, oldest-failure recovery forces the
    /// longest-quiet one half-open and returns that provider.
    ///
    /// # Errors
    /// `UnsupportedModel` when no configured provider serves the model;
    /// `CircuitBreakerOpen` when a lone open provider is still inside its
    /// reset timeout; `NoAvailableProvider` when every serving provider
    /// is excluded or mid-trial.
    pub fn select(
        &self,
        model: &str,
        excluding: &HashSet<String>,
    ) -> Result<Selected, GatewayError> {
        let serving = self.registry.providers_for(model);
        if serving.is_empty() {
            return Err(GatewayError::unsupported_model(model));
        }

        let mut candidates: Vec<Arc<Provider>> = serving
            .into_iter()
            .filter(|p| !excluding.contains(&p.name))
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::no_available_provider(model));
        }

        // Cheapest first; declaration order breaks ties (stable sort over
        // the declaration-ordered candidate list).
        candidates.sort_by(|a, b| {
            let cost_a = a.cost_for(model).unwrap_or(f64::MAX);
            let cost_b = b.cost_for(model).unwrap_or(f64::MAX);
            cost_a
                .partial_cmp(&cost_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for provider in &candidates {
            let breaker = self.breakers.breaker(&provider.name);
            if breaker.check().is_ok() {
                debug!(
                    model,
                    provider = %provider.name,
                    cost = provider.cost_for(model).unwrap_or_default(),
                    "provider selected"
                );
                return Ok(Selected {
                    provider: Arc::clone(provider),
                    breaker,
                    recovered: false,
                });
            }
        }

        self.recover_oldest_failure(model, &candidates)
    }

    /// Favor availability over purity: when several providers are all
    /// open, give the one that failed longest ago another chance rather
    /// than rejecting the request. A lone open provider keeps its normal
    /// reset schedule, and providers already running a half-open trial
    /// are left alone.
    fn recover_oldest_failure(
        &self,
        model: &str,
        candidates: &[Arc<Provider>],
    ) -> Result<Selected, GatewayError> {
        let mut open: Vec<(Arc<Provider>, Arc<CircuitBreaker>)> = candidates
            .iter()
            .filter_map(|provider| {
                let breaker = self.breakers.breaker(&provider.name);
                if breaker.state() == CircuitState::Open {
                    Some((Arc::clone(provider), breaker))
                } else {
                    None
                }
            })
            .collect();

        match open.len() {
            0 => Err(GatewayError::no_available_provider(model)),
            1 => {
                // Lone open provider: fast-fail with its retry schedule
                let (provider, breaker) = open.remove(0);
                breaker.check().map(|()| Selected {
                    provider,
                    breaker,
                    recovered: false,
                })
            }
            _ => {
                open.sort_by_key(|(_, breaker)| breaker.last_failure());
                let (provider, breaker) = open.remove(0);
                info!(
                    model,
                    provider = %provider.name,
                    "all providers unavailable, recovering oldest-failure provider"
                );
                breaker.force_half_open();
                Ok(Selected {
                    provider,
                    breaker,
                    recovered: true,
                })
            }
        }
    }
}
