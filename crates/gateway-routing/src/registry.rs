//! Provider catalog.
//!
//! Built once from configuration at startup and read-only afterwards.
//! Declaration order is preserved because it breaks cost ties during
//! selection.

use gateway_config::ProviderConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-model attributes a provider declares
#[derive(Debug, Clone, Copy)]
pub struct ModelEntry {
    /// Unit cost in USD per 1000 tokens
    pub cost_per_1k_tokens: f64,
    /// Whether the model serves embedding requests
    pub embedding: bool,
    /// Whether the provider accepts multiple inputs in one upstream call
    pub native_batching: bool,
}

/// An upstream provider, immutable after load
#[derive(Debug)]
pub struct Provider {
    /// Unique provider name
    pub name: String,
    /// Base endpoint URL
    pub base_url: String,
    /// Header carrying the credential
    pub auth_header: String,
    /// Credential value prefix, e.g. "Bearer "
    pub auth_prefix: String,
    /// Environment variable holding the credential
    pub api_key_env: Option<String>,
    /// Wire format spoken by the provider ("openai" or "anthropic")
    pub wire_format: String,
    /// Position in the configuration file, used for tie-breaking
    pub order: usize,
    models: HashMap<String, ModelEntry>,
}

impl Provider {
    /// Whether this provider serves the given model
    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    /// Model attributes, if served
    #[must_use]
    pub fn model(&self, model: &str) -> Option<&ModelEntry> {
        self.models.get(model)
    }

    /// Unit cost for a model, if served
    #[must_use]
    pub fn cost_for(&self, model: &str) -> Option<f64> {
        self.models.get(model).map(|m| m.cost_per_1k_tokens)
    }

    /// Whether merged batch dispatch is available for a model
    #[must_use]
    pub fn supports_native_batching(&self, model: &str) -> bool {
        self.models.get(model).is_some_and(|m| m.native_batching)
    }

    /// Names of all models this provider serves
    #[must_use]
    pub fn model_names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    /// Estimated cost in USD for a number of tokens against a model
    #[must_use]
    pub fn estimated_cost(&self, model: &str, total_tokens: u32) -> Option<f64> {
        self.cost_for(model)
            .map(|unit| unit * f64::from(total_tokens) / 1000.0)
    }
}

/// One row of the `/v1/models` listing
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    /// Model name
    pub id: String,
    /// Object type, always "model"
    pub object: &'static str,
    /// Providers serving the model, in declaration order
    pub providers: Vec<String>,
    /// Cheapest configured unit cost across providers
    pub cost_per_1k_tokens: f64,
    /// Whether the model serves embeddings
    pub embedding: bool,
}

/// Immutable catalog of configured providers
pub struct ProviderRegistry {
    providers: Vec<Arc<Provider>>,
    by_name: HashMap<String, usize>,
}

impl ProviderRegistry {
    /// Build the registry from configuration, preserving declaration order
    #[must_use]
    pub fn from_config(configs: &[ProviderConfig]) -> Self {
        let providers: Vec<Arc<Provider>> = configs
            .iter()
            .enumerate()
            .map(|(order, config)| {
                let models = config
                    .models
                    .iter()
                    .map(|m| {
                        (
                            m.name.clone(),
                            ModelEntry {
                                cost_per_1k_tokens: m.cost_per_1k_tokens,
                                embedding: m.embedding,
                                native_batching: m.native_batching,
                            },
                        )
                    })
                    .collect();

                Arc::new(Provider {
                    name: config.name.clone(),
                    base_url: config.base_url.clone(),
                    auth_header: config.auth_header.clone(),
                    auth_prefix: config.auth_prefix.clone(),
                    api_key_env: config.api_key_env.clone(),
                    wire_format: config.wire_format.clone(),
                    order,
                    models,
                })
            })
            .collect();

        let by_name = providers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();

        Self { providers, by_name }
    }

    /// Look up a provider by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.by_name
            .get(name)
            .map(|&i| Arc::clone(&self.providers[i]))
    }

    /// All providers in declaration order
    #[must_use]
    pub fn all(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    /// Providers serving a model, in declaration order
    #[must_use]
    pub fn providers_for(&self, model: &str) -> Vec<Arc<Provider>> {
        self.providers
            .iter()
            .filter(|p| p.serves(model))
            .cloned()
            .collect()
    }

    /// Whether any provider serves the model
    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.providers.iter().any(|p| p.serves(model))
    }

    /// Whether the model serves embedding requests (any provider's view)
    #[must_use]
    pub fn is_embedding_model(&self, model: &str) -> bool {
        self.providers
            .iter()
            .filter_map(|p| p.model(model))
            .any(|m| m.embedding)
    }

    /// Whether any provider offers merged batch dispatch for the model
    #[must_use]
    pub fn supports_native_batching(&self, model: &str) -> bool {
        self.providers
            .iter()
            .any(|p| p.supports_native_batching(model))
    }

    /// Distinct models across all providers, sorted by name
    #[must_use]
    pub fn list_models(&self) -> Vec<ModelListing> {
        let mut by_model: HashMap<&str, ModelListing> = HashMap::new();

        for provider in &self.providers {
            for (name, entry) in &provider.models {
                by_model
                    .entry(name.as_str())
                    .and_modify(|listing| {
                        listing.providers.push(provider.name.clone());
                        if entry.cost_per_1k_tokens < listing.cost_per_1k_tokens {
                            listing.cost_per_1k_tokens = entry.cost_per_1k_tokens;
                        }
                        listing.embedding |= entry.embedding;
                    })
                    .or_insert_with(|| ModelListing {
                        id: name.clone(),
                        object: "model",
                        providers: vec![provider.name.clone()],
                        cost_per_1k_tokens: entry.cost_per_1k_tokens,
                        embedding: entry.embedding,
                    });
            }
        }

        let mut listings: Vec<ModelListing> = by_model.into_values().collect();
        listings.sort_by(|a, b| a.id.cmp(&b.id));
        listings
    }
}
