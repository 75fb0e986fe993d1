//! Upstream dispatch.
//!
//! The [`ProviderDispatcher`] trait is the seam between the pipeline and
//! the network: the production implementation speaks HTTP through
//! `reqwest`, tests substitute a mock. Per the adapter contract each call
//! reports an outcome with elapsed latency and normalized usage; errors
//! carry the upstream status so the breaker can tell provider faults from
//! client errors.

use crate::{anthropic, openai};
use async_trait::async_trait;
use gateway_config::DispatchSettings;
use gateway_core::{
    Dispatched, EmbeddingInput, GatewayError, GatewayRequest, GatewayResponse, ProviderId, Usage,
};
use gateway_routing::Provider;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum upstream error body carried into the gateway error message
const ERROR_BODY_LIMIT: usize = 512;

/// Dispatch seam between the pipeline and upstream providers
#[async_trait]
pub trait ProviderDispatcher: Send + Sync {
    /// Dispatch one unified request to a provider
    async fn dispatch(
        &self,
        provider: &Provider,
        request: &GatewayRequest,
    ) -> Result<Dispatched, GatewayError>;

    /// Dispatch several embedding requests merged into one upstream call,
    /// returning one response per request in input order
    async fn dispatch_merged(
        &self,
        provider: &Provider,
        requests: &[GatewayRequest],
    ) -> Result<Vec<GatewayResponse>, GatewayError>;
}

/// HTTP dispatcher over `reqwest`
pub struct HttpDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDispatcher {
    /// Build a dispatcher with the configured per-call timeout
    ///
    /// # Errors
    /// Returns an internal error if the HTTP client cannot be constructed.
    pub fn new(settings: &DispatchSettings) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("http client: {e}")))?;

        Ok(Self {
            client,
            timeout: settings.timeout,
        })
    }

    fn endpoint(provider: &Provider, request: &GatewayRequest) -> Result<String, GatewayError> {
        let base = provider.base_url.trim_end_matches('/');
        match provider.wire_format.as_str() {
            "openai" => {
                let path = if request.is_embedding() {
                    openai::EMBEDDINGS_PATH
                } else {
                    openai::CHAT_PATH
                };
                Ok(format!("{base}{path}"))
            }
            "anthropic" if !request.is_embedding() => {
                Ok(format!("{base}{}", anthropic::MESSAGES_PATH))
            }
            "anthropic" => Err(GatewayError::provider(
                &provider.name,
                "anthropic wire format has no embeddings endpoint",
                None,
            )),
            other => Err(GatewayError::internal(format!(
                "unknown wire format '{other}' for provider {}",
                provider.name
            ))),
        }
    }

    fn body(provider: &Provider, request: &GatewayRequest) -> Result<serde_json::Value, GatewayError> {
        let value = if provider.wire_format == "anthropic" {
            serde_json::to_value(anthropic::messages_body(request))
        } else if request.is_embedding() {
            let inputs: Vec<&EmbeddingInput> = request.input.iter().collect();
            serde_json::to_value(openai::embedding_body(&request.model, &inputs))
        } else {
            serde_json::to_value(openai::chat_body(request))
        };
        value.map_err(|e| GatewayError::Serialization(e.to_string()))
    }

    fn credential(provider: &Provider) -> Option<String> {
        let env = provider.api_key_env.as_deref()?;
        match std::env::var(env) {
            Ok(key) => Some(format!("{}{key}", provider.auth_prefix)),
            Err(_) => {
                warn!(provider = %provider.name, env, "credential variable not set");
                None
            }
        }
    }

    async fn call(
        &self,
        provider: &Provider,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<(u16, Vec<u8>, Duration), GatewayError> {
        let mut builder = self.client.post(url).json(body);
        if let Some(credential) = Self::credential(provider) {
            builder = builder.header(provider.auth_header.as_str(), credential);
        }
        if provider.wire_format == "anthropic" {
            builder = builder.header("anthropic-version", "2023-06-01");
        }

        let started = Instant::now();
        let result = builder.send().await;
        let latency = started.elapsed();

        let response = result.map_err(|e| {
            if e.is_timeout() {
                GatewayError::timeout(self.timeout)
            } else {
                GatewayError::provider(&provider.name, format!("transport: {e}"), None)
            }
        })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::provider(&provider.name, format!("body read: {e}"), None))?;

        debug!(
            provider = %provider.name,
            status,
            latency_ms = latency.as_millis() as u64,
            "upstream call completed"
        );
        Ok((status, bytes.to_vec(), latency))
    }

    fn upstream_error(provider: &Provider, status: u16, body: &[u8]) -> GatewayError {
        let mut message = String::from_utf8_lossy(body).into_owned();
        message.truncate(ERROR_BODY_LIMIT);
        GatewayError::provider(&provider.name, message, Some(status))
    }
}

#[async_trait]
impl ProviderDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        provider: &Provider,
        request: &GatewayRequest,
    ) -> Result<Dispatched, GatewayError> {
        let url = Self::endpoint(provider, request)?;
        let body = Self::body(provider, request)?;
        let (status, bytes, latency) = self.call(provider, &url, &body).await?;

        if !(200..300).contains(&status) {
            return Err(Self::upstream_error(provider, status, &bytes));
        }

        let response = if provider.wire_format == "anthropic" {
            anthropic::parse_response(&provider.name, &bytes)?
        } else if request.is_embedding() {
            openai::parse_embedding_response(&provider.name, &bytes)?
        } else {
            openai::parse_chat_response(&provider.name, &bytes)?
        };

        Ok(Dispatched {
            provider: ProviderId::new(provider.name.clone()),
            response,
            status,
            latency,
        })
    }

    async fn dispatch_merged(
        &self,
        provider: &Provider,
        requests: &[GatewayRequest],
    ) -> Result<Vec<GatewayResponse>, GatewayError> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        if provider.wire_format != "openai" {
            return Err(GatewayError::provider(
                &provider.name,
                "merged dispatch requires the openai wire format",
                None,
            ));
        }

        let inputs: Vec<&EmbeddingInput> = requests.iter().filter_map(|r| r.input.as_ref()).collect();
        if inputs.len() != requests.len() {
            return Err(GatewayError::internal("merged dispatch with non-embedding member"));
        }

        let body = serde_json::to_value(openai::embedding_body(&first.model, &inputs))
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;
        let url = format!(
            "{}{}",
            provider.base_url.trim_end_matches('/'),
            openai::EMBEDDINGS_PATH
        );

        let (status, bytes, _latency) = self.call(provider, &url, &body).await?;
        if !(200..300).contains(&status) {
            return Err(Self::upstream_error(provider, status, &bytes));
        }

        let merged = openai::parse_embedding_response(&provider.name, &bytes)?;
        split_merged_response(provider, requests, &merged)
    }
}

/// Split a merged embedding response back into per-request responses by
/// input index, attributing usage proportionally to input counts.
///
/// # Errors
/// Returns a provider error when the vector count does not match the
/// combined input count.
pub fn split_merged_response(
    provider: &Provider,
    requests: &[GatewayRequest],
    merged: &GatewayResponse,
) -> Result<Vec<GatewayResponse>, GatewayError> {
    let vectors = merged.data.as_deref().unwrap_or_default();
    let counts: Vec<usize> = requests
        .iter()
        .map(|r| r.input.as_ref().map_or(0, EmbeddingInput::len))
        .collect();
    let expected: usize = counts.iter().sum();

    if vectors.len() != expected {
        return Err(GatewayError::provider(
            &provider.name,
            format!(
                "merged embedding arity mismatch: expected {expected}, got {}",
                vectors.len()
            ),
            None,
        ));
    }

    let mut responses = Vec::with_capacity(requests.len());
    let mut offset = 0usize;
    for (request, count) in requests.iter().zip(&counts) {
        let slice = &vectors[offset..offset + count];
        offset += count;

        let share = if expected == 0 {
            0
        } else {
            (u64::from(merged.usage.prompt_tokens) * *count as u64 / expected as u64) as u32
        };

        let mut response = GatewayResponse::embeddings(
            request.model.clone(),
            slice.iter().map(|d| d.embedding.clone()).collect(),
            Usage::new(share, 0),
        );
        response.provider = merged.provider.clone();
        responses.push(response);
    }

    Ok(responses)
}
