//! Response types and the dispatch outcome contract.

use crate::types::ProviderId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unified gateway response covering chat completions and embeddings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Response identifier
    pub id: String,

    /// Object type ("chat.completion" or "list")
    pub object: String,

    /// Model that produced the response
    pub model: String,

    /// Completion choices (chat responses)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,

    /// Embedding vectors (embedding responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<EmbeddingData>>,

    /// Token usage reported by the provider
    pub usage: Usage,

    /// Creation timestamp (Unix seconds)
    pub created: i64,

    /// Provider that served the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl GatewayResponse {
    /// Build an embedding response from ordered vectors
    #[must_use]
    pub fn embeddings(model: impl Into<String>, vectors: Vec<Vec<f32>>, usage: Usage) -> Self {
        let data = vectors
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| EmbeddingData { index, embedding })
            .collect();

        Self {
            id: format!("emb-{}", uuid::Uuid::new_v4()),
            object: "list".to_string(),
            model: model.into(),
            choices: Vec::new(),
            data: Some(data),
            usage,
            created: chrono::Utc::now().timestamp(),
            provider: None,
        }
    }
}

/// A single completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Choice index
    pub index: u32,
    /// Generated message
    pub message: crate::request::ChatMessage,
    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// A single embedding vector with its input index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    /// Index of the corresponding input
    pub index: usize,
    /// The embedding vector
    pub embedding: Vec<f32>,
}

/// Normalized token usage reported by provider adapters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens consumed
    pub prompt_tokens: u32,
    /// Completion tokens generated
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

impl Usage {
    /// Create a usage record; total is derived when the provider omits it
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Outcome of a live provider dispatch, per the adapter contract:
/// the adapter reports success/failure, elapsed latency and (on success)
/// normalized token usage.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Provider that handled the call
    pub provider: ProviderId,
    /// Transformed unified response
    pub response: GatewayResponse,
    /// HTTP status returned by the provider
    pub status: u16,
    /// Elapsed wall-clock latency of the upstream call
    pub latency: Duration,
}
