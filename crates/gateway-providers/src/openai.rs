//! OpenAI-compatible wire format.
//!
//! Covers OpenAI itself plus the many providers that mirror its API
//! (Azure OpenAI behind a deployment URL, vLLM, Together, local runtimes).

use gateway_core::{
    ChatMessage, Choice, EmbeddingInput, GatewayError, GatewayRequest, GatewayResponse,
    MessageRole, Usage,
};
use serde::{Deserialize, Serialize};

/// Chat completion request body
#[derive(Debug, Serialize)]
pub struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

/// Embeddings request body
#[derive(Debug, Serialize)]
pub struct OpenAiEmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    id: String,
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    created: i64,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    index: u32,
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    model: String,
    data: Vec<OpenAiEmbeddingData>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<OpenAiUsage> for Usage {
    fn from(usage: OpenAiUsage) -> Self {
        let total = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        };
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: total,
        }
    }
}

/// API path for chat completions
pub const CHAT_PATH: &str = "/v1/chat/completions";
/// API path for embeddings
pub const EMBEDDINGS_PATH: &str = "/v1/embeddings";

/// Build a chat completion body from a unified request
#[must_use]
pub fn chat_body(request: &GatewayRequest) -> OpenAiChatRequest {
    OpenAiChatRequest {
        model: request.model.clone(),
        messages: request
            .messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        user: request.user.clone(),
    }
}

/// Build an embeddings body; multiple requests merge their inputs in order
#[must_use]
pub fn embedding_body(model: &str, inputs: &[&EmbeddingInput]) -> OpenAiEmbeddingRequest {
    OpenAiEmbeddingRequest {
        model: model.to_string(),
        input: inputs
            .iter()
            .flat_map(|input| input.as_texts())
            .map(str::to_string)
            .collect(),
    }
}

/// Parse a chat completion response into the unified shape
///
/// # Errors
/// Returns a provider error when the body does not parse.
pub fn parse_chat_response(provider: &str, body: &[u8]) -> Result<GatewayResponse, GatewayError> {
    let parsed: OpenAiChatResponse = serde_json::from_slice(body).map_err(|e| {
        GatewayError::provider(provider, format!("unparseable chat response: {e}"), None)
    })?;

    Ok(GatewayResponse {
        id: parsed.id,
        object: "chat.completion".to_string(),
        model: parsed.model,
        choices: parsed
            .choices
            .into_iter()
            .map(|c| Choice {
                index: c.index,
                message: ChatMessage {
                    role: parse_role(&c.message.role),
                    content: c.message.content,
                    name: None,
                },
                finish_reason: c.finish_reason,
            })
            .collect(),
        data: None,
        usage: parsed.usage.unwrap_or_default().into(),
        created: parsed.created,
        provider: Some(provider.to_string()),
    })
}

/// Parse an embeddings response, preserving input order by index
///
/// # Errors
/// Returns a provider error when the body does not parse.
pub fn parse_embedding_response(
    provider: &str,
    body: &[u8],
) -> Result<GatewayResponse, GatewayError> {
    let parsed: OpenAiEmbeddingResponse = serde_json::from_slice(body).map_err(|e| {
        GatewayError::provider(provider, format!("unparseable embedding response: {e}"), None)
    })?;

    let mut data = parsed.data;
    data.sort_by_key(|d| d.index);

    let mut response = GatewayResponse::embeddings(
        parsed.model,
        data.into_iter().map(|d| d.embedding).collect(),
        parsed.usage.unwrap_or_default().into(),
    );
    response.provider = Some(provider.to_string());
    Ok(response)
}

fn parse_role(role: &str) -> MessageRole {
    match role {
        "system" => MessageRole::System,
        "user" => MessageRole::User,
        _ => MessageRole::Assistant,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request() -> GatewayRequest {
        GatewayRequest::builder()
            .model("gpt-3.5-turbo")
            .message(ChatMessage::system("be brief"))
            .message(ChatMessage::user("hi"))
            .temperature(0.7)
            .max_tokens(64)
            .build()
            .expect("valid request")
    }

    #[test]
    fn test_chat_body_shape() {
        let body = serde_json::to_value(chat_body(&chat_request())).expect("json");

        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_tokens"], 64);
        // Unset parameters are omitted entirely
        assert!(body.get("top_p").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_embedding_body_merges_inputs_in_order() {
        let a = EmbeddingInput::Single("first".to_string());
        let b = EmbeddingInput::Batch(vec!["second".to_string(), "third".to_string()]);
        let body = serde_json::to_value(embedding_body("text-embedding-ada-002", &[&a, &b]))
            .expect("json");

        assert_eq!(body["input"][0], "first");
        assert_eq!(body["input"][1], "second");
        assert_eq!(body["input"][2], "third");
    }

    #[test]
    fn test_parse_chat_response() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-3.5-turbo",
            "created": 1_700_000_000,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        });

        let response =
            parse_chat_response("openai", body.to_string().as_bytes()).expect("parsed");
        assert_eq!(response.choices[0].message.content, "hello");
        assert_eq!(response.usage.total_tokens, 12);
        assert_eq!(response.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn test_parse_chat_response_derives_missing_total() {
        let body = serde_json::json!({
            "id": "chatcmpl-2",
            "model": "gpt-3.5-turbo",
            "created": 1_700_000_000,
            "choices": [],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7}
        });

        let response =
            parse_chat_response("openai", body.to_string().as_bytes()).expect("parsed");
        assert_eq!(response.usage.total_tokens, 12);
    }

    #[test]
    fn test_parse_embedding_response_orders_by_index() {
        let body = serde_json::json!({
            "model": "text-embedding-ada-002",
            "data": [
                {"index": 1, "embedding": [0.2]},
                {"index": 0, "embedding": [0.1]}
            ],
            "usage": {"prompt_tokens": 4, "total_tokens": 4}
        });

        let response =
            parse_embedding_response("openai", body.to_string().as_bytes()).expect("parsed");
        let data = response.data.expect("embeddings");
        assert_eq!(data[0].embedding, vec![0.1]);
        assert_eq!(data[1].embedding, vec![0.2]);
    }

    #[test]
    fn test_parse_garbage_is_provider_error() {
        let err = parse_chat_response("openai", b"not json").unwrap_err();
        assert!(matches!(err, GatewayError::Provider { .. }));
    }
}
