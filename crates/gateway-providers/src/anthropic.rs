//! Anthropic messages wire format.
//!
//! Differences from the OpenAI shape: system messages travel in a top-level
//! `system` field rather than the message list, `max_tokens` is mandatory,
//! and usage is reported as `input_tokens`/`output_tokens`.

use gateway_core::{
    ChatMessage, Choice, GatewayError, GatewayRequest, GatewayResponse, MessageRole, Usage,
};
use serde::{Deserialize, Serialize};

/// Default completion budget when the caller sets none; the API rejects
/// requests without `max_tokens`
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// API path for messages
pub const MESSAGES_PATH: &str = "/v1/messages";

/// Messages request body
#[derive(Debug, Serialize)]
pub struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Build a messages body from a unified request.
///
/// System messages are concatenated into the top-level `system` field;
/// the remaining conversation keeps its order.
#[must_use]
pub fn messages_body(request: &GatewayRequest) -> AnthropicRequest {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();

    AnthropicRequest {
        model: request.model.clone(),
        messages: request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| AnthropicMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system.is_empty() {
            None
        } else {
            Some(system.join("\n"))
        },
        temperature: request.temperature,
        top_p: request.top_p,
    }
}

/// Parse a messages response into the unified chat shape
///
/// # Errors
/// Returns a provider error when the body does not parse.
pub fn parse_response(provider: &str, body: &[u8]) -> Result<GatewayResponse, GatewayError> {
    let parsed: AnthropicResponse = serde_json::from_slice(body).map_err(|e| {
        GatewayError::provider(provider, format!("unparseable messages response: {e}"), None)
    })?;

    let text = parsed
        .content
        .iter()
        .filter(|c| c.kind == "text")
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("");

    let usage = parsed.usage.unwrap_or_default();

    Ok(GatewayResponse {
        id: parsed.id,
        object: "chat.completion".to_string(),
        model: parsed.model,
        choices: vec![Choice {
            index: 0,
            message: ChatMessage::assistant(text),
            finish_reason: parsed.stop_reason.map(|r| normalize_stop_reason(&r)),
        }],
        data: None,
        usage: Usage::new(usage.input_tokens, usage.output_tokens),
        created: chrono::Utc::now().timestamp(),
        provider: Some(provider.to_string()),
    })
}

fn normalize_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_messages_lifted_out() {
        let request = GatewayRequest::builder()
            .model("claude-3-haiku")
            .message(ChatMessage::system("be brief"))
            .message(ChatMessage::user("hi"))
            .build()
            .expect("valid request");

        let body = serde_json::to_value(messages_body(&request)).expect("json");
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().expect("array").len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        // Mandatory field defaults when unset
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_parse_response_maps_usage_and_stop_reason() {
        let body = serde_json::json!({
            "id": "msg-1",
            "model": "claude-3-haiku",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 8, "output_tokens": 2}
        });

        let response = parse_response("anthropic", body.to_string().as_bytes()).expect("parsed");
        assert_eq!(response.choices[0].message.content, "hello");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.prompt_tokens, 8);
        assert_eq!(response.usage.total_tokens, 10);
    }

    #[test]
    fn test_parse_concatenates_text_blocks() {
        let body = serde_json::json!({
            "id": "msg-2",
            "model": "claude-3-haiku",
            "content": [
                {"type": "text", "text": "a"},
                {"type": "tool_use", "text": ""},
                {"type": "text", "text": "b"}
            ]
        });

        let response = parse_response("anthropic", body.to_string().as_bytes()).expect("parsed");
        assert_eq!(response.choices[0].message.content, "ab");
    }
}
