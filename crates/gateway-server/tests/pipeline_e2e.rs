//! End-to-end pipeline tests against the full router with a scripted
//! dispatcher standing in for upstream providers.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use gateway_config::{
    BatchSettings, BreakerSettings, GatewayConfig, ModelConfig, ProviderConfig, RateLimitSettings,
};
use gateway_core::{
    ChatMessage, Choice, Dispatched, GatewayError, GatewayRequest, GatewayResponse, MessageRole,
    ProviderId, Usage,
};
use gateway_providers::ProviderDispatcher;
use gateway_routing::Provider;
use gateway_server::{create_router, AppState};
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Scripted upstream: counts calls, fails on demand, and reports a
/// configurable token total.
struct ScriptedDispatcher {
    calls: AtomicUsize,
    merged_calls: AtomicUsize,
    fail: AtomicBool,
    prompt_tokens: AtomicU32,
    completion_tokens: AtomicU32,
}

impl ScriptedDispatcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            merged_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            prompt_tokens: AtomicU32::new(10),
            completion_tokens: AtomicU32::new(20),
        })
    }

    fn usage(&self) -> Usage {
        Usage::new(
            self.prompt_tokens.load(Ordering::SeqCst),
            self.completion_tokens.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl ProviderDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        provider: &Provider,
        request: &GatewayRequest,
    ) -> Result<Dispatched, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::provider(
                provider.name.clone(),
                "scripted upstream failure",
                Some(500),
            ));
        }
        Ok(Dispatched {
            provider: ProviderId::new(provider.name.clone()),
            response: chat_response(&request.model, &provider.name, self.usage()),
            status: 200,
            latency: Duration::from_millis(5),
        })
    }

    async fn dispatch_merged(
        &self,
        provider: &Provider,
        requests: &[GatewayRequest],
    ) -> Result<Vec<GatewayResponse>, GatewayError> {
        self.merged_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::provider(
                provider.name.clone(),
                "scripted upstream failure",
                Some(500),
            ));
        }
        Ok(requests
            .iter()
            .map(|r| {
                let mut response =
                    GatewayResponse::embeddings(r.model.clone(), vec![vec![0.1, 0.2]], self.usage());
                response.provider = Some(provider.name.clone());
                response
            })
            .collect())
    }
}

fn chat_response(model: &str, provider: &str, usage: Usage) -> GatewayResponse {
    GatewayResponse {
        id: "chatcmpl-test".to_string(),
        object: "chat.completion".to_string(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: MessageRole::Assistant,
                content: "pong".to_string(),
                name: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        data: None,
        usage,
        created: 1_700_000_000,
        provider: Some(provider.to_string()),
    }
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        providers: vec![ProviderConfig {
            name: "alpha".to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            auth_header: "authorization".to_string(),
            auth_prefix: "Bearer ".to_string(),
            api_key_env: None,
            wire_format: "openai".to_string(),
            models: vec![
                ModelConfig {
                    name: "test-model".to_string(),
                    cost_per_1k_tokens: 0.5,
                    embedding: false,
                    native_batching: false,
                },
                ModelConfig {
                    name: "test-embed".to_string(),
                    cost_per_1k_tokens: 0.1,
                    embedding: true,
                    native_batching: true,
                },
            ],
        }],
        breaker: BreakerSettings {
            error_threshold: 0.5,
            min_samples: 10,
            reset_timeout: Duration::from_millis(100),
        },
        batch: BatchSettings {
            enabled: true,
            window: Duration::from_millis(500),
            max_size: 2,
        },
        ..GatewayConfig::default()
    }
}

fn build_app(config: GatewayConfig, dispatcher: Arc<ScriptedDispatcher>) -> (Router, AppState) {
    let state = AppState::with_dispatcher(config, dispatcher).expect("state wires up");
    (create_router(state.clone()), state)
}

fn chat_body(content: &str) -> Body {
    Body::from(format!(
        r#"{{"model":"test-model","messages":[{{"role":"user","content":"{content}"}}]}}"#
    ))
}

fn chat_post(content: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(chat_body(content))
        .expect("request")
}

fn embedding_post(input: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/embeddings")
        .header("content-type", "application/json")
        .body(Body::from(format!(
            r#"{{"model":"test-embed","input":"{input}"}}"#
        )))
        .expect("request")
}

fn header<'a>(response: &'a axum::response::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_identical_request_served_from_cache() {
    let dispatcher = ScriptedDispatcher::new();
    let (app, state) = build_app(test_config(), dispatcher.clone());

    let first = app
        .clone()
        .oneshot(chat_post("hello"))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-cache-status"), Some("MISS"));
    let first_body = first.into_body().collect().await.expect("body").to_bytes();

    let second = app
        .clone()
        .oneshot(chat_post("hello"))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, "x-cache-status"), Some("HIT"));
    let second_body = second.into_body().collect().await.expect("body").to_bytes();

    assert_eq!(first_body, second_body);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

    // The hit never touched the breaker
    let stats = state.breakers.all_stats();
    assert_eq!(stats["alpha"].successes, 1);
    assert_eq!(stats["alpha"].failures, 0);
}

#[tokio::test]
async fn test_breaker_opens_then_admits_one_trial() {
    let dispatcher = ScriptedDispatcher::new();
    let (app, state) = build_app(test_config(), dispatcher.clone());
    dispatcher.fail.store(true, Ordering::SeqCst);

    // 11 distinct failing requests push the sample count past the minimum
    for i in 0..11 {
        let response = app
            .clone()
            .oneshot(chat_post(&format!("fail-{i}")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 11);
    assert_eq!(
        state.breakers.all_stats()["alpha"].state,
        gateway_resilience::CircuitState::Open
    );

    // While open, requests are rejected without reaching the upstream
    let rejected = app
        .clone()
        .oneshot(chat_post("while-open"))
        .await
        .expect("response");
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 11);

    // Past the reset timeout a single trial goes through and closes it
    tokio::time::sleep(Duration::from_millis(150)).await;
    dispatcher.fail.store(false, Ordering::SeqCst);

    let trial = app
        .clone()
        .oneshot(chat_post("trial"))
        .await
        .expect("response");
    assert_eq!(trial.status(), StatusCode::OK);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 12);
    assert_eq!(
        state.breakers.all_stats()["alpha"].state,
        gateway_resilience::CircuitState::Closed
    );
}

#[tokio::test]
async fn test_token_budget_denies_with_retry_after() {
    let mut config = test_config();
    config.rate_limit = RateLimitSettings {
        enabled: true,
        window: Duration::from_secs(60),
        max_requests: 100,
        max_tokens: 1000,
    };
    let dispatcher = ScriptedDispatcher::new();
    // 800 actual tokens per completion
    dispatcher.prompt_tokens.store(700, Ordering::SeqCst);
    dispatcher.completion_tokens.store(100, Ordering::SeqCst);
    let (app, _state) = build_app(config, dispatcher.clone());

    let first = app
        .clone()
        .oneshot(chat_post("first"))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-tokens-used"), Some("800"));
    assert_eq!(header(&first, "x-ratelimit-remaining-tokens"), Some("200"));

    // 800 consumed + 500 default estimate exceeds the 1000-token budget
    let second = app
        .clone()
        .oneshot(chat_post("second"))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = header(&second, "retry-after")
        .expect("retry-after header")
        .parse()
        .expect("integer seconds");
    assert!(retry_after >= 1);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

    // A different subject has its own window
    let other = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("x-api-key", "sk-other")
                .body(chat_body("second"))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_embedding_batch_flushes_at_max_size() {
    let dispatcher = ScriptedDispatcher::new();
    let (app, _state) = build_app(test_config(), dispatcher.clone());

    let (a, b) = tokio::join!(
        app.clone().oneshot(embedding_post("first input")),
        app.clone().oneshot(embedding_post("second input")),
    );
    let a = a.expect("response");
    let b = b.expect("response");

    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(dispatcher.merged_calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_embeddings_requires_input() {
    let dispatcher = ScriptedDispatcher::new();
    let (app, _state) = build_app(test_config(), dispatcher);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/embeddings")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"test-embed","messages":[]}"#))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_response_metadata_headers() {
    let dispatcher = ScriptedDispatcher::new();
    let (app, _state) = build_app(test_config(), dispatcher);

    let response = app
        .oneshot(chat_post("headers"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-provider"), Some("alpha"));
    assert_eq!(header(&response, "x-model"), Some("test-model"));
    assert_eq!(header(&response, "x-cache-status"), Some("MISS"));
    assert_eq!(header(&response, "x-tokens-used"), Some("30"));
    // 30 tokens at $0.5 per 1k
    assert_eq!(header(&response, "x-estimated-cost"), Some("0.015000"));
    assert!(header(&response, "x-response-time-ms").is_some());
    assert!(header(&response, "x-request-id").is_some());
    assert!(header(&response, "x-ratelimit-remaining-requests").is_some());
}

#[tokio::test]
async fn test_streaming_request_bypasses_cache() {
    let dispatcher = ScriptedDispatcher::new();
    let (app, _state) = build_app(test_config(), dispatcher.clone());

    let post = || {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"model":"test-model","messages":[{"role":"user","content":"stream"}],"stream":true}"#,
            ))
            .expect("request")
    };

    let first = app.clone().oneshot(post()).await.expect("response");
    let second = app.clone().oneshot(post()).await.expect("response");

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    // Both went upstream
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
}
