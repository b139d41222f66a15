use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opsense_rag::gateway::openrouter::{OpenRouterAdapter, ProviderBackend};
use opsense_rag::gateway::{
    Attribution, CapabilityProvider, ChatModel, ChatRequest, ContentPart, EmbedModel,
    EmbedRequest, FinishReason, GatewayConfig, Message, NoopUsageSink, ProviderError,
    ProviderGateway, RateLimitSource,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn chat_req() -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter("google/gemini-2.5-flash"),
        vec![Message::user("hi")],
        Attribution::new("test").with_tenant("acme"),
    )
}

#[tokio::test]
async fn openrouter_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "hello" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&chat_req()).await.unwrap();
    assert_eq!(resp.content, "hello");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
}

#[tokio::test]
async fn openrouter_falls_back_to_tool_call_arguments_when_content_empty() {
    let server = MockServer::start().await;
    let args = r#"{"answer": "x"}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"arguments": args}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&chat_req().json()).await.unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn openrouter_detects_refusal_from_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot comply with that request." },
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&chat_req()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
}

#[tokio::test]
async fn openrouter_classifies_http_429_as_remote_rate_limit_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&chat_req()).await.unwrap_err();
    match err {
        ProviderError::RateLimited {
            retry_after,
            limit_source,
            context,
        } => {
            assert_eq!(limit_source, RateLimitSource::Remote);
            assert_eq!(retry_after, Duration::from_secs(7));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn openrouter_sends_images_as_data_urls() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "a diagram" }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let req = ChatRequest::new(
        ChatModel::openrouter("google/gemini-2.5-flash"),
        vec![Message::user_with_parts(
            "What does this show?",
            vec![ContentPart::Image {
                mime_type: "image/png".into(),
                data: vec![0xde, 0xad],
            }],
        )],
        Attribution::new("test"),
    );
    adapter(&server).chat(&req).await.unwrap();

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let parts = body["messages"][0]["content"].as_array().unwrap();
    assert_eq!(parts[0]["text"], "What does this show?");
    assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,3q0=");
}

#[tokio::test]
async fn openrouter_embeddings_are_reordered_by_index() {
    let server = MockServer::start().await;
    let dims = EmbedModel::OpenAI3Small.dimensions();

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 1, "embedding": vec![2.0_f32; dims] },
                { "index": 0, "embedding": vec![1.0_f32; dims] }
            ],
            "usage": { "prompt_tokens": 4 }
        })))
        .mount(&server)
        .await;

    let req = EmbedRequest::new(
        EmbedModel::OpenAI3Small,
        vec!["first".into(), "second".into()],
        Attribution::new("test"),
    );
    let resp = adapter(&server).embed(&req).await.unwrap();
    assert_eq!(resp.embeddings.len(), 2);
    assert_eq!(resp.embeddings[0][0], 1.0);
    assert_eq!(resp.embeddings[1][0], 2.0);
    assert_eq!(resp.tokens, 4);

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["model"], "openai/text-embedding-3-small");
}

#[tokio::test]
async fn openrouter_rejects_wrong_embedding_dimensions() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "index": 0, "embedding": [0.1, 0.2] }]
        })))
        .mount(&server)
        .await;

    let req = EmbedRequest::single(EmbedModel::OpenAI3Small, "q", Attribution::new("test"));
    let err = adapter(&server).embed(&req).await.unwrap_err();
    assert!(err.to_string().contains("dimension mismatch"));
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

fn fast_gateway(server: &MockServer) -> ProviderGateway<NoopUsageSink> {
    ProviderGateway::with_config(
        adapter(server),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
        },
    )
}

#[tokio::test]
async fn provider_gateway_retries_on_retryable_errors_and_succeeds() {
    let server = MockServer::start().await;

    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));
    let second = ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": "ok" },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    }));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first,
            second,
        })
        .mount(&server)
        .await;

    let resp = fast_gateway(&server).chat(chat_req()).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn provider_gateway_leaves_rate_limits_to_the_caller() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let gateway: Arc<dyn CapabilityProvider> = Arc::new(fast_gateway(&server));
    let err = gateway.chat(chat_req()).await.unwrap_err();
    assert!(err.is_rate_limited());

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}
