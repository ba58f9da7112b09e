//! HTTP-level tests for the OpenAI-compatible provider against a mock server.

use std::time::Duration;

use kkbot::models::{ChatMessage, ModelError, ModelProvider, OpenAICompatProvider, ProviderResponse};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer, key: &str) -> OpenAICompatProvider {
    OpenAICompatProvider::new(
        &format!("{}/v1", server.uri()),
        key.to_string(),
        "test-model".into(),
        512,
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn plain_reply_with_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "test-model", "max_tokens": 512})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "hello there"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (resp, usage) = provider(&server, "sk-test")
        .chat(&[ChatMessage::user("hi")], &[], &[])
        .await
        .unwrap();
    assert_eq!(resp, ProviderResponse::Final("hello there".into()));
    assert_eq!(usage.unwrap().total_tokens, 15);
}

#[tokio::test]
async fn tool_call_arguments_are_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"tool_choice": "auto"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "read_file", "arguments": "{\"path\":\"notes.md\"}"}
                }]
            }}]
        })))
        .mount(&server)
        .await;

    let tools = [json!({"type": "function", "function": {"name": "read_file"}})];
    let (resp, usage) = provider(&server, "")
        .chat(&[ChatMessage::user("read it")], &tools, &[])
        .await
        .unwrap();
    assert!(usage.is_none());
    let ProviderResponse::ToolCalls { content, calls } = resp else {
        panic!("expected tool calls");
    };
    assert!(content.is_empty());
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].name, "read_file");
    assert_eq!(calls[0].arguments, json!({"path": "notes.md"}));
}

#[tokio::test]
async fn error_status_keeps_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = provider(&server, "wrong")
        .chat(&[ChatMessage::user("hi")], &[], &[])
        .await
        .unwrap_err();
    match err {
        ModelError::Status { status, ref body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "invalid api key");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn non_json_body_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = provider(&server, "")
        .chat(&[ChatMessage::user("hi")], &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::Protocol { content: None, .. }), "{err}");
}
