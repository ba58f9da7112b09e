//! Tests for ProviderManager retry and fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kkbot::models::{
    ChatMessage, ModelError, ModelProvider, ProviderManager, ProviderResponse, TokenUsage,
};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Mock providers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Failure {
    Server,
    Unauthorized,
    Malformed,
}

impl Failure {
    fn error(self) -> ModelError {
        match self {
            Failure::Server => ModelError::Status {
                status: 503,
                body: "overloaded".into(),
            },
            Failure::Unauthorized => ModelError::Status {
                status: 401,
                body: "bad key".into(),
            },
            Failure::Malformed => ModelError::Protocol {
                reason: "no choices".into(),
                content: None,
            },
        }
    }
}

/// Fails `fail_count` times with `failure`, then replies with `reply`.
struct FlakyProvider {
    fail_count: usize,
    failure: Failure,
    calls: Arc<AtomicUsize>,
    reply: String,
}

impl FlakyProvider {
    fn boxed(
        fail_count: usize,
        failure: Failure,
        reply: &str,
    ) -> (Box<dyn ModelProvider>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Self {
            fail_count,
            failure,
            calls: calls.clone(),
            reply: reply.to_string(),
        };
        (Box::new(provider), calls)
    }
}

#[async_trait]
impl ModelProvider for FlakyProvider {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[Value],
        _cache_points: &[usize],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), ModelError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            Err(self.failure.error())
        } else {
            Ok((ProviderResponse::Final(self.reply.clone()), None))
        }
    }
}

async fn ask(manager: &ProviderManager) -> Result<ProviderResponse, ModelError> {
    manager
        .chat(&[ChatMessage::user("hi")], &[], &[])
        .await
        .map(|(resp, _)| resp)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_are_retried() {
    let (provider, calls) = FlakyProvider::boxed(2, Failure::Server, "recovered");
    let manager = ProviderManager::new(vec![provider], 3);

    let resp = ask(&manager).await.unwrap();
    assert_eq!(resp, ProviderResponse::Final("recovered".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_provider_falls_back_to_next() {
    let (first, first_calls) = FlakyProvider::boxed(usize::MAX, Failure::Server, "never");
    let (second, second_calls) = FlakyProvider::boxed(0, Failure::Server, "backup");
    let manager = ProviderManager::new(vec![first, second], 2);

    let resp = ask(&manager).await.unwrap();
    assert_eq!(resp, ProviderResponse::Final("backup".into()));
    assert_eq!(first_calls.load(Ordering::SeqCst), 2);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permanent_status_skips_retries() {
    let (first, first_calls) = FlakyProvider::boxed(usize::MAX, Failure::Unauthorized, "never");
    let (second, second_calls) = FlakyProvider::boxed(0, Failure::Server, "backup");
    let manager = ProviderManager::new(vec![first, second], 3);

    let resp = ask(&manager).await.unwrap();
    assert_eq!(resp, ProviderResponse::Final("backup".into()));
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_reply_is_returned_without_fallback() {
    let (first, first_calls) = FlakyProvider::boxed(usize::MAX, Failure::Malformed, "never");
    let (second, second_calls) = FlakyProvider::boxed(0, Failure::Server, "backup");
    let manager = ProviderManager::new(vec![first, second], 3);

    let err = ask(&manager).await.unwrap_err();
    assert!(matches!(err, ModelError::Protocol { .. }), "{err}");
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn last_error_surfaces_when_every_provider_fails() {
    let (first, _) = FlakyProvider::boxed(usize::MAX, Failure::Server, "never");
    let (second, _) = FlakyProvider::boxed(usize::MAX, Failure::Unauthorized, "never");
    let manager = ProviderManager::new(vec![first, second], 1);

    match ask(&manager).await.unwrap_err() {
        ModelError::Status { status, .. } => assert_eq!(status, 401),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn empty_manager_reports_no_providers() {
    let manager = ProviderManager::new(Vec::new(), 3);
    assert_eq!(manager.provider_count(), 0);
    let err = ask(&manager).await.unwrap_err();
    assert!(err.to_string().contains("no providers configured"));
}
