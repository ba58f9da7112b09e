//! Model provider abstractions.
//!
//! Defines the [`ModelProvider`] trait, the [`ChatMessage`] type,
//! [`ProviderManager`] for retry/fallback semantics, and the
//! OpenAI-compatible HTTP implementation ([`OpenAICompatProvider`]).

pub mod openai_compat;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

pub use openai_compat::OpenAICompatProvider;

// ---------------------------------------------------------------------------
// ChatMessage – shared message representation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Decoded argument payload. Arguments that were not valid JSON are
    /// kept verbatim as a string value.
    pub arguments: Value,
}

/// A single chat message.
///
/// Assistant messages that invoke tools carry `tool_calls`; tool-role
/// messages carry the `tool_call_id` they answer. The same shape is
/// written to the session JSONL files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Inline images (`data:` URLs) sent alongside a user message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ChatMessage {
    /// Plain message with no tool metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            images: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message that requests `calls`.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(calls),
            tool_call_id: None,
            images: Vec::new(),
        }
    }

    /// Tool-role reply to the call with id `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            images: Vec::new(),
        }
    }

    /// Attach images; they are sent as `image_url` content parts.
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Tool calls carried by this message (empty for most messages).
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

/// Serialise messages into the OpenAI chat completions array.
///
/// Indices listed in `cache_points` are sent in list form with an
/// ephemeral `cache_control` marker.
pub fn serialize_messages(messages: &[ChatMessage], cache_points: &[usize]) -> Vec<Value> {
    messages
        .iter()
        .enumerate()
        .map(|(idx, m)| {
            let mut msg = json!({ "role": m.role.as_str() });
            if let Some(calls) = m.tool_calls.as_ref().filter(|c| !c.is_empty()) {
                msg["tool_calls"] = Value::Array(calls.iter().map(tool_call_to_wire).collect());
                // OpenAI expects content to be null on assistant messages
                // that carry tool_calls and no text.
                msg["content"] = if m.content.is_empty() {
                    Value::Null
                } else {
                    json!(m.content)
                };
            } else if !m.images.is_empty() {
                let mut parts = Vec::with_capacity(m.images.len() + 1);
                if !m.content.is_empty() {
                    parts.push(json!({ "type": "text", "text": m.content }));
                }
                parts.extend(
                    m.images
                        .iter()
                        .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
                );
                msg["content"] = Value::Array(parts);
            } else if cache_points.contains(&idx) {
                msg["content"] = json!([{
                    "type": "text",
                    "text": m.content,
                    "cache_control": { "type": "ephemeral" },
                }]);
            } else {
                msg["content"] = json!(m.content);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn tool_call_to_wire(call: &ToolCall) -> Value {
    let arguments = match &call.arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    json!({
        "id": call.id,
        "type": "function",
        "function": { "name": call.name, "arguments": arguments },
    })
}

// ---------------------------------------------------------------------------
// ProviderResponse – function-calling aware response
// ---------------------------------------------------------------------------

/// Token usage statistics returned by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Extract token usage statistics from a chat completion response.
pub fn parse_token_usage(json: &Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}

/// Response from a model: a final text reply or a batch of tool calls.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    Final(String),
    ToolCalls {
        /// Text the model sent alongside the calls (often empty).
        content: String,
        calls: Vec<ToolCall>,
    },
}

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ModelError {
    /// The endpoint answered with a non-success status.
    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },
    /// Connection, TLS or timeout failure.
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response could not be interpreted. `content` holds any
    /// assistant text that was recoverable.
    #[error("malformed model response: {reason}")]
    Protocol {
        reason: String,
        content: Option<String>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModelError {
    /// Auth failures, bad requests and unknown models are not retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            ModelError::Status { status, .. } => {
                matches!(status, 400 | 401 | 403 | 404 | 422)
            }
            ModelError::Protocol { .. } => true,
            ModelError::Transport(_) | ModelError::Other(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelProvider trait
// ---------------------------------------------------------------------------

/// Trait implemented by every LLM backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send `messages` with the given tool definitions.
    ///
    /// `cache_points` lists message indices that mark the end of a
    /// cacheable prefix; providers without prompt caching ignore it.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        cache_points: &[usize],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), ModelError>;
}

// ---------------------------------------------------------------------------
// ProviderManager
// ---------------------------------------------------------------------------

/// Ordered list of providers with per-provider retry and automatic
/// fallback to the next provider on exhaustion.
///
/// Implements [`ModelProvider`] itself so it can be used anywhere a
/// single provider is expected.
pub struct ProviderManager {
    providers: Vec<Box<dyn ModelProvider>>,
    max_retries: usize,
}

impl ProviderManager {
    /// * `providers` – ordered list (first = preferred).
    /// * `max_retries` – attempts per provider (clamped to ≥ 1).
    pub fn new(providers: Vec<Box<dyn ModelProvider>>, max_retries: usize) -> Self {
        Self {
            providers,
            max_retries: max_retries.max(1),
        }
    }

    /// Manager over the single provider described by `cfg`.
    pub fn from_config(cfg: &crate::config::LlmConfig) -> anyhow::Result<Self> {
        let provider = OpenAICompatProvider::from_config(cfg)?;
        Ok(Self::new(vec![Box::new(provider)], cfg.max_retries))
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

/// Longest pause between two attempts on the same provider.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// `100 ms × 2^attempt`, capped at [`MAX_BACKOFF`].
fn backoff_delay(attempt: usize) -> Duration {
    let factor = u32::try_from(attempt)
        .ok()
        .and_then(|a| 2u64.checked_pow(a))
        .unwrap_or(u64::MAX);
    Duration::from_millis(100u64.saturating_mul(factor)).min(MAX_BACKOFF)
}

#[async_trait]
impl ModelProvider for ProviderManager {
    /// For each provider in order, retries up to `max_retries` times with
    /// exponential backoff (100 ms × 2^attempt), then falls through to
    /// the next provider. Permanent errors skip the remaining attempts.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        cache_points: &[usize],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), ModelError> {
        let mut last_err = ModelError::Other(anyhow::anyhow!("no providers configured"));

        for (idx, provider) in self.providers.iter().enumerate() {
            for attempt in 0..self.max_retries {
                match provider.chat(messages, tools, cache_points).await {
                    Ok(ok) => return Ok(ok),
                    Err(e) => {
                        let permanent = e.is_permanent();
                        warn!(
                            provider_idx = idx,
                            attempt = attempt + 1,
                            max_attempts = self.max_retries,
                            permanent,
                            error = %e,
                            "provider call failed"
                        );
                        last_err = e;
                        if permanent {
                            break;
                        }
                        if attempt + 1 < self.max_retries {
                            tokio::time::sleep(backoff_delay(attempt)).await;
                        }
                    }
                }
            }
            // A malformed reply is not the provider being down.
            if matches!(last_err, ModelError::Protocol { .. }) {
                return Err(last_err);
            }
            warn!(provider_idx = idx, "all retries exhausted, trying next provider");
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_message_serialises_null_content() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "read_file".into(),
            arguments: json!({ "path": "a.txt" }),
        };
        let wire = serialize_messages(&[ChatMessage::assistant_with_calls("", vec![call])], &[]);
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(
            wire[0]["tool_calls"][0]["function"]["arguments"],
            r#"{"path":"a.txt"}"#
        );
    }

    #[test]
    fn raw_string_arguments_pass_through() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "shell".into(),
            arguments: Value::String("{not json".into()),
        };
        let wire = serialize_messages(&[ChatMessage::assistant_with_calls("", vec![call])], &[]);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], "{not json");
    }

    #[test]
    fn cache_points_use_list_form() {
        let msgs = [ChatMessage::system("base"), ChatMessage::user("hi")];
        let wire = serialize_messages(&msgs, &[0]);
        assert_eq!(wire[0]["content"][0]["text"], "base");
        assert_eq!(wire[0]["content"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(wire[1]["content"], "hi");
    }

    #[test]
    fn images_become_content_parts() {
        let msg = ChatMessage::user("what is this?")
            .with_images(vec!["data:image/png;base64,AAAA".into()]);
        let wire = serialize_messages(&[msg], &[]);
        assert_eq!(
            wire[0]["content"],
            json!([
                { "type": "text", "text": "what is this?" },
                { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAAA" } },
            ])
        );

        let bare = ChatMessage::user("").with_images(vec!["data:image/jpeg;base64,BBBB".into()]);
        let wire = serialize_messages(&[bare], &[]);
        assert_eq!(wire[0]["content"].as_array().unwrap().len(), 1);
        assert_eq!(wire[0]["content"][0]["type"], "image_url");
    }

    #[test]
    fn tool_message_carries_call_id() {
        let wire = serialize_messages(&[ChatMessage::tool("call_9", "ok")], &[]);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_9");
    }

    #[test]
    fn jsonl_shape_omits_empty_fields() {
        let line = serde_json::to_string(&ChatMessage::user("hello")).unwrap();
        assert_eq!(line, r#"{"role":"user","content":"hello"}"#);
        let back: ChatMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back, ChatMessage::user("hello"));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        assert_eq!(backoff_delay(7), MAX_BACKOFF);
        assert_eq!(backoff_delay(64), MAX_BACKOFF);
        assert_eq!(backoff_delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn permanent_status_codes() {
        for status in [400, 401, 403, 404, 422] {
            let e = ModelError::Status { status, body: String::new() };
            assert!(e.is_permanent(), "{status} should be permanent");
        }
        let e = ModelError::Status { status: 503, body: String::new() };
        assert!(!e.is_permanent());
    }
}
