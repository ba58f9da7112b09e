//! Generic OpenAI-compatible provider.
//!
//! Works with any API that implements the OpenAI chat completions
//! interface: OpenAI itself, OpenRouter, Ollama, Groq, vLLM, LM Studio,
//! DeepSeek and friends.
//!
//! ```yaml
//! llm:
//!   api_base: http://localhost:11434/v1
//!   api_key: $OLLAMA_KEY   # optional, some local servers need none
//!   model: llama3
//! ```

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    parse_token_usage, serialize_messages, ChatMessage, ModelError, ModelProvider,
    ProviderResponse, TokenUsage, ToolCall,
};

/// Provider that talks to any OpenAI-compatible chat completions API.
pub struct OpenAICompatProvider {
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
    cache_control: bool,
    client: Client,
}

impl OpenAICompatProvider {
    /// `api_base` is the URL prefix (`.../v1`); `/chat/completions` is
    /// appended. `api_key` may be empty for servers without auth.
    pub fn new(
        api_base: &str,
        api_key: String,
        model: String,
        max_tokens: u32,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_key,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            model,
            max_tokens,
            cache_control: false,
            client,
        })
    }

    pub fn from_config(cfg: &crate::config::LlmConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            &cfg.api_base,
            cfg.resolved_api_key(),
            cfg.model.clone(),
            cfg.max_tokens,
            Duration::from_secs(cfg.request_timeout_secs),
        )?
        .with_cache_control(cfg.cache_control))
    }

    /// Send `cache_control` markers at the requested cache points.
    pub fn with_cache_control(mut self, enabled: bool) -> Self {
        self.cache_control = enabled;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[Value], cache_points: &[usize]) -> Value {
        let points = if self.cache_control { cache_points } else { &[] };
        let mut body = json!({
            "model": self.model,
            "messages": serialize_messages(messages, points),
            "max_tokens": self.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        cache_points: &[usize],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), ModelError> {
        let body = self.request_body(messages, tools, cache_points);

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ModelError::Protocol {
            reason: format!("response is not JSON: {e}"),
            content: None,
        })?;
        let usage = parse_token_usage(&json);
        if let Some(ref u) = usage {
            debug!(
                model = %self.model,
                prompt_tokens = u.prompt_tokens,
                completion_tokens = u.completion_tokens,
                total_tokens = u.total_tokens,
                "token usage"
            );
        }
        Ok((parse_completion(&json)?, usage))
    }
}

/// Interpret `choices[0].message` of a chat completion.
pub fn parse_completion(json: &Value) -> Result<ProviderResponse, ModelError> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ModelError::Protocol {
            reason: "response has no choices[0].message".into(),
            content: None,
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let raw_calls = match message.get("tool_calls").and_then(Value::as_array) {
        Some(calls) if !calls.is_empty() => calls,
        _ => return Ok(ProviderResponse::Final(content)),
    };

    let mut calls = Vec::with_capacity(raw_calls.len());
    for (idx, tc) in raw_calls.iter().enumerate() {
        let func = tc.get("function");
        let name = match func.and_then(|f| f.get("name")).and_then(Value::as_str) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                return Err(ModelError::Protocol {
                    reason: format!("tool call {idx} has no function name"),
                    content: Some(content).filter(|c| !c.trim().is_empty()),
                })
            }
        };
        let arguments = match func.and_then(|f| f.get("arguments")) {
            None | Some(Value::Null) => json!({}),
            Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
            // Invalid JSON is kept so the tool registry can report it.
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            Some(other) => other.clone(),
        };
        let id = tc
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
        calls.push(ToolCall { id, name, arguments });
    }

    Ok(ProviderResponse::ToolCalls { content, calls })
}
