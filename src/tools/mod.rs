//! Tool registry.
//!
//! The tool set is closed: every tool the model can call is a variant of
//! [`BuiltinTool`], and a [`ToolRegistry`] is a fixed table of those
//! variants built once at startup. Dispatch never fails outward: unknown
//! names, bad arguments, tool errors and timeouts all come back as an
//! `is_error` [`ToolResult`] that the model can read and react to.

pub mod builtins;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::memory::MemoryStore;
use crate::models::ToolCall;
use crate::utils::truncate_str;

pub use builtins::web::WebClient;
pub use builtins::BuiltinTool;

// ── Results ─────────────────────────────────────────────────

/// Side effect a tool asks the surrounding process to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSignal {
    /// Re-execute the bot process after the current reply is delivered.
    Restart,
}

/// Outcome of one tool call, always answered back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    pub signal: Option<ToolSignal>,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{name}`. Available tools: {available}")]
    Unknown { name: String, available: String },
    #[error("invalid arguments for `{tool}`: {reason}. Expected schema: {schema}")]
    InvalidArguments {
        tool: &'static str,
        reason: String,
        schema: String,
    },
    #[error("tool `{tool}` timed out after {secs}s")]
    TimedOut { tool: &'static str, secs: u64 },
    /// The tool ran and failed; holds the full error chain.
    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for ToolError {
    fn from(e: anyhow::Error) -> Self {
        ToolError::Failed(format!("{e:#}"))
    }
}

// ── Context ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub default_timeout: Duration,
    pub max_output_chars: usize,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_output_chars: 8000,
        }
    }
}

/// Everything a builtin needs to run, shared by all calls.
pub struct ToolContext {
    /// Relative paths and shell commands are anchored here.
    pub workspace: PathBuf,
    pub memory: Arc<MemoryStore>,
    pub web: WebClient,
    pub shell: ShellSettings,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>, memory: Arc<MemoryStore>, web: WebClient) -> Self {
        Self {
            workspace: workspace.into(),
            memory,
            web,
            shell: ShellSettings::default(),
        }
    }

    pub fn from_config(cfg: &Config, memory: Arc<MemoryStore>) -> anyhow::Result<Self> {
        let web = WebClient::new(
            cfg.tools.web.http_proxy.as_deref(),
            cfg.tools.web.resolved_brave_key(),
            cfg.tools.web.fetch_max_chars,
        )?;
        Ok(Self {
            workspace: cfg.workspace_dir(),
            memory,
            web,
            shell: ShellSettings {
                default_timeout: Duration::from_secs(cfg.tools.shell.default_timeout_secs),
                max_output_chars: cfg.tools.shell.max_output_chars,
            },
        })
    }
}

// ── Registry ────────────────────────────────────────────────

pub struct ToolRegistry {
    tools: Vec<BuiltinTool>,
    ctx: ToolContext,
    timeout: Duration,
}

impl ToolRegistry {
    /// Registry exposing every builtin.
    pub fn new(ctx: ToolContext, timeout: Duration) -> Self {
        Self::with_tools(ctx, BuiltinTool::ALL, timeout)
    }

    /// Registry exposing only `tools`, in the given order.
    pub fn with_tools(ctx: ToolContext, tools: &[BuiltinTool], timeout: Duration) -> Self {
        let mut list: Vec<BuiltinTool> = Vec::with_capacity(tools.len());
        for t in tools {
            if !list.contains(t) {
                list.push(*t);
            }
        }
        Self {
            tools: list,
            ctx,
            timeout,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Function definitions in OpenAI `tools` format, in registry order.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.schema(),
                    }
                })
            })
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<BuiltinTool> {
        self.tools.iter().copied().find(|t| t.name() == name)
    }

    /// Run one call. Never returns an error; faults become `is_error`.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let args_summary = truncate_str(&call.arguments.to_string(), 200);
        info!(tool = %call.name, id = %call.id, args = %args_summary, "invoking tool");

        let started = Instant::now();
        let outcome = self.dispatch(call).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(content) => {
                debug!(
                    tool = %call.name,
                    duration_ms,
                    output = %truncate_str(&content, 500),
                    "tool finished"
                );
                let signal = (call.name == BuiltinTool::RestartSelf.name())
                    .then_some(ToolSignal::Restart);
                ToolResult {
                    tool_call_id: call.id.clone(),
                    content,
                    is_error: false,
                    signal,
                }
            }
            Err(e) => {
                warn!(tool = %call.name, duration_ms, error = %e, "tool failed");
                ToolResult {
                    tool_call_id: call.id.clone(),
                    content: format!("Error: {e}"),
                    is_error: true,
                    signal: None,
                }
            }
        }
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self.lookup(&call.name).ok_or_else(|| ToolError::Unknown {
            name: call.name.clone(),
            available: self.names().join(", "),
        })?;
        match tokio::time::timeout(self.timeout, tool.run(&self.ctx, &call.arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::TimedOut {
                tool: tool.name(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}
