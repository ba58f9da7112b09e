//! Agent runtime: the per-turn loop that drives the model and the tools.
//!
//! [`AgentLoop::run_turn`] advances one [`Session`] from a user message to a
//! final assistant reply. A turn alternates between asking the model and
//! executing the tool calls it returns until the model answers in plain
//! text or the round limit is hit. [`dispatch`] wires the loop to the
//! message bus.

pub mod dispatch;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{ChatMessage, ModelError, ModelProvider, ProviderResponse, ToolCall};
use crate::prompt::PromptBuilder;
use crate::session::{HistoryPolicy, Session};
use crate::tools::{ToolRegistry, ToolSignal};

pub use dispatch::Dispatcher;

/// Global counter of in-flight agent turns.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of agent turns currently executing.
pub fn in_flight_count() -> usize {
    IN_FLIGHT.load(Ordering::Relaxed)
}

/// Wait until all in-flight agent turns have completed, polling at a
/// fixed interval. Returns after `timeout` even if turns remain.
pub async fn drain_in_flight(timeout: Duration) {
    let start = std::time::Instant::now();
    loop {
        if IN_FLIGHT.load(Ordering::Relaxed) == 0 {
            break;
        }
        if start.elapsed() >= timeout {
            warn!(
                remaining = IN_FLIGHT.load(Ordering::Relaxed),
                "shutdown drain timeout reached, proceeding"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Keeps [`IN_FLIGHT`] accurate even if a turn panics.
pub(crate) struct InFlightGuard;

impl InFlightGuard {
    pub(crate) fn enter() -> Self {
        IN_FLIGHT.fetch_add(1, Ordering::Relaxed);
        InFlightGuard
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Turn outcome
// ---------------------------------------------------------------------------

/// What a finished turn hands back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub reply: String,
    /// `restart_self` ran successfully during the turn.
    pub restart_requested: bool,
    /// Tool-execution rounds actually performed.
    pub rounds: usize,
    pub model_calls: usize,
}

/// A turn that ended early on a model or prompt failure.
///
/// `restart_requested` survives the failure: a `restart_self` that already
/// ran still has to reach the supervisor.
#[derive(Debug, Error)]
#[error("{error:#}")]
pub struct TurnError {
    pub error: anyhow::Error,
    pub restart_requested: bool,
}

impl From<anyhow::Error> for TurnError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            error,
            restart_requested: false,
        }
    }
}

/// Reply used when the model's answer could not be read at all.
pub const MALFORMED_REPLY: &str = "Sorry, I could not understand the model's response. Please try again.";

enum LoopState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Terminal(String),
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

pub struct AgentLoop {
    provider: Arc<dyn ModelProvider>,
    prompt: PromptBuilder,
    tools: ToolRegistry,
    max_tool_rounds: usize,
    history: HistoryPolicy,
    inject_context: bool,
}

impl AgentLoop {
    /// Loop with the default history policy and context injection on.
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        prompt: PromptBuilder,
        tools: ToolRegistry,
        max_tool_rounds: usize,
    ) -> Self {
        Self {
            provider,
            prompt,
            tools,
            max_tool_rounds,
            history: HistoryPolicy::default(),
            inject_context: true,
        }
    }

    pub fn from_config(
        cfg: &Config,
        provider: Arc<dyn ModelProvider>,
        prompt: PromptBuilder,
        tools: ToolRegistry,
    ) -> Self {
        Self::new(provider, prompt, tools, cfg.agent.max_tool_rounds)
            .with_history_policy(HistoryPolicy {
                max_messages: cfg.agent.max_history_messages,
            })
            .with_context_injection(cfg.agent.inject_context)
    }

    pub fn with_history_policy(mut self, policy: HistoryPolicy) -> Self {
        self.history = policy;
        self
    }

    pub fn with_context_injection(mut self, on: bool) -> Self {
        self.inject_context = on;
        self
    }

    /// Run one turn for `user_text`.
    ///
    /// Returns `Err` only for model transport or status failures and for
    /// a failing system-prompt build. Whatever was appended before the
    /// failure stays in the session, so the pairing of tool calls and
    /// results is complete and the next message can simply retry.
    pub async fn run_turn(&self, session: &mut Session, user_text: &str) -> Result<TurnOutcome, TurnError> {
        self.run_turn_with_images(session, user_text, &[]).await
    }

    /// [`run_turn`](Self::run_turn) for a message with attached images.
    ///
    /// The images go to the model with every request of this turn. The
    /// session keeps only the text plus one `[image]` marker per image.
    pub async fn run_turn_with_images(
        &self,
        session: &mut Session,
        user_text: &str,
        images: &[String],
    ) -> Result<TurnOutcome, TurnError> {
        session.truncate(&self.history);
        let turn_start = session.len();
        session.append(ChatMessage::user(with_image_markers(user_text, images.len())));

        let context = self
            .inject_context
            .then(|| context_message(session.key(), &Local::now()));
        let tool_defs = self.tools.definitions();

        let mut rounds = 0usize;
        let mut executed = 0usize;
        let mut model_calls = 0usize;
        let mut restart_requested = false;
        let mut state = LoopState::AwaitingModel;

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    let system = match self.prompt.system_message().await {
                        Ok(system) => system,
                        Err(e) => {
                            return Err(TurnError {
                                error: e.context("build system prompt"),
                                restart_requested,
                            })
                        }
                    };
                    let (request, cache_points) =
                        assemble_request(system, session.messages(), turn_start, context.as_ref(), images);

                    model_calls += 1;
                    debug!(
                        key = %session.key(),
                        messages = request.len(),
                        call = model_calls,
                        "calling model"
                    );
                    match self.provider.chat(&request, &tool_defs, &cache_points).await {
                        Ok((ProviderResponse::Final(text), _)) => {
                            session.append(ChatMessage::assistant(text.clone()));
                            LoopState::Terminal(text)
                        }
                        Ok((ProviderResponse::ToolCalls { content, calls }, _)) if calls.is_empty() => {
                            session.append(ChatMessage::assistant(content.clone()));
                            LoopState::Terminal(content)
                        }
                        Ok((ProviderResponse::ToolCalls { content, calls }, _)) => {
                            session.append(ChatMessage::assistant_with_calls(content, calls.clone()));
                            LoopState::ExecutingTools(calls)
                        }
                        Err(ModelError::Protocol { reason, content }) => {
                            match content.filter(|c| !c.trim().is_empty()) {
                                Some(text) => {
                                    warn!(key = %session.key(), %reason, "malformed model response, using its text");
                                    session.append(ChatMessage::assistant(text.clone()));
                                    LoopState::Terminal(text)
                                }
                                None => {
                                    warn!(key = %session.key(), %reason, "malformed model response with no usable text");
                                    LoopState::Terminal(MALFORMED_REPLY.to_string())
                                }
                            }
                        }
                        Err(e) => {
                            return Err(TurnError {
                                error: anyhow::Error::new(e).context("model call failed"),
                                restart_requested,
                            });
                        }
                    }
                }

                LoopState::ExecutingTools(calls) => {
                    rounds += 1;
                    if rounds > self.max_tool_rounds {
                        warn!(
                            key = %session.key(),
                            max_tool_rounds = self.max_tool_rounds,
                            pending = calls.len(),
                            "tool round limit reached"
                        );
                        for call in &calls {
                            session.append(ChatMessage::tool(
                                call.id.clone(),
                                format!(
                                    "Error: not executed: tool round limit ({}) reached",
                                    self.max_tool_rounds
                                ),
                            ));
                        }
                        let notice = format!("Reached maximum tool call rounds ({}).", self.max_tool_rounds);
                        session.append(ChatMessage::assistant(notice.clone()));
                        LoopState::Terminal(notice)
                    } else {
                        executed = rounds;
                        for call in &calls {
                            let result = self.tools.execute(call).await;
                            if result.signal == Some(ToolSignal::Restart) {
                                restart_requested = true;
                            }
                            session.append(ChatMessage::tool(result.tool_call_id, result.content));
                        }
                        LoopState::AwaitingModel
                    }
                }

                LoopState::Terminal(reply) => {
                    info!(
                        key = %session.key(),
                        rounds = executed,
                        model_calls,
                        restart_requested,
                        reply_len = reply.len(),
                        "turn completed"
                    );
                    return Ok(TurnOutcome {
                        reply,
                        restart_requested,
                        rounds: executed,
                        model_calls,
                    });
                }
            };
        }
    }
}

/// Volatile per-turn details, kept out of the system prompt so the
/// cacheable prefix stays byte-identical.
pub fn context_message(conversation_key: &str, now: &DateTime<Local>) -> ChatMessage {
    ChatMessage::user(format!(
        "[Context]\nTime: {}\nChat: {}",
        now.format("%Y-%m-%d %H:%M"),
        conversation_key
    ))
}

fn with_image_markers(text: &str, images: usize) -> String {
    let markers = vec!["[image]"; images].join(" ");
    match (text.trim().is_empty(), markers.is_empty()) {
        (_, true) => text.to_string(),
        (true, false) => markers,
        (false, false) => format!("{text} {markers}"),
    }
}

/// `system + history + [context] + this turn's messages`, plus the
/// indices that end a cacheable prefix. `images` ride on the turn's
/// user message.
fn assemble_request(
    system: ChatMessage,
    messages: &[ChatMessage],
    turn_start: usize,
    context: Option<&ChatMessage>,
    images: &[String],
) -> (Vec<ChatMessage>, Vec<usize>) {
    let split = turn_start.min(messages.len());
    let mut request = Vec::with_capacity(messages.len() + 2);
    request.push(system);
    request.extend_from_slice(&messages[..split]);
    let mut cache_points = vec![0];
    if let Some(ctx) = context {
        cache_points.push(request.len());
        request.push(ctx.clone());
    }
    let turn_at = request.len();
    request.extend_from_slice(&messages[split..]);
    if !images.is_empty() {
        if let Some(user) = request.get_mut(turn_at) {
            user.images = images.to_vec();
        }
    }
    (request, cache_points)
}
