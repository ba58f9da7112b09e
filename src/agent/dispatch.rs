//! Bus dispatcher: feeds inbound messages to the [`AgentLoop`] and sends
//! the replies back through [`crate::comm`].
//!
//! Each message runs in its own task. Turns for different conversations
//! proceed concurrently; turns for the same conversation queue behind the
//! session lock held by [`SessionManager::lock`].

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AgentLoop, InFlightGuard, TurnError, TurnOutcome};
use crate::comm::{self, IncomingMessage};
use crate::session::SessionManager;
use crate::utils::truncate_str;

pub struct Dispatcher {
    agent: Arc<AgentLoop>,
    sessions: Arc<SessionManager>,
    require_mention: bool,
    /// Fired once a turn that ran `restart_self` has delivered its reply,
    /// even if the turn failed afterwards.
    restart: CancellationToken,
}

impl Dispatcher {
    pub fn new(agent: Arc<AgentLoop>, sessions: Arc<SessionManager>, restart: CancellationToken) -> Self {
        Self {
            agent,
            sessions,
            require_mention: true,
            restart,
        }
    }

    pub fn require_mention(mut self, on: bool) -> Self {
        self.require_mention = on;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Direct messages are always answered; group messages only when the
    /// bot is mentioned, unless mentions are not required.
    pub fn should_reply(&self, msg: &IncomingMessage) -> bool {
        if msg.is_empty() {
            return false;
        }
        msg.direct || msg.mentioned || !self.require_mention
    }

    /// Run one turn for `msg` under its conversation lock and persist the
    /// session afterwards, also when the turn failed.
    pub async fn handle(&self, msg: &IncomingMessage) -> Result<TurnOutcome, TurnError> {
        let _in_flight = InFlightGuard::enter();
        let mut session = self.sessions.lock(&msg.conversation_key).await?;
        let result = self
            .agent
            .run_turn_with_images(&mut session, &msg.text, &msg.images)
            .await;
        if let Err(e) = self.sessions.persist(&mut session).await {
            warn!(key = %msg.conversation_key, error = %format!("{e:#}"), "failed to persist session");
        }
        result
    }

    /// [`handle`](Self::handle) plus reply delivery and the restart signal.
    pub async fn process(&self, msg: IncomingMessage) {
        let key = msg.conversation_key.clone();
        let restart_requested = match self.handle(&msg).await {
            Ok(outcome) => {
                if let Err(e) = comm::send_reply(&key, &outcome.reply).await {
                    warn!(key = %key, error = %e, "failed to send reply");
                }
                outcome.restart_requested
            }
            Err(e) => {
                let detail = e.to_string();
                warn!(key = %key, error = %detail, "agent turn failed");
                let text = format!("Sorry, something went wrong: {}", truncate_str(&detail, 300));
                if let Err(e) = comm::send_reply(&key, &text).await {
                    warn!(key = %key, error = %e, "failed to send failure reply");
                }
                e.restart_requested
            }
        };
        if restart_requested {
            info!(key = %key, "restart requested, signalling supervisor");
            self.restart.cancel();
        }
    }

    /// Consume `rx` until `cancel` fires or the bus closes.
    pub fn spawn(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<IncomingMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("agent dispatcher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("agent dispatcher received shutdown signal");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(msg) => {
                                if !self.should_reply(&msg) {
                                    debug!(key = %msg.conversation_key, "message ignored by reply policy");
                                    continue;
                                }
                                let this = Arc::clone(&self);
                                tokio::spawn(async move { this.process(msg).await });
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "agent dispatch lagged, dropped messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("message bus closed, agent dispatcher exiting");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}
