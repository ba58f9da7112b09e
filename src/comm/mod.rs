//! Transport-agnostic messaging.
//!
//! Connectors (Discord, the `debug` CLI, tests) publish [`IncomingMessage`]s
//! on a process-wide broadcast bus; the dispatcher subscribes to it. Replies
//! flow back through whichever registered [`ChannelConnector`] claims the
//! conversation key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::{broadcast, RwLock};

// ---------------------------------------------------------------------------
// IncomingMessage
// ---------------------------------------------------------------------------

/// One inbound chat message, already normalised by its connector.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IncomingMessage {
    /// Conversation key, prefixed by transport (e.g. `discord:1234`).
    pub conversation_key: String,
    /// Display name of the author.
    pub sender: String,
    /// Text handed to the agent, with the bot mention already stripped.
    pub text: String,
    /// The bot was explicitly mentioned.
    #[serde(default)]
    pub mentioned: bool,
    /// Direct (one-to-one) conversation rather than a group channel.
    #[serde(default)]
    pub direct: bool,
    /// Transport message id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Attached images as `data:` URLs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl IncomingMessage {
    pub fn new(conversation_key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_key: conversation_key.into(),
            sender: String::new(),
            text: text.into(),
            mentioned: false,
            direct: false,
            message_id: None,
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// No text and no attachments: nothing for the agent to answer.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.images.is_empty()
    }

    pub fn direct(mut self) -> Self {
        self.direct = true;
        self
    }

    pub fn mentioned(mut self) -> Self {
        self.mentioned = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Global broadcast channel
// ---------------------------------------------------------------------------

const CHANNEL_CAPACITY: usize = 256;

static SENDER: Lazy<broadcast::Sender<IncomingMessage>> = Lazy::new(|| {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    tx
});

/// Clone of the global bus sender, for connectors.
pub fn sender() -> broadcast::Sender<IncomingMessage> {
    SENDER.clone()
}

/// A receiver that sees every message sent after this call.
pub fn subscribe() -> broadcast::Receiver<IncomingMessage> {
    SENDER.subscribe()
}

/// Private `(sender, receiver)` pair, independent of the global bus.
pub fn message_bus() -> (
    broadcast::Sender<IncomingMessage>,
    broadcast::Receiver<IncomingMessage>,
) {
    broadcast::channel(CHANNEL_CAPACITY)
}

// ---------------------------------------------------------------------------
// ChannelConnector trait + global registry
// ---------------------------------------------------------------------------

/// Outbound half of a transport.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    /// Registry key; registering another connector under the same name
    /// replaces it.
    fn name(&self) -> &str;

    /// True if this connector delivers to `conversation_key`.
    fn matches(&self, conversation_key: &str) -> bool;

    /// Deliver `text` to the conversation.
    async fn send(&self, conversation_key: &str, text: &str) -> anyhow::Result<()>;
}

static CONNECTORS: Lazy<RwLock<HashMap<String, Arc<dyn ChannelConnector>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub async fn register_connector(connector: Arc<dyn ChannelConnector>) {
    let name = connector.name().to_string();
    tracing::debug!(connector = %name, "channel connector registered");
    CONNECTORS.write().await.insert(name, connector);
}

/// Send `text` through the connector that matches `conversation_key`.
///
/// A key no connector claims is logged and dropped, not an error.
pub async fn send_reply(conversation_key: &str, text: &str) -> anyhow::Result<()> {
    let connector = {
        let connectors = CONNECTORS.read().await;
        connectors
            .values()
            .find(|c| c.matches(conversation_key))
            .cloned()
    };
    match connector {
        Some(c) => c.send(conversation_key, text).await,
        None => {
            tracing::debug!(key = %conversation_key, "no connector matched, reply dropped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct Capture {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelConnector for Capture {
        fn name(&self) -> &str {
            "comm-test"
        }
        fn matches(&self, key: &str) -> bool {
            key.starts_with("comm-test:")
        }
        async fn send(&self, key: &str, text: &str) -> anyhow::Result<()> {
            self.sent.lock().await.push((key.into(), text.into()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn reply_routes_to_matching_connector() {
        let capture = Arc::new(Capture {
            sent: Mutex::new(Vec::new()),
        });
        register_connector(capture.clone()).await;

        send_reply("comm-test:1", "hi").await.unwrap();
        send_reply("nobody:1", "dropped").await.unwrap();

        let sent = capture.sent.lock().await;
        assert_eq!(sent.as_slice(), &[("comm-test:1".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn private_bus_delivers() {
        let (tx, mut rx) = message_bus();
        tx.send(IncomingMessage::new("k", "hello").direct()).unwrap();
        let got = rx.recv().await.unwrap();
        assert!(got.direct);
        assert!(!got.mentioned);
        assert_eq!(got.text, "hello");
    }
}
