//! Discord transport.
//!
//! Inbound messages are normalised into [`IncomingMessage`]s and published on
//! the [`comm`] bus; replies come back through [`DiscordConnector`], which
//! claims every `discord:<channel_id>` conversation key.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serenity::async_trait as serenity_async_trait;
use serenity::client::{Client, Context, EventHandler};
use serenity::http::Http;
use serenity::model::channel::Message;
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::id::{ChannelId, UserId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::comm::{self, ChannelConnector, IncomingMessage};
use crate::config::DiscordConfig;
use crate::utils::data_url;

/// Discord rejects messages over 2000 characters.
pub const MAX_CHUNK_CHARS: usize = 1900;
const KEY_PREFIX: &str = "discord:";
const DEDUP_CAPACITY: usize = 1000;
/// Larger image attachments are skipped rather than inlined.
const MAX_IMAGE_BYTES: u32 = 8 * 1024 * 1024;

// Shared HTTP client so the connector can send without the full `Client`.
static HTTP_CLIENT: OnceLock<Arc<Http>> = OnceLock::new();

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Bounded set of recently seen message ids. Gateway reconnects can
/// replay events; each id is forwarded at most once.
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Remove `<@ID>` / `<@!ID>` mentions of the bot and trim.
pub fn strip_mention(text: &str, bot_id: u64) -> String {
    text.replace(&format!("<@{bot_id}>"), "")
        .replace(&format!("<@!{bot_id}>"), "")
        .trim()
        .to_string()
}

/// Fields of an inbound Discord message the bot cares about.
#[derive(Debug, Clone)]
pub struct InboundParts<'a> {
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub author_name: &'a str,
    pub content: &'a str,
    pub direct: bool,
    pub mentioned: bool,
}

/// Message text with the bot mention removed.
fn body_of(parts: &InboundParts<'_>, bot_id: Option<u64>) -> String {
    match bot_id {
        Some(id) => strip_mention(parts.content, id),
        None => parts.content.trim().to_string(),
    }
}

/// Normalise a Discord message into the bus envelope.
///
/// `None` when neither text (after stripping the bot mention) nor images
/// remain, e.g. a bare `@bot`.
pub fn to_incoming(
    parts: &InboundParts<'_>,
    bot_id: Option<u64>,
    images: Vec<String>,
) -> Option<IncomingMessage> {
    let body = body_of(parts, bot_id);
    if body.is_empty() && images.is_empty() {
        return None;
    }
    let sender = format!("[sender:{} ({})]", parts.author_name, parts.author_id);
    let text = if body.is_empty() { sender } else { format!("{sender} {body}") };
    Some(IncomingMessage {
        conversation_key: format!("{KEY_PREFIX}{}", parts.channel_id),
        sender: parts.author_name.to_string(),
        text,
        mentioned: parts.mentioned,
        direct: parts.direct,
        message_id: Some(parts.message_id.to_string()),
        images,
    })
}

/// `image/png` from `image/png; charset=...`; `None` for non-images.
pub fn image_mime(content_type: Option<&str>) -> Option<&str> {
    let mime = content_type?.split(';').next()?.trim();
    mime.starts_with("image/").then_some(mime)
}

async fn download_image(client: &reqwest::Client, url: &str, mime: &str) -> anyhow::Result<String> {
    let bytes = client
        .get(url)
        .send()
        .await
        .context("request attachment")?
        .error_for_status()
        .context("attachment download failed")?
        .bytes()
        .await
        .context("read attachment body")?;
    Ok(data_url(mime, &bytes))
}

struct Handler {
    bot_id: OnceLock<UserId>,
    recent: Mutex<RecentIds>,
    /// Attachment downloads.
    http: reqwest::Client,
    require_mention: bool,
}

impl Handler {
    /// Inline the message's image attachments, skipping oversized or
    /// failed downloads.
    async fn images_of(&self, msg: &Message) -> Vec<String> {
        let mut images = Vec::new();
        for att in &msg.attachments {
            let Some(mime) = image_mime(att.content_type.as_deref()) else {
                continue;
            };
            if att.size > MAX_IMAGE_BYTES {
                warn!(file = %att.filename, size = att.size, "image attachment too large, skipped");
                continue;
            }
            match download_image(&self.http, &att.url, mime).await {
                Ok(url) => images.push(url),
                Err(e) => warn!(file = %att.filename, error = %format!("{e:#}"), "image download failed"),
            }
        }
        images
    }
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, id = %ready.user.id, "discord connected");
        let _ = self.bot_id.set(ready.user.id);
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        // Ignore messages from bots (including ourselves).
        if msg.author.bot {
            return;
        }
        let fresh = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&msg.id.to_string());
        if !fresh {
            debug!(message_id = %msg.id, "duplicate discord message ignored");
            return;
        }

        let bot_id = self.bot_id.get().copied();
        let mentioned = bot_id
            .map(|id| msg.mentions.iter().any(|u| u.id == id))
            .unwrap_or(false);
        let parts = InboundParts {
            channel_id: msg.channel_id.get(),
            message_id: msg.id.get(),
            author_id: msg.author.id.get(),
            author_name: &msg.author.name,
            content: &msg.content,
            direct: msg.guild_id.is_none(),
            mentioned,
        };
        // Only download for messages the dispatcher will answer.
        let wanted = parts.direct || mentioned || !self.require_mention;
        let images = if wanted { self.images_of(&msg).await } else { Vec::new() };
        let Some(incoming) = to_incoming(&parts, bot_id.map(|id| id.get()), images) else {
            debug!(message_id = %msg.id, "empty discord message ignored");
            return;
        };
        debug!(
            key = %incoming.conversation_key,
            author = %msg.author.name,
            direct = incoming.direct,
            mentioned,
            images = incoming.images.len(),
            "discord message received"
        );

        if let Err(e) = comm::sender().send(incoming) {
            warn!(error = %e, "failed to send message to comm bus (no receivers?)");
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Split `text` into chunks of at most `max` characters, preferring line
/// boundaries. Lines longer than `max` are hard-split.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let sep = usize::from(!current.is_empty());
        if current_len + sep + line_len <= max {
            if sep == 1 {
                current.push('\n');
            }
            current.push_str(line);
            current_len += sep + line_len;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= max {
            current.push_str(line);
            current_len = line_len;
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let mut pieces = chars.chunks(max).peekable();
        while let Some(piece) = pieces.next() {
            if pieces.peek().is_some() {
                chunks.push(piece.iter().collect());
            } else {
                current = piece.iter().collect();
                current_len = piece.len();
            }
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn channel_of(conversation_key: &str) -> Option<u64> {
    conversation_key
        .strip_prefix(KEY_PREFIX)?
        .parse()
        .ok()
        .filter(|id| *id != 0)
}

/// Delivers replies to `discord:<channel_id>` conversations.
pub struct DiscordConnector;

#[async_trait]
impl ChannelConnector for DiscordConnector {
    fn name(&self) -> &str {
        "discord"
    }

    fn matches(&self, conversation_key: &str) -> bool {
        channel_of(conversation_key).is_some()
    }

    async fn send(&self, conversation_key: &str, text: &str) -> anyhow::Result<()> {
        let http = HTTP_CLIENT
            .get()
            .ok_or_else(|| anyhow!("discord http client not initialised"))?;
        let cid = channel_of(conversation_key)
            .with_context(|| format!("invalid discord conversation key: {conversation_key}"))?;
        let channel = ChannelId::new(cid);
        let chunks = split_message(text, MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            debug!(key = %conversation_key, "empty reply not sent");
            return Ok(());
        }
        for chunk in chunks {
            channel
                .say(http.as_ref(), chunk)
                .await
                .map_err(|e| anyhow!("discord send error: {e:?}"))?;
        }
        Ok(())
    }
}

/// Register the connector and connect to the gateway in the background.
pub async fn init(cfg: &DiscordConfig) -> anyhow::Result<()> {
    let token = cfg
        .resolved_token()
        .ok_or_else(|| anyhow!("discord token not set (channels.discord.token or DISCORD_TOKEN)"))?;

    HTTP_CLIENT.get_or_init(|| Arc::new(Http::new(&token)));
    comm::register_connector(Arc::new(DiscordConnector)).await;

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build attachment HTTP client")?;
    let handler = Handler {
        bot_id: OnceLock::new(),
        recent: Mutex::new(RecentIds::new(DEDUP_CAPACITY)),
        http,
        require_mention: cfg.require_mention,
    };
    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .await
        .context("failed to build Discord client")?;

    tokio::spawn(async move {
        info!("starting Discord bot");
        if let Err(e) = client.start().await {
            let s = e.to_string();
            if s.contains("Disallowed gateway intents") || s.contains("Disallowed intent") {
                warn!(error = %e, "enable the Message Content intent for this bot in the Discord developer portal");
            } else {
                warn!(error = %e, "Discord client error");
            }
        }
    });
    Ok(())
}
