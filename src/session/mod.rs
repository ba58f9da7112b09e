//! Conversation sessions: in-memory history per conversation key, backed
//! by append-only JSONL files.
//!
//! Each conversation key owns exactly one [`Session`], reachable only
//! through [`SessionManager::lock`], so two turns for the same key can
//! never interleave. Files live at `sessions/<safe_key>.jsonl`, one
//! serialised [`ChatMessage`] per line.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use anyhow::Context as _;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::models::{ChatMessage, Role};
use crate::utils::safe_file_stem;

// ── HistoryPolicy ────────────────────────────────────────────

/// Bound on how much history is replayed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPolicy {
    /// Maximum number of non-system messages kept. `0` keeps everything.
    pub max_messages: usize,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self { max_messages: 200 }
    }
}

impl HistoryPolicy {
    pub fn unbounded() -> Self {
        Self { max_messages: 0 }
    }

    /// Drop the oldest non-system messages until at most `max_messages`
    /// remain, then keep dropping until the window opens on a user
    /// message so no tool result is left without its assistant call.
    /// System messages are never dropped. Returns how many were removed.
    pub fn apply(&self, messages: &mut Vec<ChatMessage>) -> usize {
        if self.max_messages == 0 {
            return 0;
        }
        let non_system = messages.iter().filter(|m| m.role != Role::System).count();
        if non_system <= self.max_messages {
            return 0;
        }
        let mut excess = non_system - self.max_messages;
        let mut aligning = true;
        let before = messages.len();
        messages.retain(|m| {
            if m.role == Role::System {
                return true;
            }
            if excess > 0 {
                excess -= 1;
                return false;
            }
            if aligning {
                if m.role == Role::User {
                    aligning = false;
                    return true;
                }
                return false;
            }
            true
        });
        before - messages.len()
    }
}

// ── Session ──────────────────────────────────────────────────

/// Ordered message history of one conversation.
#[derive(Debug, Clone)]
pub struct Session {
    key: String,
    messages: Vec<ChatMessage>,
    /// Messages before this index are already on disk.
    persisted: usize,
    hydrated: bool,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            messages: Vec::new(),
            persisted: 0,
            hydrated: false,
        }
    }

    /// Session pre-filled with already-persisted history.
    pub fn with_history(key: impl Into<String>, mut messages: Vec<ChatMessage>) -> Self {
        drop_unanswered_calls(&mut messages);
        let persisted = messages.len();
        Self {
            key: key.into(),
            messages,
            persisted,
            hydrated: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append one message. The only way messages enter a session.
    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Apply `policy` to the in-memory window. The file is not touched.
    pub fn truncate(&mut self, policy: &HistoryPolicy) -> usize {
        let dropped = policy.apply(&mut self.messages);
        self.persisted = self.persisted.saturating_sub(dropped);
        if dropped > 0 {
            debug!(key = %self.key, dropped, kept = self.messages.len(), "history truncated");
        }
        dropped
    }

    /// Messages appended since the last [`mark_persisted`](Self::mark_persisted).
    pub fn unpersisted(&self) -> &[ChatMessage] {
        &self.messages[self.persisted.min(self.messages.len())..]
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = self.messages.len();
    }
}

/// A crash between an assistant tool call and its results can leave a
/// call unanswered at the tail of the log; such a tail is not replayable.
fn drop_unanswered_calls(messages: &mut Vec<ChatMessage>) {
    let Some(idx) = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant && !m.calls().is_empty())
    else {
        return;
    };
    let answered = messages[idx + 1..]
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    if answered < messages[idx].calls().len() {
        messages.truncate(idx);
    }
}

// ── JSONL persistence ────────────────────────────────────────

#[derive(Serialize)]
struct JsonlLine<'a> {
    ts: String,
    #[serde(flatten)]
    message: &'a ChatMessage,
}

/// Read a session file; a missing file is an empty history.
pub async fn load_jsonl(path: &Path) -> anyhow::Result<Vec<ChatMessage>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read session file {}", path.display())),
    };
    let mut messages = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ChatMessage>(line) {
            Ok(m) => messages.push(m),
            Err(e) => debug!(path = %path.display(), line = lineno + 1, error = %e, "skipping malformed session line"),
        }
    }
    Ok(messages)
}

/// Append `messages` to `path`, creating the file and parent directory.
pub async fn append_jsonl(path: &Path, messages: &[ChatMessage]) -> anyhow::Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context("create sessions dir")?;
    }
    let ts = chrono::Local::now().to_rfc3339();
    let mut buf = String::new();
    for message in messages {
        let line = serde_json::to_string(&JsonlLine {
            ts: ts.clone(),
            message,
        })
        .context("serialize session message")?;
        buf.push_str(&line);
        buf.push('\n');
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open session file {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .await
        .with_context(|| format!("append to session file {}", path.display()))?;
    debug!(path = %path.display(), count = messages.len(), "session messages appended");
    Ok(())
}

// ── SessionManager ───────────────────────────────────────────

/// Live slots kept before idle sessions are evicted.
pub const DEFAULT_SLOT_CAPACITY: usize = 256;

/// Owns every live session, one slot per conversation key.
///
/// Once more than `capacity` slots exist, opening a new one evicts every
/// slot that nobody holds or waits for and whose messages are all on
/// disk; the next lock re-hydrates it from its file. In-memory managers
/// never evict.
pub struct SessionManager {
    /// `None` keeps sessions purely in memory.
    dir: Option<PathBuf>,
    slots: std::sync::Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    capacity: usize,
}

impl SessionManager {
    /// Sessions persisted under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            slots: std::sync::Mutex::new(HashMap::new()),
            capacity: DEFAULT_SLOT_CAPACITY,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            dir: None,
            slots: std::sync::Mutex::new(HashMap::new()),
            capacity: usize::MAX,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        if self.dir.is_some() {
            self.capacity = capacity;
        }
        self
    }

    pub fn path_for(&self, key: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.jsonl", safe_file_stem(key))))
    }

    /// Number of conversations currently held in memory.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive access to the session for `key`, waiting behind any
    /// turn already in flight for it. The first lock after start-up
    /// re-hydrates the session from its file.
    pub async fn lock(&self, key: &str) -> anyhow::Result<OwnedMutexGuard<Session>> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if !slots.contains_key(key) && slots.len() >= self.capacity {
                evict_idle(&mut slots);
            }
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Session::new(key))))
                .clone()
        };
        let mut session = slot.lock_owned().await;
        if !session.hydrated {
            if let Some(path) = self.path_for(key) {
                let history = load_jsonl(&path).await?;
                if !history.is_empty() {
                    info!(key, messages = history.len(), "session restored from disk");
                }
                *session = Session::with_history(key, history);
            }
            session.hydrated = true;
        }
        Ok(session)
    }

    /// Write the session's new messages to its file.
    pub async fn persist(&self, session: &mut Session) -> anyhow::Result<()> {
        if let Some(path) = self.path_for(session.key()) {
            append_jsonl(&path, session.unpersisted()).await?;
        }
        session.mark_persisted();
        Ok(())
    }
}

/// Drop slots with no other holder, no waiter and nothing left to persist.
/// Cloning a slot needs the map lock, which the caller holds.
fn evict_idle(slots: &mut HashMap<String, Arc<Mutex<Session>>>) {
    let before = slots.len();
    slots.retain(|_, slot| {
        if Arc::strong_count(slot) > 1 {
            return true;
        }
        match slot.try_lock() {
            Ok(session) => !session.unpersisted().is_empty(),
            Err(_) => true,
        }
    });
    let evicted = before - slots.len();
    if evicted > 0 {
        debug!(evicted, kept = slots.len(), "idle sessions evicted");
    }
}
