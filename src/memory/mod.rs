//! Durable fact memory backed by a plain text file.
//!
//! Storage: `<workspace>/memory/MEMORY.md`, one fact per line.
//!
//! The file is append-only from the agent's point of view and is read in
//! full on every prompt assembly, so edits made by hand show up on the
//! next turn without a restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const MEMORY_FILE_NAME: &str = "MEMORY.md";

/// Append-only fact log shared by every conversation.
pub struct MemoryStore {
    path: PathBuf,
    /// Serialises appends across concurrent `save_memory` calls.
    write_lock: Mutex<()>,
}

impl MemoryStore {
    /// Store at `dir/MEMORY.md`.
    pub fn open(dir: &Path) -> Self {
        Self::open_path(dir.join(MEMORY_FILE_NAME))
    }

    /// Store at an explicit file path. The file is created lazily.
    pub fn open_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one fact and flush it to disk before returning.
    ///
    /// Line breaks inside `fact` are folded into spaces so one fact is
    /// always one line.
    pub async fn save(&self, fact: &str) -> anyhow::Result<()> {
        let line = fact
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if line.is_empty() {
            anyhow::bail!("memory fact must not be empty");
        }

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        // A hand-edited file may lack the trailing newline.
        let needs_separator = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes.last().is_some_and(|b| *b != b'\n'),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;

        let mut buf = String::with_capacity(line.len() + 2);
        if needs_separator {
            buf.push('\n');
        }
        buf.push_str(&line);
        buf.push('\n');

        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("append to {}", self.path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("sync {}", self.path.display()))?;

        tracing::info!(path = %self.path.display(), chars = line.chars().count(), "memory fact saved");
        Ok(())
    }

    /// Full current memory text; empty when nothing was saved yet.
    pub async fn recall(&self) -> anyhow::Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }

    /// Non-empty memory lines in file order.
    pub async fn facts(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .recall()
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
