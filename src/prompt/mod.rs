//! System prompt assembly.
//!
//! The system prompt is laid out as
//!
//! ```text
//! <base prompt>
//!
//! <available_skills>…</available_skills>
//!
//! <memory>
//! …
//! </memory>
//! ```
//!
//! The first two sections are fixed at construction. Memory is re-read on
//! every [`PromptBuilder::build`] call. Nothing per-turn (clock, chat key)
//! ever lands here so that unchanged inputs give byte-identical output
//! and the provider's prefix cache keeps hitting.

use std::sync::Arc;

use anyhow::Context;

use crate::memory::MemoryStore;
use crate::models::ChatMessage;
use crate::skills::SkillRegistry;

pub struct PromptBuilder {
    /// Base prompt plus skills block, joined once.
    stable_prefix: String,
    memory: Arc<MemoryStore>,
}

impl PromptBuilder {
    pub fn new(base_prompt: &str, skills: &SkillRegistry, memory: Arc<MemoryStore>) -> Self {
        let sections = [base_prompt.trim().to_string(), skills.prompt_block()];
        let stable_prefix = sections
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        Self {
            stable_prefix,
            memory,
        }
    }

    /// The part of the prompt that never changes for the process lifetime.
    pub fn stable_prefix(&self) -> &str {
        &self.stable_prefix
    }

    /// Full system prompt text with the current memory content.
    pub async fn build(&self) -> anyhow::Result<String> {
        let memory = self
            .memory
            .recall()
            .await
            .context("reading memory for system prompt")?;
        let memory = memory.trim();
        if memory.is_empty() {
            return Ok(self.stable_prefix.clone());
        }
        let block = format!("<memory>\n{memory}\n</memory>");
        if self.stable_prefix.is_empty() {
            return Ok(block);
        }
        Ok(format!("{}\n\n{block}", self.stable_prefix))
    }

    pub async fn system_message(&self) -> anyhow::Result<ChatMessage> {
        Ok(ChatMessage::system(self.build().await?))
    }
}
