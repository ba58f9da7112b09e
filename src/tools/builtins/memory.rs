//! Built-in memory tools: `save_memory` and `recall_memory`.

use serde::Deserialize;

use crate::tools::ToolContext;

#[derive(Debug, Deserialize)]
pub struct SaveMemoryArgs {
    #[serde(alias = "text", alias = "fact")]
    pub content: String,
}

/// Append one fact; success is only reported once it is on disk.
pub async fn save_memory(ctx: &ToolContext, args: SaveMemoryArgs) -> anyhow::Result<String> {
    if args.content.trim().is_empty() {
        anyhow::bail!("save_memory: `content` must not be empty");
    }
    ctx.memory
        .save(&args.content)
        .await
        .map_err(|e| anyhow::anyhow!("save_memory: fact was NOT saved: {e:#}"))?;
    Ok("Memory saved.".into())
}

pub async fn recall_memory(ctx: &ToolContext) -> anyhow::Result<String> {
    let text = ctx
        .memory
        .recall()
        .await
        .map_err(|e| anyhow::anyhow!("recall_memory: {e:#}"))?;
    let text = text.trim();
    if text.is_empty() {
        Ok("(no memory yet)".into())
    } else {
        Ok(text.to_string())
    }
}
