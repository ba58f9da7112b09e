//! Built-in `write_file` tool: creates or overwrites a file.

use serde::Deserialize;

use crate::tools::ToolContext;
use crate::utils::resolve_path;

#[derive(Debug, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

/// Write `content` to `path`, creating parent directories.
pub async fn write_file(ctx: &ToolContext, args: WriteFileArgs) -> anyhow::Result<String> {
    let path = resolve_path(&ctx.workspace, &args.path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("write_file: cannot create {}: {e}", parent.display()))?;
    }

    tokio::fs::write(&path, &args.content)
        .await
        .map_err(|e| anyhow::anyhow!("write_file: cannot write {}: {e}", path.display()))?;

    Ok(format!("Wrote {} bytes to {}", args.content.len(), path.display()))
}
