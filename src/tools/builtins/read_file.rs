//! Built-in `read_file` tool.

use std::io::ErrorKind;

use serde::Deserialize;

use crate::tools::ToolContext;
use crate::utils::resolve_path;

#[derive(Debug, Deserialize)]
pub struct ReadFileArgs {
    pub path: String,
}

/// Read a UTF-8 text file. Relative paths resolve against the workspace.
pub async fn read_file(ctx: &ToolContext, args: ReadFileArgs) -> anyhow::Result<String> {
    let path = resolve_path(&ctx.workspace, &args.path);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            anyhow::bail!("read_file: file not found: {}", path.display())
        }
        Err(e) => anyhow::bail!("read_file: cannot read {}: {e}", path.display()),
    }
}
