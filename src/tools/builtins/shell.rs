//! Built-in `shell` tool: runs a command with `sh -c` in the workspace.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;

use crate::tools::ToolContext;
use crate::utils::take_chars;

#[derive(Debug, Deserialize)]
pub struct ShellArgs {
    #[serde(alias = "command")]
    pub cmd: String,
    /// Seconds; falls back to `tools.shell.default_timeout_secs`.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Execute `cmd` and return combined stdout+stderr.
///
/// Output is trimmed and capped at `max_output_chars`. A non-zero exit
/// status is reported as a trailing `[exit code: N]` line rather than an
/// error so the model still sees the output. The child is killed when the
/// timeout fires.
pub async fn shell(ctx: &ToolContext, args: ShellArgs) -> anyhow::Result<String> {
    if args.cmd.trim().is_empty() {
        anyhow::bail!("shell: `cmd` must not be empty");
    }
    let timeout = args
        .timeout
        .filter(|t| *t > 0)
        .map(Duration::from_secs)
        .unwrap_or(ctx.shell.default_timeout);

    tokio::fs::create_dir_all(&ctx.workspace)
        .await
        .map_err(|e| anyhow::anyhow!("shell: cannot create workspace {}: {e}", ctx.workspace.display()))?;

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&args.cmd)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("shell: spawn failed: {e}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| anyhow::anyhow!("shell: {e}"))?,
        Err(_elapsed) => anyhow::bail!("shell: timed out after {}s", timeout.as_secs()),
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let (kept, _cut) = take_chars(combined.trim(), ctx.shell.max_output_chars);
    let mut text = if kept.is_empty() {
        "(no output)".to_string()
    } else {
        kept.to_string()
    };

    match output.status.code() {
        Some(0) => {}
        Some(code) => text.push_str(&format!("\n[exit code: {code}]")),
        None => text.push_str("\n[terminated by signal]"),
    }
    Ok(text)
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::tools::WebClient;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        let memory = Arc::new(MemoryStore::open(dir));
        ToolContext::new(dir, memory, WebClient::new(None, None, 8000).unwrap())
    }

    fn args(cmd: &str, timeout: Option<u64>) -> ShellArgs {
        ShellArgs {
            cmd: cmd.into(),
            timeout,
        }
    }

    #[tokio::test]
    async fn runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = shell(&ctx(dir.path()), args("ls", None)).await.unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[tokio::test]
    async fn combines_streams_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = shell(&ctx(dir.path()), args("echo out; echo err >&2; exit 3", None))
            .await
            .unwrap();
        assert!(out.starts_with("out\nerr"), "{out}");
        assert!(out.ends_with("[exit code: 3]"), "{out}");
    }

    #[tokio::test]
    async fn empty_output_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(shell(&ctx(dir.path()), args("true", None)).await.unwrap(), "(no output)");
    }

    #[tokio::test]
    async fn output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        c.shell.max_output_chars = 10;
        let out = shell(&c, args("printf 'abcdefghijklmnop'", None)).await.unwrap();
        assert_eq!(out, "abcdefghij");
    }

    #[tokio::test]
    async fn timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = shell(&ctx(dir.path()), args("sleep 5", Some(1))).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 1s"));
    }
}
