//! Built-in `edit_file` and `patch_file` tools: exact-text replacement.
//!
//! Both require every `old` snippet to occur exactly once so an edit can
//! never land in the wrong place. `patch_file` is all-or-nothing: the
//! file is written only when every patch applies.

use serde::Deserialize;

use crate::tools::ToolContext;
use crate::utils::resolve_path;

#[derive(Debug, Deserialize)]
pub struct EditFileArgs {
    pub path: String,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Deserialize)]
pub struct Patch {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Deserialize)]
pub struct PatchFileArgs {
    pub path: String,
    pub patches: Vec<Patch>,
}

/// Replace the single occurrence of `old` with `new`.
fn replace_unique(text: &str, old: &str, new: &str) -> Result<String, String> {
    if old.is_empty() {
        return Err("`old` must not be empty".into());
    }
    match text.matches(old).count() {
        0 => Err("`old` not found in file".into()),
        1 => Ok(text.replacen(old, new, 1)),
        n => Err(format!("`old` matches {n} times (must be unique)")),
    }
}

pub async fn edit_file(ctx: &ToolContext, args: EditFileArgs) -> anyhow::Result<String> {
    let path = resolve_path(&ctx.workspace, &args.path);
    let existing = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow::anyhow!("edit_file: cannot read {}: {e}", path.display()))?;

    let updated = replace_unique(&existing, &args.old, &args.new)
        .map_err(|reason| anyhow::anyhow!("edit_file: {reason}"))?;

    tokio::fs::write(&path, updated)
        .await
        .map_err(|e| anyhow::anyhow!("edit_file: cannot write {}: {e}", path.display()))?;
    Ok(format!("Edited {}", path.display()))
}

/// Apply `patches` in order against the evolving text.
pub async fn patch_file(ctx: &ToolContext, args: PatchFileArgs) -> anyhow::Result<String> {
    if args.patches.is_empty() {
        anyhow::bail!("patch_file: `patches` must not be empty");
    }
    let path = resolve_path(&ctx.workspace, &args.path);
    let mut text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow::anyhow!("patch_file: cannot read {}: {e}", path.display()))?;

    let mut errors = Vec::new();
    for (i, patch) in args.patches.iter().enumerate() {
        match replace_unique(&text, &patch.old, &patch.new) {
            Ok(next) => text = next,
            Err(reason) => errors.push(format!("Patch {i}: {reason}")),
        }
    }
    if !errors.is_empty() {
        anyhow::bail!(
            "patch_file: no changes written to {}\n{}",
            path.display(),
            errors.join("\n")
        );
    }

    tokio::fs::write(&path, text)
        .await
        .map_err(|e| anyhow::anyhow!("patch_file: cannot write {}: {e}", path.display()))?;
    Ok(format!(
        "Applied {} patches to {}",
        args.patches.len(),
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_match_is_replaced() {
        assert_eq!(replace_unique("a b c", "b", "B").unwrap(), "a B c");
    }

    #[test]
    fn ambiguous_and_missing_matches_fail() {
        assert_eq!(
            replace_unique("x x", "x", "y").unwrap_err(),
            "`old` matches 2 times (must be unique)"
        );
        assert_eq!(replace_unique("abc", "z", "y").unwrap_err(), "`old` not found in file");
        assert!(replace_unique("abc", "", "y").is_err());
    }
}
