//! Shared utility helpers.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Truncate a string to `max` bytes, appending `…` if trimmed.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Keep the first `max_chars` characters of `s`.
///
/// Returns the kept prefix and whether anything was cut.
pub fn take_chars(s: &str, max_chars: usize) -> (&str, bool) {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => (&s[..idx], true),
        None => (s, false),
    }
}

/// Expand a leading `~` and anchor relative paths at `base`.
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let expanded = if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw))
    } else if let Some(rest) = raw.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Turn a conversation key such as `discord:123/4` into a file stem.
pub fn safe_file_stem(key: &str) -> String {
    key.replace([':', '/', '\\'], "_")
}

/// Resolve a `$ENV_NAME` reference; any other value is returned as is.
///
/// Empty results (unset variable, empty literal) map to `None`.
pub fn resolve_env_ref(value: &str) -> Option<String> {
    let resolved = match value.strip_prefix('$') {
        Some(name) if !name.is_empty() => std::env::var(name).ok()?,
        _ => value.to_string(),
    };
    if resolved.trim().is_empty() {
        None
    } else {
        Some(resolved)
    }
}

/// Inline `bytes` as a `data:` URL of type `mime`.
pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// Image MIME type for a file name, from its extension.
pub fn image_mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
