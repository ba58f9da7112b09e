//! Integration tests for the tool registry and the built-in tools.

use std::sync::Arc;
use std::time::Duration;

use kkbot::memory::MemoryStore;
use kkbot::models::ToolCall;
use kkbot::tools::{ToolContext, ToolRegistry, ToolResult, WebClient};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper: create a fresh temp workspace.
fn workspace() -> TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}

fn registry_with(ws: &TempDir, web: WebClient, timeout: Duration) -> ToolRegistry {
    let memory = Arc::new(MemoryStore::open(&ws.path().join("memory")));
    ToolRegistry::new(ToolContext::new(ws.path(), memory, web), timeout)
}

fn registry(ws: &TempDir) -> ToolRegistry {
    registry_with(ws, WebClient::new(None, None, 8000).unwrap(), Duration::from_secs(10))
}

async fn run(reg: &ToolRegistry, name: &str, args: Value) -> ToolResult {
    reg.execute(&ToolCall {
        id: format!("call_{name}"),
        name: name.into(),
        arguments: args,
    })
    .await
}

// ── registry ─────────────────────────────────────────────────

#[tokio::test]
async fn unknown_tool_names_the_offender() {
    let ws = workspace();
    let res = run(&registry(&ws), "format_disk", json!({"drive": "c"})).await;
    assert!(res.is_error);
    assert!(res.content.contains("format_disk"), "{}", res.content);
    assert!(res.content.contains("Available tools:"));
    assert!(res.content.contains("read_file"));
    assert_eq!(res.tool_call_id, "call_format_disk");
}

#[tokio::test]
async fn missing_required_field_lists_schema() {
    let ws = workspace();
    let res = run(&registry(&ws), "edit_file", json!({"path": "a.txt", "old": "x"})).await;
    assert!(res.is_error);
    assert!(res.content.contains("missing field `new`"), "{}", res.content);
    assert!(res.content.contains("Expected schema"));
}

#[tokio::test]
async fn null_arguments_work_for_tools_without_fields() {
    let ws = workspace();
    let res = run(&registry(&ws), "recall_memory", Value::Null).await;
    assert!(!res.is_error);
    assert_eq!(res.content, "(no memory yet)");
}

// ── files ────────────────────────────────────────────────────

#[tokio::test]
async fn write_then_read() {
    let ws = workspace();
    let reg = registry(&ws);
    let res = run(&reg, "write_file", json!({"path": "a/b/note.txt", "content": "hello"})).await;
    assert!(!res.is_error, "{}", res.content);
    assert!(res.content.starts_with("Wrote 5 bytes to "));
    assert!(ws.path().join("a/b/note.txt").exists());

    let res = run(&reg, "read_file", json!({"path": "a/b/note.txt"})).await;
    assert_eq!(res.content, "hello");
    assert!(!res.is_error);
}

#[tokio::test]
async fn read_missing_file_is_an_error() {
    let ws = workspace();
    let res = run(&registry(&ws), "read_file", json!({"path": "ghost.txt"})).await;
    assert!(res.is_error);
    assert!(res.content.contains("file not found"));
    assert!(res.content.contains("ghost.txt"));
}

#[tokio::test]
async fn edit_requires_unique_match() {
    let ws = workspace();
    let file = ws.path().join("code.rs");
    std::fs::write(&file, "let a = 1;\nlet b = 1;\n").unwrap();
    let reg = registry(&ws);

    let res = run(&reg, "edit_file", json!({"path": "code.rs", "old": "= 1;", "new": "= 2;"})).await;
    assert!(res.is_error);
    assert!(res.content.contains("`old` matches 2 times (must be unique)"));

    let res = run(&reg, "edit_file", json!({"path": "code.rs", "old": "b = 1", "new": "b = 2"})).await;
    assert!(!res.is_error, "{}", res.content);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "let a = 1;\nlet b = 2;\n");
}

#[tokio::test]
async fn patch_is_all_or_nothing() {
    let ws = workspace();
    let file = ws.path().join("conf.txt");
    std::fs::write(&file, "alpha\nbeta\ngamma\n").unwrap();
    let reg = registry(&ws);

    let res = run(
        &reg,
        "patch_file",
        json!({"path": "conf.txt", "patches": [
            {"old": "alpha", "new": "ALPHA"},
            {"old": "delta", "new": "DELTA"}
        ]}),
    )
    .await;
    assert!(res.is_error);
    assert!(res.content.contains("no changes written"));
    assert!(res.content.contains("Patch 1: `old` not found in file"), "{}", res.content);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "alpha\nbeta\ngamma\n");

    let res = run(
        &reg,
        "patch_file",
        json!({"path": "conf.txt", "patches": [
            {"old": "alpha", "new": "ALPHA"},
            {"old": "gamma", "new": "GAMMA"}
        ]}),
    )
    .await;
    assert!(!res.is_error, "{}", res.content);
    assert!(res.content.starts_with("Applied 2 patches to "));
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "ALPHA\nbeta\nGAMMA\n");
}

// ── memory ───────────────────────────────────────────────────

#[tokio::test]
async fn save_and_recall_memory() {
    let ws = workspace();
    let reg = registry(&ws);

    let res = run(&reg, "save_memory", json!({"content": "   "})).await;
    assert!(res.is_error);

    let res = run(&reg, "save_memory", json!({"text": "prefers metric units"})).await;
    assert_eq!(res.content, "Memory saved.");
    let res = run(&reg, "recall_memory", json!({})).await;
    assert_eq!(res.content, "prefers metric units");
}

// ── shell ────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn shell_reports_exit_code_without_failing() {
    let ws = workspace();
    let res = run(&registry(&ws), "shell", json!({"cmd": "echo hi; exit 2"})).await;
    assert!(!res.is_error);
    assert_eq!(res.content, "hi\n[exit code: 2]");
}

#[cfg(unix)]
#[tokio::test]
async fn registry_timeout_bounds_long_tools() {
    let ws = workspace();
    let reg = registry_with(&ws, WebClient::new(None, None, 8000).unwrap(), Duration::from_secs(1));
    let started = std::time::Instant::now();
    let res = run(&reg, "shell", json!({"cmd": "sleep 10"})).await;
    assert!(res.is_error);
    assert!(res.content.contains("tool `shell` timed out after 1s"), "{}", res.content);
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ── web ──────────────────────────────────────────────────────

#[tokio::test]
async fn web_search_requires_a_key() {
    let ws = workspace();
    let res = run(&registry(&ws), "web_search", json!({"query": "rust"})).await;
    assert!(res.is_error);
    assert!(res.content.contains("API key not configured"));
}

#[tokio::test]
async fn web_search_renders_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "tokio"))
        .and(query_param("count", "2"))
        .and(header("X-Subscription-Token", "brave-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "web": {"results": [
                {"title": "Tokio", "url": "https://tokio.rs", "description": "An async <b>runtime</b>"}
            ]}
        })))
        .mount(&server)
        .await;

    let ws = workspace();
    let web = WebClient::new(None, Some("brave-key".into()), 8000)
        .unwrap()
        .with_search_endpoint(format!("{}/search", server.uri()));
    let reg = registry_with(&ws, web, Duration::from_secs(10));

    let res = run(&reg, "web_search", json!({"query": "tokio", "count": 2})).await;
    assert!(!res.is_error, "{}", res.content);
    assert_eq!(
        res.content,
        "Search results for: tokio\n\n1. Tokio\n   https://tokio.rs\n   An async runtime"
    );
}

#[tokio::test]
async fn web_fetch_strips_markup_and_truncates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><script>var x;</script><p>Hello &amp; welcome</p></html>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let ws = workspace();
    let reg = registry(&ws);

    let res = run(&reg, "web_fetch", json!({"url": format!("{}/page", server.uri())})).await;
    assert_eq!(res.content, "Hello & welcome");

    let res = run(
        &reg,
        "web_fetch",
        json!({"url": format!("{}/page", server.uri()), "max_chars": 5}),
    )
    .await;
    assert_eq!(res.content, "Hello\n\n[truncated, 15 chars total]");

    let res = run(&reg, "web_fetch", json!({"url": format!("{}/missing", server.uri())})).await;
    assert!(res.is_error);
    assert!(res.content.contains("404"));
}
