//! Integration tests: loading `config.yaml` from disk, the bundled
//! template, secret references and the derived directory layout.

use std::path::Path;

use kkbot::config::{Config, TEMPLATE};
use tempfile::TempDir;

#[tokio::test]
async fn template_file_parses() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates/config.yaml");
    let cfg = Config::load(&path).await.expect("template should load");
    assert_eq!(cfg.llm.api_key, "$OPENAI_API_KEY");
    assert_eq!(cfg.agent.max_history_messages, 200);
    assert!(cfg.channels.discord.as_ref().unwrap().require_mention);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), TEMPLATE);
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = Config::load(&dir.path().join("config.yaml")).await.unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[tokio::test]
async fn invalid_values_are_rejected_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "llm:\n  model: \"\"\n").unwrap();
    let err = Config::load(&path).await.unwrap_err();
    assert!(format!("{err:#}").contains("llm.model"));
}

#[test]
fn secret_references_resolve_from_env() {
    std::env::set_var("KKBOT_TEST_BRAVE_KEY", "brave-123");
    let cfg = Config::from_yaml(
        "tools:\n  web:\n    brave_api_key: $KKBOT_TEST_BRAVE_KEY\nllm:\n  api_key: $KKBOT_TEST_UNSET_VAR\n",
    )
    .unwrap();
    assert_eq!(cfg.tools.web.resolved_brave_key().as_deref(), Some("brave-123"));
    assert_eq!(cfg.llm.resolved_api_key(), "");

    let literal = Config::from_yaml("tools:\n  web:\n    brave_api_key: plain-key\n").unwrap();
    assert_eq!(literal.tools.web.resolved_brave_key().as_deref(), Some("plain-key"));
}

#[tokio::test]
async fn ensure_dirs_creates_workspace_tree() {
    let dir = TempDir::new().unwrap();
    let yaml = format!(
        "workspace: {}\nskills_dir: {}\n",
        dir.path().join("ws").display(),
        dir.path().join("skills").display()
    );
    let cfg = Config::from_yaml(&yaml).unwrap();
    cfg.ensure_dirs().await.unwrap();

    assert!(cfg.sessions_dir().is_dir());
    assert!(cfg.logs_dir().is_dir());
    assert!(cfg.memory_file().parent().unwrap().is_dir());
    assert!(cfg.skills_dir().is_dir());
    assert!(cfg.sessions_dir().starts_with(dir.path().join("ws")));
}
