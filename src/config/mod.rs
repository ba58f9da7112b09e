//! YAML configuration, loaded once at startup and read-only afterwards.
//!
//! Every field has a default, so an empty document is a valid config.
//! Secret-bearing fields accept `$ENV_NAME` references which are resolved
//! when the value is used, not when the file is parsed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::utils::resolve_env_ref;

/// Template written by `kkbot init`.
pub const TEMPLATE: &str = include_str!("../../templates/config.yaml");

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    /// Working directory for tools, sessions, memory and logs.
    /// Defaults to `<kkbot_home>/workspace`.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// Directory scanned for skill documents. Defaults to `<kkbot_home>/skills`.
    #[serde(default)]
    pub skills_dir: Option<PathBuf>,
}

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Plain key or `$ENV_NAME` reference. May be empty for local servers.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Attempts per provider before giving up on a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Mark the system prompt and per-turn context with `cache_control`.
    #[serde(default)]
    pub cache_control: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            cache_control: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl LlmConfig {
    /// Resolved API key; empty when unset.
    pub fn resolved_api_key(&self) -> String {
        resolve_env_ref(&self.api_key).unwrap_or_default()
    }
}

/// Agent loop behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Non-system messages kept per conversation. `0` keeps everything.
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Send a `[Context]` message (time, chat key) ahead of each turn.
    #[serde(default = "default_true")]
    pub inject_context: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_tool_rounds: default_max_tool_rounds(),
            max_history_messages: default_max_history_messages(),
            tool_timeout_secs: default_tool_timeout_secs(),
            inject_context: true,
        }
    }
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// Per-tool settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ShellConfig {
    #[serde(default = "default_shell_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_shell_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    /// Brave Search subscription token (plain or `$ENV_NAME`).
    #[serde(default)]
    pub brave_api_key: Option<String>,
    /// Proxy URL for web tools. Unset falls back to the usual proxy env vars.
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default = "default_max_output_chars")]
    pub fetch_max_chars: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            brave_api_key: None,
            http_proxy: None,
            fetch_max_chars: default_max_output_chars(),
        }
    }
}

impl WebConfig {
    pub fn resolved_brave_key(&self) -> Option<String> {
        self.brave_api_key.as_deref().and_then(resolve_env_ref)
    }
}

/// Channel connector settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelsConfig {
    /// Discord bot configuration. Optional so the bot can run without it.
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    /// Bot token, plain or `$ENV_NAME`.
    pub token: String,
    /// Group messages are answered only when the bot is mentioned.
    #[serde(default = "default_true")]
    pub require_mention: bool,
}

impl DiscordConfig {
    /// `DISCORD_TOKEN` wins over the configured value.
    pub fn resolved_token(&self) -> Option<String> {
        std::env::var("DISCORD_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| resolve_env_ref(&self.token))
    }
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_retries() -> usize {
    3
}
fn default_request_timeout_secs() -> u64 {
    90
}
fn default_system_prompt() -> String {
    "You are kkbot.".into()
}
fn default_max_tool_rounds() -> usize {
    20
}
fn default_max_history_messages() -> usize {
    200
}
fn default_tool_timeout_secs() -> u64 {
    120
}
fn default_shell_timeout_secs() -> u64 {
    30
}
fn default_max_output_chars() -> usize {
    8000
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Read and parse a YAML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_yaml(&contents)?;
        tracing::debug!(
            path = %path.display(),
            model = %config.llm.model,
            max_tool_rounds = config.agent.max_tool_rounds,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
        // An empty file deserialises as unit, not as an empty mapping.
        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(contents).context("failed to parse config YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.api_base.trim().is_empty() {
            anyhow::bail!("config: llm.api_base must not be empty");
        }
        if self.llm.model.trim().is_empty() {
            anyhow::bail!("config: llm.model must not be empty");
        }
        if self.llm.max_tokens == 0 {
            anyhow::bail!("config: llm.max_tokens must be greater than 0");
        }
        if self.agent.max_tool_rounds == 0 {
            anyhow::bail!("config: agent.max_tool_rounds must be at least 1");
        }
        if self.agent.tool_timeout_secs == 0 {
            anyhow::bail!("config: agent.tool_timeout_secs must be greater than 0");
        }
        if self.tools.shell.default_timeout_secs == 0 {
            anyhow::bail!("config: tools.shell.default_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    /// Directory that tools run in and that holds sessions, memory and logs.
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| crate::kkbot_home().join("workspace"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace_dir().join("sessions")
    }

    pub fn memory_file(&self) -> PathBuf {
        self.workspace_dir().join("memory").join("MEMORY.md")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace_dir().join("logs")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.skills_dir
            .clone()
            .unwrap_or_else(|| crate::kkbot_home().join("skills"))
    }

    /// Create the workspace directory tree.
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        let memory_dir = self.workspace_dir().join("memory");
        for dir in [
            self.workspace_dir(),
            self.sessions_dir(),
            memory_dir,
            self.logs_dir(),
            self.skills_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_yaml("").unwrap();
        assert_eq!(cfg.llm.api_base, "https://api.openai.com/v1");
        assert_eq!(cfg.llm.model, "gpt-4o");
        assert_eq!(cfg.llm.max_tokens, 4096);
        assert_eq!(cfg.agent.system_prompt, "You are kkbot.");
        assert_eq!(cfg.agent.max_tool_rounds, 20);
        assert!(cfg.agent.inject_context);
        assert_eq!(cfg.tools.shell.default_timeout_secs, 30);
        assert!(cfg.channels.discord.is_none());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let cfg = Config::from_yaml("agent:\n  max_tool_rounds: 5\n").unwrap();
        assert_eq!(cfg.agent.max_tool_rounds, 5);
        assert_eq!(cfg.agent.tool_timeout_secs, 120);
        assert_eq!(cfg.llm.max_retries, 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_yaml("agent:\n  max_rounds: 5\n").unwrap_err();
        assert!(format!("{err:#}").contains("max_rounds"));
    }

    #[test]
    fn zero_rounds_fail_validation() {
        let err = Config::from_yaml("agent:\n  max_tool_rounds: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_tool_rounds"));
    }

    #[test]
    fn template_parses() {
        let cfg = Config::from_yaml(TEMPLATE).unwrap();
        assert!(cfg.channels.discord.is_some());
    }

    #[test]
    fn explicit_workspace_drives_derived_dirs() {
        let cfg = Config::from_yaml("workspace: /tmp/kk-ws\n").unwrap();
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/tmp/kk-ws/sessions"));
        assert_eq!(cfg.memory_file(), PathBuf::from("/tmp/kk-ws/memory/MEMORY.md"));
    }
}
