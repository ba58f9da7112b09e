//! kkbot: a chat bot that drives an OpenAI-compatible model with tools.
//!
//! This library crate exposes every module so integration tests
//! (under `tests/`) can reach them.

pub mod agent;
pub mod comm;
pub mod config;
pub mod discord;
pub mod logs;
pub mod memory;
pub mod models;
pub mod prompt;
pub mod session;
pub mod skills;
pub mod tools;
pub mod utils;

/// Return the kkbot home directory.
///
/// Resolution order:
/// 1. `KKBOT_HOME` environment variable
/// 2. `$HOME/.kkbot`
pub fn kkbot_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("KKBOT_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".kkbot")
    }
}
