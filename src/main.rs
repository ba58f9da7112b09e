use kkbot::agent::{self, AgentLoop, Dispatcher};
use kkbot::comm;
use kkbot::config::{self, Config};
use kkbot::discord;
use kkbot::logs;
use kkbot::memory::MemoryStore;
use kkbot::models::{ModelProvider, ProviderManager};
use kkbot::prompt::PromptBuilder;
use kkbot::session::SessionManager;
use kkbot::skills::SkillRegistry;
use kkbot::tools::{ToolContext, ToolRegistry};
use kkbot::utils;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kkbot", version, about = "Chat bot agent driving an OpenAI-compatible model")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a template config and create the workspace directories
    Init,
    /// Run the bot until Ctrl-C
    Start,
    /// Debug utilities
    Debug {
        #[command(subcommand)]
        action: DebugAction,
    },
}

#[derive(Subcommand, Debug)]
enum DebugAction {
    /// Run a single agent turn and print the reply
    Run {
        /// User message to send
        #[arg(long)]
        message: String,
        /// Conversation key to run the turn in
        #[arg(long, default_value = "debug:cli")]
        chat: String,
        /// Image file to attach (repeatable)
        #[arg(long = "image")]
        images: Vec<PathBuf>,
    },
}

/// Long-lived pieces shared by `start` and `debug run`.
struct Runtime {
    agent: Arc<AgentLoop>,
    sessions: Arc<SessionManager>,
}

async fn build_runtime(cfg: &Config) -> anyhow::Result<Runtime> {
    cfg.ensure_dirs().await?;

    let skills = SkillRegistry::load(&cfg.skills_dir())?;
    let memory = Arc::new(MemoryStore::open_path(cfg.memory_file()));
    let prompt = PromptBuilder::new(&cfg.agent.system_prompt, &skills, memory.clone());
    let provider: Arc<dyn ModelProvider> = Arc::new(ProviderManager::from_config(&cfg.llm)?);
    let tools = ToolRegistry::new(
        ToolContext::from_config(cfg, memory)?,
        cfg.agent.tool_timeout(),
    );
    info!(
        skills = skills.len(),
        tools = tools.names().len(),
        model = %cfg.llm.model,
        "runtime assembled"
    );

    Ok(Runtime {
        agent: Arc::new(AgentLoop::from_config(cfg, provider, prompt, tools)),
        sessions: Arc::new(SessionManager::new(cfg.sessions_dir())),
    })
}

async fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        anyhow::bail!(
            "config file {} not found (run `kkbot init` to create one)",
            path.display()
        );
    }
    Config::load(path).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| kkbot::kkbot_home().join("config.yaml"));

    match cli.command {
        Command::Init => {
            logs::init(cli.verbose, None)?;
            init(&config_path).await
        }
        Command::Debug {
            action: DebugAction::Run { message, chat, images },
        } => {
            logs::init(cli.verbose, None)?;
            let cfg = load_config(&config_path).await?;
            debug_run(&cfg, &chat, &message, &images).await
        }
        Command::Start => {
            let cfg = load_config(&config_path).await?;
            let log_file = logs::init(cli.verbose, Some(&cfg.logs_dir()))?;
            if let Some(path) = log_file {
                info!(path = %path.display(), "logging to file");
            }
            start(cfg).await
        }
    }
}

async fn init(config_path: &Path) -> anyhow::Result<()> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(config_path, config::TEMPLATE)
            .await
            .with_context(|| format!("write {}", config_path.display()))?;
        println!("Wrote config template: {}", config_path.display());
    }

    let cfg = Config::load(config_path).await?;
    cfg.ensure_dirs().await?;
    println!("Workspace: {}", cfg.workspace_dir().display());
    println!("Skills:    {}", cfg.skills_dir().display());
    println!("Edit the config, then run `kkbot start`.");
    Ok(())
}

async fn load_image(path: &Path) -> anyhow::Result<String> {
    let mime = utils::image_mime_for(path)
        .with_context(|| format!("{} is not a png, jpeg, gif or webp image", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    Ok(utils::data_url(mime, &bytes))
}

async fn debug_run(cfg: &Config, chat: &str, message: &str, image_paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut images = Vec::with_capacity(image_paths.len());
    for path in image_paths {
        images.push(load_image(path).await?);
    }
    let rt = build_runtime(cfg).await?;
    let mut session = rt.sessions.lock(chat).await?;
    let result = rt.agent.run_turn_with_images(&mut session, message, &images).await;
    rt.sessions.persist(&mut session).await?;
    let outcome = result?;

    println!("{}", outcome.reply);
    eprintln!(
        "[rounds: {}, model calls: {}{}]",
        outcome.rounds,
        outcome.model_calls,
        if outcome.restart_requested {
            ", restart requested (ignored in debug mode)"
        } else {
            ""
        }
    );
    Ok(())
}

async fn start(cfg: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting kkbot");
    let rt = build_runtime(&cfg).await?;

    let shutdown = CancellationToken::new();
    let restart = CancellationToken::new();

    let require_mention = cfg
        .channels
        .discord
        .as_ref()
        .map(|d| d.require_mention)
        .unwrap_or(true);
    let dispatcher = Arc::new(
        Dispatcher::new(rt.agent.clone(), rt.sessions.clone(), restart.clone())
            .require_mention(require_mention),
    );
    // Subscribe before any connector can publish.
    let dispatch_handle = dispatcher.spawn(comm::subscribe(), shutdown.clone());

    match &cfg.channels.discord {
        Some(discord_cfg) => {
            if let Err(e) = discord::init(discord_cfg).await {
                warn!(error = %format!("{e:#}"), "Discord connector disabled");
            }
        }
        None => warn!("no channel configured; the bot will not receive messages"),
    }

    info!("kkbot ready");

    let restarting = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for Ctrl-C")?;
            info!("received Ctrl-C, shutting down");
            false
        }
        _ = restart.cancelled() => {
            info!("restart requested, shutting down for re-exec");
            true
        }
    };

    // Stop accepting messages, then let running turns finish.
    shutdown.cancel();
    let _ = dispatch_handle.await;
    let in_flight = agent::in_flight_count();
    if in_flight > 0 {
        info!(in_flight, "waiting for in-flight agent turns to drain");
    }
    agent::drain_in_flight(Duration::from_secs(30)).await;

    if restarting {
        return reexec();
    }
    info!("shutdown complete");
    Ok(())
}

/// Replace this process with a fresh copy of the same binary and arguments.
#[cfg(unix)]
fn reexec() -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("locate current executable")?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    info!(exe = %exe.display(), "re-executing");
    // `exec` only returns on failure.
    let err = std::process::Command::new(&exe).args(&args).exec();
    Err(err).with_context(|| format!("re-exec {}", exe.display()))
}

#[cfg(not(unix))]
fn reexec() -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    info!(exe = %exe.display(), "spawning replacement process");
    std::process::Command::new(&exe)
        .args(&args)
        .spawn()
        .with_context(|| format!("spawn {}", exe.display()))?;
    std::process::exit(0);
}
