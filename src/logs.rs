//! Tracing setup: a stderr layer plus an optional plain-text file layer.
//!
//! Each process start gets its own file, `<logs_dir>/<YYYYmmdd_HHMMSS>.log`,
//! so a restart never appends to the previous run's log.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Local};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` when set, else `info` (`debug` with `verbose`).
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

pub fn log_file_name(now: &DateTime<Local>) -> String {
    format!("{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Install the global subscriber. With `logs_dir`, events are also written
/// (without ANSI colours) to a fresh file there, whose path is returned.
pub fn init(verbose: bool, logs_dir: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let (file_layer, path) = match logs_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let path = dir.join(log_file_name(&Local::now()));
            let file = File::create(&path)
                .with_context(|| format!("create log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(path)
}
