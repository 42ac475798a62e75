//! Tracing setup for the command line and the terminal UI.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter. `RUST_LOG` is the fallback.
pub const LOG_ENV: &str = "RDECK_LOG";
/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "rdeck.log";

/// Keeps the file writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Log to stderr for one-shot commands.
pub fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("warn"))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Log to a daily rolling file in the data directory, leaving the terminal
/// to the UI.
pub fn init_file(data_dir: &Path) -> Result<LoggingGuard> {
    std::fs::create_dir_all(data_dir).context("failed to create data directory")?;
    let appender = RollingFileAppender::new(Rotation::DAILY, data_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    // A subscriber may already be installed when embedded; keep the guard anyway.
    let _ = tracing_subscriber::registry()
        .with(filter("info"))
        .with(file_layer)
        .try_init();

    tracing::info!(log_dir = %data_dir.display(), "logging initialized");
    Ok(LoggingGuard { _guard: guard })
}
