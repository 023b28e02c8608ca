use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to `path` so the interactive terminal stays clean.
pub fn init_logging(path: &Path, level: &str) -> Result<()> {
    let log_file = Arc::new(
        std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?,
    );
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter(level))
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(log_file)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    info!(path = %path.display(), "logging initialized");
    Ok(())
}

/// Log to stderr; used by the bridge, whose stderr the gateway captures.
pub fn init_stderr_logging(level: &str) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter(level))
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
