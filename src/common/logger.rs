//! Logging setup of the worker.

use std::path::Path;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Initialize the global logger.
///
/// Crate events are logged at `level` into the file at `log_path`,
/// appended across restarts. Chatty dependencies are capped at `WARN`.
///
/// # Errors
/// Returns an error for an unknown level, an unwritable log file, or a
/// second initialization in the same process.
pub fn init_logger(log_path: impl AsRef<Path>, level: &str) -> anyhow::Result<()> {
    let level = level
        .parse::<LevelFilter>()
        .with_context(|| format!("unknown log level {level}"))?;
    let filter = Targets::new()
        .with_target("opendal", LevelFilter::WARN)
        .with_default(level);

    let path = log_path.as_ref();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .context("the global logger was already initialized")?;
    Ok(())
}
