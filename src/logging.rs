use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSection;

/// Install the global subscriber.
///
/// Logs go to stderr, and additionally to a daily-rolling file when
/// `logging.file` is set. RUST_LOG overrides the configured level. Keep the
/// returned guard alive for the life of the process so buffered file output
/// is flushed.
pub fn init(config: &LoggingSection) -> Result<Option<WorkerGuard>> {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

  let (file_layer, guard) = if config.file {
    let dir = log_dir()?;
    let appender = tracing_appender::rolling::daily(&dir, "kibble.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
      .with_ansi(false)
      .with_writer(writer);
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("kibble").join("logs"))
}
