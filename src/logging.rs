//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Checked before `RUST_LOG`.
pub const LOG_ENV: &str = "HUBCACHE_LOG";

/// Install the global subscriber.
///
/// With a log directory configured, output goes to a daily-rotated file
/// through a background writer; the returned guard flushes it on drop and
/// must be held for the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let directive = filter_directive(
    std::env::var(LOG_ENV).ok(),
    std::env::var("RUST_LOG").ok(),
    &config.level,
  );
  let filter =
    EnvFilter::try_new(&directive).map_err(|e| eyre!("Invalid log filter '{}': {}", directive, e))?;

  match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
      let appender = tracing_appender::rolling::daily(directory, "hubcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(None)
    }
  }
}

/// First non-empty of the crate variable, `RUST_LOG`, and the configured level.
fn filter_directive(crate_env: Option<String>, rust_log: Option<String>, level: &str) -> String {
  crate_env
    .into_iter()
    .chain(rust_log)
    .find(|v| !v.trim().is_empty())
    .unwrap_or_else(|| level.to_string())
}
