//! Logging configuration using tracing
//!
//! Logs go to stderr, or to a file through a non-blocking writer, filtered by
//! the RUST_LOG environment variable.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber
///
/// Defaults to "warn" when RUST_LOG is unset. Useful values:
/// - `RUST_LOG=items_cache=debug` - cache hits, misses and invalidations
/// - `RUST_LOG=items_cache=trace` - every lookup and eviction
///
/// When `log_file` is set the returned guard must be held until exit so
/// buffered lines are flushed.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
  let registry = tracing_subscriber::registry().with(env_filter);

  match log_file {
    Some(path) => {
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      registry
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      registry
        .with(
          fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_init_twice_is_an_error_not_a_panic() {
    // First call may succeed or fail depending on test order
    let _ = init(None);
    assert!(init(None).is_err());
  }

  #[test]
  fn test_log_file_without_name_is_rejected() {
    assert!(init(Some(Path::new("/"))).is_err());
  }
}
