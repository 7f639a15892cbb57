//! Logging infrastructure for sonda
//!
//! Provides tracing setup with:
//! - stdout output by default
//! - Optional file output with daily rotation
//! - Environment-based log level configuration (RUST_LOG wins)

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
pub use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Optional log directory for file output
    pub log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            level: "info".to_string(),
        }
    }
}

/// Initialize the logging subsystem.
///
/// Returns a guard that must stay alive for the lifetime of the process
/// when file output is configured; dropping it flushes and stops the
/// background writer. Stdout logging returns `None`.
///
/// # Examples
///
/// ```no_run
/// use sonda_common::logging::{init_logging, LogConfig};
///
/// // Default: stdout with info level
/// let _guard = init_logging(LogConfig::default()).unwrap();
/// ```
pub fn init_logging(config: LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    // Build filter from config and RUST_LOG env var
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.log_dir {
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(true)
                        .with_thread_ids(false),
                )
                .init();
            Ok(None)
        }
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;

            let file_appender = tracing_appender::rolling::daily(dir, "sonda.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_ansi(false) // No ANSI colors in log files
                        .with_writer(non_blocking),
                )
                .init();
            Ok(Some(guard))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.log_dir.is_none());
    }
}
