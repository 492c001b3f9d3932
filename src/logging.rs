//! Logging setup for hosts embedding the index
//!
//! Console output always; a daily rolling file when a directory is configured.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix inside the configured directory
pub const LOG_FILE_PREFIX: &str = "photon-index.log";

/// Parse a level name, falling back to INFO
pub fn parse_level(level: &str) -> tracing::Level {
    level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO)
}

/// Install the global tracing subscriber
///
/// Fails with `Error::Config` if a global subscriber is already set.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let file_layer = match &cfg.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Config(format!("Failed to create log directory: {}", e)))?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            Some(fmt::layer().with_writer(file_appender).with_ansi(false))
        }
        None => None,
    };

    let log_level = parse_level(&cfg.level);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(cfg.ansi),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install subscriber: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), tracing::Level::DEBUG);
        assert_eq!(parse_level("WARN"), tracing::Level::WARN);
        assert_eq!(parse_level("nonsense"), tracing::Level::INFO);
    }

    #[test]
    fn test_init_twice_is_reported() {
        let cfg = LoggingConfig {
            level: "warn".to_string(),
            directory: None,
            ansi: false,
        };
        // Another test may have won the race; either way the second call must fail
        let _ = init_logging(&cfg);
        assert!(matches!(init_logging(&cfg), Err(Error::Config(_))));
    }
}
