//! Index configuration
//!
//! Settings are layered with the `config` crate:
//!
//! ```text
//! built-in defaults
//!   └─→ optional TOML file (`index.toml`)
//!        └─→ environment (`PHOTON_INDEX__FLUSH_INTERVAL_SECS=60`, `PHOTON_INDEX__LOG__LEVEL=debug`)
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PHOTON_INDEX";

/// Top-level configuration for the index storage engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Snapshot written by the flush thread and at shutdown
    pub snapshot_path: PathBuf,

    /// Read-only seed snapshot, loaded when the primary one is missing or corrupt
    pub initial_snapshot_path: Option<PathBuf>,

    /// Seconds between background flushes
    pub flush_interval_secs: u64,

    /// OperationProcessor dequeue timeout in milliseconds
    pub processor_poll_ms: u64,

    /// TwoQueueCache budget for paged files (KB)
    pub cache_max_kb: usize,

    /// Page size for paged files (bytes, power of two)
    pub page_size: usize,

    /// Logging settings
    pub log: LoggingConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("data/index.idx"),
            initial_snapshot_path: None,
            flush_interval_secs: 180,
            processor_poll_ms: 100,
            cache_max_kb: 1024,
            page_size: 4096,
            log: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for daily rolling log files; console only when unset
    pub directory: Option<PathBuf>,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            ansi: true,
        }
    }
}

impl IndexConfig {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;

        let cfg: IndexConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: IndexConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_secs == 0 {
            return Err(Error::Config("flush_interval_secs must be > 0".to_string()));
        }
        if self.processor_poll_ms == 0 {
            return Err(Error::Config("processor_poll_ms must be > 0".to_string()));
        }
        if !self.page_size.is_power_of_two() || self.page_size < 64 {
            return Err(Error::Config(format!(
                "page_size must be a power of two >= 64, got {}",
                self.page_size
            )));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn processor_poll(&self) -> Duration {
        Duration::from_millis(self.processor_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = IndexConfig::default();
        assert_eq!(cfg.flush_interval_secs, 180);
        assert_eq!(cfg.flush_interval(), Duration::from_secs(180));
        assert_eq!(cfg.log.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_toml() -> Result<()> {
        let cfg = IndexConfig::from_toml_str(
            r#"
            snapshot_path = "/tmp/idx/index.idx"
            flush_interval_secs = 30

            [log]
            level = "debug"
            "#,
        )?;
        assert_eq!(cfg.snapshot_path, PathBuf::from("/tmp/idx/index.idx"));
        assert_eq!(cfg.flush_interval_secs, 30);
        assert_eq!(cfg.log.level, "debug");
        // Unspecified fields keep their defaults
        assert_eq!(cfg.page_size, 4096);
        Ok(())
    }

    #[test]
    fn test_validation() {
        assert!(IndexConfig::from_toml_str("flush_interval_secs = 0").is_err());
        assert!(IndexConfig::from_toml_str("page_size = 1000").is_err());
        assert!(IndexConfig::from_toml_str("processor_poll_ms = 0").is_err());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let temp_dir = std::env::temp_dir().join(format!("index_config_{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir)
            .map_err(|e| Error::Config(format!("Failed to create dir: {}", e)))?;
        let path = temp_dir.join("index.toml");
        std::fs::write(&path, "cache_max_kb = 64\nprocessor_poll_ms = 5\n")
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        let cfg = IndexConfig::load(Some(&path))?;
        assert_eq!(cfg.cache_max_kb, 64);
        assert_eq!(cfg.processor_poll(), Duration::from_millis(5));

        // Missing file is not an error
        let cfg = IndexConfig::load(Some(&temp_dir.join("missing.toml")))?;
        assert_eq!(cfg.cache_max_kb, IndexConfig::default().cache_max_kb);

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }
}
