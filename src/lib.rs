// PhotonDB Index - Rust Implementation
// A compact index storage engine for source-code indexers

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod logging;
pub mod queue;
pub mod storage;

// Re-exports for convenience
pub use cache::{Cache, CacheObject, CacheWriter, TwoQueueCache};
pub use config::IndexConfig;
pub use queue::{OperationProcessor, OperationQueue, PendingOperation};
pub use storage::{IndexStorage, SnapshotManager, StorageRuntime};

/// Index storage error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Corrupt snapshot: {0}")]
        Corrupt(String),

        #[error("Codec error: {0}")]
        Codec(String),

        #[error("Invalid state: {0}")]
        InvalidState(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Not found: {0}")]
        NotFound(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
        assert_eq!(VERSION.split('.').count(), 3);
    }
}
