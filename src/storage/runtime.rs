//! Lifecycle of the engines owned by a host application
//!
//! ```text
//! register/open ──→ engines [name → (snapshot path, Arc<IndexStorage>)]
//!                        │ storage_changed()
//!                        ▼
//!                   dirty set ──→ "index-flush" thread (every flush_interval)
//!                                   └─→ SnapshotManager::write
//! shutdown(): stop thread, join, flush once more
//! ```
//!
//! A snapshot is durable within one flush interval of the mutation, and
//! always after `shutdown` returns.

use super::engine::{IndexStorage, StorageListener};
use super::snapshot::SnapshotManager;
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

const FLUSH_THREAD_NAME: &str = "index-flush";

struct RegisteredEngine {
    name: String,
    path: PathBuf,
    storage: Arc<IndexStorage>,
}

struct Shared {
    engines: Mutex<Vec<RegisteredEngine>>,
    dirty: Mutex<BTreeSet<String>>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn flush_dirty(&self) -> usize {
        let names = std::mem::take(&mut *self.dirty.lock());
        if names.is_empty() {
            return 0;
        }

        let targets: Vec<(String, PathBuf, Arc<IndexStorage>)> = {
            let engines = self.engines.lock();
            engines
                .iter()
                .filter(|e| names.contains(&e.name))
                .map(|e| (e.name.clone(), e.path.clone(), Arc::clone(&e.storage)))
                .collect()
        };

        let mut flushed = 0;
        for (name, path, storage) in targets {
            match SnapshotManager::write(&storage, &path) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!(engine = %name, path = ?path, error = %e, "Skipping index flush");
                    self.dirty.lock().insert(name);
                }
            }
        }
        flushed
    }
}

/// Marks its engine dirty on every change
struct DirtyMarker {
    name: String,
    shared: Weak<Shared>,
}

impl StorageListener for DirtyMarker {
    fn storage_changed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dirty.lock().insert(self.name.clone());
        }
    }
}

/// Owns engines, flushes them periodically and at shutdown
pub struct StorageRuntime {
    config: IndexConfig,
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StorageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRuntime")
            .field("engines", &self.engine_names())
            .field("running", &self.flusher.lock().is_some())
            .finish()
    }
}

impl StorageRuntime {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                engines: Mutex::new(Vec::new()),
                dirty: Mutex::new(BTreeSet::new()),
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
            flusher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Snapshot file an engine registered now under `name` would use
    fn path_for(&self, base: &Path, engines: &[RegisteredEngine], name: &str) -> PathBuf {
        if engines.is_empty() {
            return base.to_path_buf();
        }
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = match base.extension() {
            Some(ext) => format!("{}-{}.{}", stem, name, ext.to_string_lossy()),
            None => format!("{}-{}", stem, name),
        };
        base.with_file_name(file_name)
    }

    /// Take ownership of an engine; it is flushed to its own snapshot file
    pub fn register(&self, name: &str, storage: IndexStorage) -> Result<Arc<IndexStorage>> {
        let mut engines = self.shared.engines.lock();
        self.register_locked(&mut engines, name, storage)
    }

    fn register_locked(
        &self,
        engines: &mut MutexGuard<'_, Vec<RegisteredEngine>>,
        name: &str,
        storage: IndexStorage,
    ) -> Result<Arc<IndexStorage>> {
        if engines.iter().any(|e| e.name == name) {
            return Err(Error::InvalidState(format!(
                "Engine {:?} is already registered",
                name
            )));
        }
        let path = self.path_for(&self.config.snapshot_path, engines.as_slice(), name);

        let storage = Arc::new(storage);
        storage.add_listener(Arc::new(DirtyMarker {
            name: name.to_string(),
            shared: Arc::downgrade(&self.shared),
        }));

        info!(engine = name, path = ?path, "Registered index engine");
        engines.push(RegisteredEngine {
            name: name.to_string(),
            path,
            storage: Arc::clone(&storage),
        });
        Ok(storage)
    }

    /// Load an engine from its snapshot (or the initial snapshot) and register it
    pub fn open(&self, name: &str) -> Result<Arc<IndexStorage>> {
        let mut engines = self.shared.engines.lock();
        let path = self.path_for(&self.config.snapshot_path, engines.as_slice(), name);
        let initial = self
            .config
            .initial_snapshot_path
            .as_deref()
            .map(|base| self.path_for(base, engines.as_slice(), name));

        let storage = SnapshotManager::open(&path, initial.as_deref())?;
        self.register_locked(&mut engines, name, storage)
    }

    pub fn engine(&self, name: &str) -> Option<Arc<IndexStorage>> {
        self.shared
            .engines
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.storage))
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.shared
            .engines
            .lock()
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn snapshot_path(&self, name: &str) -> Option<PathBuf> {
        self.shared
            .engines
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.path.clone())
    }

    /// Names of engines changed since their last successful flush
    pub fn dirty_engines(&self) -> Vec<String> {
        self.shared.dirty.lock().iter().cloned().collect()
    }

    /// Start the periodic flush thread
    pub fn start(&self) -> Result<()> {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            return Err(Error::InvalidState("Flush thread already running".to_string()));
        }
        if *self.shared.stopped.lock() {
            return Err(Error::InvalidState("Runtime has been shut down".to_string()));
        }

        let shared = Arc::clone(&self.shared);
        let interval = self.config.flush_interval();
        let handle = thread::Builder::new()
            .name(FLUSH_THREAD_NAME.into())
            .spawn(move || {
                let mut stopped = shared.stopped.lock();
                while !*stopped {
                    let timed_out = shared.wake.wait_for(&mut stopped, interval).timed_out();
                    if *stopped {
                        break;
                    }
                    if timed_out {
                        let flushed = MutexGuard::unlocked(&mut stopped, || shared.flush_dirty());
                        debug!(flushed, "Periodic index flush");
                    }
                }
            })
            .map_err(|e| Error::Storage(format!("Failed to spawn flush thread: {}", e)))?;

        info!(interval_secs = interval.as_secs(), "Started index flush thread");
        *flusher = Some(handle);
        Ok(())
    }

    /// Flush every dirty engine now, returning how many snapshots were written
    pub fn flush_dirty(&self) -> usize {
        self.shared.flush_dirty()
    }

    /// Stop the flush thread and flush one last time
    pub fn shutdown(&self) {
        {
            *self.shared.stopped.lock() = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                warn!("Index flush thread panicked");
            }
        }
        let flushed = self.flush_dirty();
        info!(flushed, "Index runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::FileInfo;
    use std::time::Duration;

    fn config(dir: &Path) -> IndexConfig {
        IndexConfig {
            snapshot_path: dir.join("index.idx"),
            flush_interval_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_engine_paths() -> Result<()> {
        let temp_dir = std::env::temp_dir().join(format!("runtime_paths_{}", std::process::id()));
        let runtime = StorageRuntime::new(config(&temp_dir));

        runtime.register("main", IndexStorage::new())?;
        runtime.register("tests", IndexStorage::new())?;
        assert_eq!(runtime.snapshot_path("main"), Some(temp_dir.join("index.idx")));
        assert_eq!(
            runtime.snapshot_path("tests"),
            Some(temp_dir.join("index-tests.idx"))
        );
        assert!(matches!(
            runtime.register("main", IndexStorage::new()),
            Err(Error::InvalidState(_))
        ));
        Ok(())
    }

    #[test]
    fn test_flush_only_dirty_engines() -> Result<()> {
        let temp_dir = std::env::temp_dir().join(format!("runtime_dirty_{}", std::process::id()));
        let runtime = StorageRuntime::new(config(&temp_dir));
        let main = runtime.register("main", IndexStorage::new())?;
        runtime.register("other", IndexStorage::new())?;

        assert_eq!(runtime.flush_dirty(), 0);
        main.write_file_info("lib/a.dart", &FileInfo::new(1))?;
        assert_eq!(runtime.dirty_engines(), vec!["main".to_string()]);

        assert_eq!(runtime.flush_dirty(), 1);
        assert!(temp_dir.join("index.idx").exists());
        assert!(!temp_dir.join("index-other.idx").exists());
        assert!(runtime.dirty_engines().is_empty());

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_failed_flush_stays_dirty() -> Result<()> {
        let temp_dir = std::env::temp_dir().join(format!("runtime_fail_{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir)
            .map_err(|e| Error::Storage(format!("Failed to create dir: {}", e)))?;
        // A regular file where the snapshot directory should be
        let blocker = temp_dir.join("blocker");
        std::fs::write(&blocker, b"x")
            .map_err(|e| Error::Storage(format!("Failed to write: {}", e)))?;

        let runtime = StorageRuntime::new(config(&blocker));
        let main = runtime.register("main", IndexStorage::new())?;
        main.write_file_info("lib/a.dart", &FileInfo::new(1))?;

        assert_eq!(runtime.flush_dirty(), 0);
        assert_eq!(runtime.dirty_engines(), vec!["main".to_string()]);

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_periodic_flush_and_shutdown() -> Result<()> {
        let temp_dir = std::env::temp_dir().join(format!("runtime_periodic_{}", std::process::id()));
        let runtime = StorageRuntime::new(config(&temp_dir));
        let main = runtime.open("main")?;

        runtime.start()?;
        assert!(matches!(runtime.start(), Err(Error::InvalidState(_))));

        main.write_file_info("lib/a.dart", &FileInfo::new(1))?;
        std::thread::sleep(Duration::from_millis(2500));
        assert!(runtime.dirty_engines().is_empty());
        assert!(temp_dir.join("index.idx").exists());

        main.write_file_info("lib/b.dart", &FileInfo::new(2))?;
        runtime.shutdown();
        assert!(runtime.dirty_engines().is_empty());

        // A fresh runtime sees both files
        let reopened = StorageRuntime::new(config(&temp_dir));
        let main = reopened.open("main")?;
        assert_eq!(main.read_all_file_infos()?.len(), 2);

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }
}
