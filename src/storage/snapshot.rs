//! Whole-engine binary snapshots
//!
//! # Format
//!
//! ```text
//! maxLocationsSize:i32                                  MAGIC
//! layerIds:          StringPool-blob                    MAGIC
//! locationInfoPool:  RecordManager-blob                 MAGIC
//! fileInfoPool:      RecordManager-blob                 MAGIC
//! fileInfoPayloads:  LayeredPayloadStore-blob           MAGIC
//! perLayerPayloads:  count:i32, { key:UTF8, LayeredPayloadStore-blob }*   MAGIC
//! deletedFileIds:    BitSet-blob                        MAGIC
//! deletedLocationIds: BitSet-blob                       MAGIC
//! ```
//!
//! MAGIC is the i64 `0xCAFEBABE`. A wrong magic, a truncated block or bytes
//! after the last block reject the whole snapshot.
//!
//! Writes go to `<path>.tmp` first and are renamed into place after `sync_all`,
//! so a crash mid-write leaves the previous snapshot intact.

use super::bitset::DeletionMarks;
use super::codec::{check_magic, get_len, get_str, put_len, put_magic, put_str};
use super::engine::{Deletions, IndexState, IndexStorage};
use super::payload::LayeredPayloadStore;
use super::pool::StringPool;
use super::record::RecordManager;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Reads and writes snapshot files
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotManager;

impl SnapshotManager {
    /// Serialize an engine
    pub fn encode(storage: &IndexStorage) -> Bytes {
        storage.with_parts(|state, deletions| {
            let mut out = BytesMut::new();

            put_len(&mut out, state.max_locations_size as usize);
            put_magic(&mut out);
            state.layer_ids.write_to(&mut out);
            put_magic(&mut out);
            state.locations.write_to(&mut out);
            put_magic(&mut out);
            state.files.write_to(&mut out);
            put_magic(&mut out);
            state.file_payloads.write_to(&mut out);
            put_magic(&mut out);

            put_len(&mut out, state.layer_payloads.len());
            for (key, store) in &state.layer_payloads {
                put_str(&mut out, key);
                store.write_to(&mut out);
            }
            put_magic(&mut out);

            deletions.files.write_to(&mut out);
            put_magic(&mut out);
            deletions.locations.write_to(&mut out);
            put_magic(&mut out);

            out.freeze()
        })
    }

    /// Rebuild an engine from snapshot bytes
    pub fn decode(mut buf: Bytes) -> Result<IndexStorage> {
        let max_locations_size = get_len(&mut buf, "max locations size")? as u32;
        check_magic(&mut buf, "max locations size")?;
        let layer_ids = StringPool::read_from(&mut buf)?;
        check_magic(&mut buf, "layer ids")?;
        let locations = RecordManager::read_from(&mut buf)?;
        check_magic(&mut buf, "location pool")?;
        let files = RecordManager::read_from(&mut buf)?;
        check_magic(&mut buf, "file pool")?;
        let file_payloads = LayeredPayloadStore::read_from(&mut buf)?;
        check_magic(&mut buf, "file payloads")?;

        let layer_count = get_len(&mut buf, "layer count")?;
        let mut layer_payloads = BTreeMap::new();
        for _ in 0..layer_count {
            let key = get_str(&mut buf, "layer key")?;
            let store = LayeredPayloadStore::read_from(&mut buf)?;
            if layer_payloads.insert(key.clone(), store).is_some() {
                return Err(Error::Corrupt(format!("Duplicate layer {:?}", key)));
            }
        }
        check_magic(&mut buf, "layer payloads")?;

        let deleted_files = DeletionMarks::read_from(&mut buf, pool_max_id(&files))?;
        check_magic(&mut buf, "deleted files")?;
        let deleted_locations = DeletionMarks::read_from(&mut buf, pool_max_id(&locations))?;
        check_magic(&mut buf, "deleted locations")?;

        if buf.has_remaining() {
            return Err(Error::Corrupt(format!(
                "{} trailing bytes after snapshot",
                buf.remaining()
            )));
        }

        let state = IndexState {
            max_locations_size,
            layer_ids,
            locations,
            files,
            file_payloads,
            layer_payloads,
        };
        validate(&state)?;

        Ok(IndexStorage::from_parts(
            state,
            Deletions {
                files: deleted_files,
                locations: deleted_locations,
            },
        ))
    }

    /// Write a snapshot of `storage` to `path`
    pub fn write(storage: &IndexStorage, path: &Path) -> Result<()> {
        let bytes = Self::encode(storage);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create snapshot directory: {}", e)))?;
        }

        let tmp_path = tmp_path(path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| Error::Storage(format!("Failed to create snapshot file: {}", e)))?;
        file.write_all(&bytes)
            .map_err(|e| Error::Storage(format!("Failed to write snapshot: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync snapshot: {}", e)))?;
        drop(file);

        std::fs::rename(&tmp_path, path)
            .map_err(|e| Error::Storage(format!("Failed to rename snapshot: {}", e)))?;

        info!(path = ?path, bytes = bytes.len(), "Wrote index snapshot");
        Ok(())
    }

    /// Load a snapshot; `Error::NotFound` if the file does not exist
    pub fn read(path: &Path) -> Result<IndexStorage> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("Snapshot {:?} does not exist", path)));
            }
            Err(e) => return Err(Error::Storage(format!("Failed to read snapshot: {}", e))),
        };
        let len = bytes.len();
        let storage = Self::decode(Bytes::from(bytes))?;
        info!(path = ?path, bytes = len, stats = ?storage.stats(), "Loaded index snapshot");
        Ok(storage)
    }

    /// Startup policy: primary snapshot, else the read-only initial one, else empty.
    ///
    /// A corrupt primary is deleted before falling back. Only I/O errors on the
    /// primary are returned; problems with the initial snapshot are logged.
    pub fn open(primary: &Path, initial: Option<&Path>) -> Result<IndexStorage> {
        match Self::read(primary) {
            Ok(storage) => return Ok(storage),
            Err(Error::NotFound(_)) => {
                info!(path = ?primary, "No index snapshot found");
            }
            Err(Error::Corrupt(msg)) => {
                warn!(path = ?primary, error = %msg, "Index snapshot is corrupt, deleting it");
                if let Err(e) = std::fs::remove_file(primary) {
                    warn!(path = ?primary, error = %e, "Failed to delete corrupt snapshot");
                }
            }
            Err(e) => return Err(e),
        }

        if let Some(initial) = initial {
            match Self::read(initial) {
                Ok(storage) => {
                    info!(path = ?initial, "Seeded index from initial snapshot");
                    return Ok(storage);
                }
                Err(e) => {
                    warn!(path = ?initial, error = %e, "Initial snapshot unusable");
                }
            }
        }

        info!("Starting with an empty index");
        Ok(IndexStorage::new())
    }
}

/// Highest id a pool has handed out
fn pool_max_id(pool: &RecordManager) -> u32 {
    u32::try_from(pool.len()).unwrap_or(u32::MAX)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Cross-block checks the individual blobs cannot make
fn validate(state: &IndexState) -> Result<()> {
    for (id, key) in state.locations.pool().iter() {
        if let Some(slot) = state.locations.payload_slot_of(id) {
            if slot > state.max_locations_size {
                return Err(Error::Corrupt(format!(
                    "Location {:?} uses slot {} beyond {}",
                    key, slot, state.max_locations_size
                )));
            }
        }
    }
    for (id, key) in state.files.pool().iter() {
        if let Some(slot) = state.files.payload_slot_of(id) {
            if slot as usize >= state.file_payloads.capacity() {
                return Err(Error::Corrupt(format!(
                    "File {:?} uses slot {} beyond {}",
                    key,
                    slot,
                    state.file_payloads.capacity()
                )));
            }
        }
    }
    if let Some(key) = state
        .layer_payloads
        .keys()
        .find(|key| state.layer_ids.get(key).is_none())
    {
        return Err(Error::Corrupt(format!("Layer {:?} is not registered", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layer::Layer;
    use crate::storage::model::{Dependency, FileInfo, LayerId, Location, LocationInfo};
    use std::io::{Seek, SeekFrom};

    fn populated() -> Result<IndexStorage> {
        let storage = IndexStorage::new();
        let refs = Layer::reverse_edges("references");
        storage.write_file_info(
            "lib/a.dart",
            &FileInfo {
                version: 9,
                source_locations: vec![Location::new("a#x"), Location::new("a#y")],
                internal_dependencies: vec![Dependency::Location {
                    location: Location::new("a#y"),
                    layer: LayerId::new("references"),
                }],
                external_dependencies: vec![Dependency::File {
                    path: "lib/b.dart".to_string(),
                }],
            },
        )?;
        storage.write_file_info("lib/b.dart", &FileInfo::new(3))?;
        storage.write_location_info(
            &Location::new("a#x"),
            &LocationInfo::with_sources(vec![Location::new("a#y")]),
            &refs,
        )?;
        storage.write_location_info(
            &Location::new("a#z"),
            &LocationInfo::with_sources(vec![Location::new("a#x")]),
            &refs,
        )?;
        storage.delete_location_info(&Location::new("a#z"))?;
        Ok(storage)
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let storage = populated()?;
        let loaded = SnapshotManager::decode(SnapshotManager::encode(&storage))?;

        assert_eq!(loaded.stats(), storage.stats());
        assert_eq!(loaded.read_all_file_infos()?, storage.read_all_file_infos()?);
        let refs = Layer::reverse_edges("references");
        assert_eq!(
            loaded.read_all_layer_locations(&refs)?,
            storage.read_all_layer_locations(&refs)?
        );
        assert_eq!(loaded.read_location_info(&Location::new("a#z"), &refs)?, None);
        Ok(())
    }

    #[test]
    fn test_trailing_bytes_rejected() -> Result<()> {
        let mut bytes = BytesMut::from(&SnapshotManager::encode(&populated()?)[..]);
        bytes.put_u8(0);
        assert!(matches!(
            SnapshotManager::decode(bytes.freeze()),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn test_deleted_id_beyond_pool_rejected() -> Result<()> {
        let encoded = SnapshotManager::encode(&IndexStorage::new());
        // Replace both empty deletion blocks: count:i32 + magic:i64 each
        let mut bytes = BytesMut::from(&encoded[..encoded.len() - 24]);
        put_len(&mut bytes, 1);
        bytes.put_i32(i32::MAX);
        put_magic(&mut bytes);
        put_len(&mut bytes, 0);
        put_magic(&mut bytes);
        assert!(matches!(
            SnapshotManager::decode(bytes.freeze()),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() -> Result<()> {
        let mut bytes = BytesMut::from(&SnapshotManager::encode(&IndexStorage::new())[..]);
        // First magic follows the 4-byte max locations size
        bytes[5] ^= 0xff;
        assert!(matches!(
            SnapshotManager::decode(bytes.freeze()),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn test_open_falls_back_to_initial() -> Result<()> {
        let temp_dir = std::env::temp_dir().join(format!("index_snapshot_{}", std::process::id()));
        let primary = temp_dir.join("index.idx");
        let initial = temp_dir.join("initial.idx");

        // Nothing on disk
        let storage = SnapshotManager::open(&primary, Some(&initial))?;
        assert_eq!(storage.stats().files, 0);

        SnapshotManager::write(&populated()?, &initial)?;
        SnapshotManager::write(&populated()?, &primary)?;
        assert!(!tmp_path(&primary).exists());

        // Damage the primary
        let mut file = OpenOptions::new()
            .write(true)
            .open(&primary)
            .map_err(|e| Error::Storage(format!("Failed to open snapshot: {}", e)))?;
        file.seek(SeekFrom::Start(4))
            .map_err(|e| Error::Storage(format!("Failed to seek: {}", e)))?;
        file.write_all(&[0u8; 8])
            .map_err(|e| Error::Storage(format!("Failed to write: {}", e)))?;
        drop(file);

        let storage = SnapshotManager::open(&primary, Some(&initial))?;
        assert!(!primary.exists());
        assert!(storage.read_file_info("lib/b.dart")?.is_some());

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }
}
