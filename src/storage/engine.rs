//! Index storage engine
//!
//! Owns every pool and payload store of one index:
//!
//! ```text
//!                ┌────────────────────────────┐
//! file path ───→ │ FilePool (key → slot)      │ ──→ file_payloads[slot]      (FileInfo record)
//!                └────────────────────────────┘
//!                ┌────────────────────────────┐
//! location  ───→ │ LocationPool (key → slot)  │ ──→ layer_payloads[layer][slot]
//!                └────────────────────────────┘     (one store per layer, slot shared)
//!
//! DeletionMarks { files, locations }   consulted by every read
//! ```
//!
//! File records are encoded here; location records are encoded by the codec
//! of the layer they are written to. Both store back-references (pool ids)
//! to other records rather than copies.
//!
//! `state` and `deletions` are separate locks. When both are needed they are
//! taken in that order. Listeners are notified after both are released.

use super::bitset::DeletionMarks;
use super::codec::{as_codec_error, get_i64, get_id, get_len, get_u8, put_id, put_len};
use super::layer::{Layer, LocationInterner, LocationResolver};
use super::model::{Dependency, FileInfo, LayerId, Location, LocationInfo, PathAndStamp};
use super::payload::LayeredPayloadStore;
use super::pool::StringPool;
use super::record::{FilePool, LocationPool, RecordManager};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const DEPENDENCY_LOCATION: u8 = 0;
const DEPENDENCY_FILE: u8 = 1;

/// Notified after every mutation of an [`IndexStorage`]
pub trait StorageListener: Send + Sync {
    fn storage_changed(&self);
}

/// Pools and payload stores guarded by the instance lock
#[derive(Debug, Clone)]
pub(crate) struct IndexState {
    /// Number of location payload slots handed out so far
    pub(crate) max_locations_size: u32,
    pub(crate) layer_ids: StringPool,
    pub(crate) locations: LocationPool,
    pub(crate) files: FilePool,
    pub(crate) file_payloads: LayeredPayloadStore,
    pub(crate) layer_payloads: BTreeMap<String, LayeredPayloadStore>,
}

/// Deletion marks, guarded by their own lock
#[derive(Debug, Clone, Default)]
pub(crate) struct Deletions {
    pub(crate) files: DeletionMarks,
    pub(crate) locations: DeletionMarks,
}

/// Counters describing an engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub files: usize,
    pub locations: usize,
    pub layers: usize,
    pub deleted_files: usize,
    pub deleted_locations: usize,
    pub max_locations_size: u32,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            max_locations_size: 0,
            layer_ids: StringPool::new(),
            locations: RecordManager::optimized(),
            files: RecordManager::optimized(),
            file_payloads: LayeredPayloadStore::new(),
            layer_payloads: BTreeMap::new(),
        }
    }
}

/// Ids referenced by a record being written; they are revived with it
#[derive(Debug, Default)]
struct Referenced {
    locations: Vec<u32>,
    files: Vec<u32>,
}

impl Referenced {
    fn unmark(&self, deletions: &mut Deletions) {
        for &id in &self.locations {
            deletions.locations.unmark(id);
        }
        for &id in &self.files {
            deletions.files.unmark(id);
        }
    }
}

struct Interner<'a> {
    locations: &'a mut LocationPool,
    referenced: &'a mut Vec<u32>,
}

impl LocationInterner for Interner<'_> {
    fn intern(&mut self, location: &Location) -> u32 {
        let id = self.locations.add(location.identifier());
        self.referenced.push(id);
        id
    }
}

struct Resolver<'a> {
    locations: &'a LocationPool,
    deleted: &'a DeletionMarks,
}

impl LocationResolver for Resolver<'_> {
    fn resolve(&self, id: u32) -> Result<Option<Location>> {
        if self.deleted.is_marked(id) {
            return Ok(None);
        }
        self.locations
            .key_of(id)
            .map(|key| Some(Location::new(key)))
            .ok_or_else(|| Error::Codec(format!("Unknown location id {}", id)))
    }
}

impl IndexState {
    /// `version:i64, count:i32, locationId:i32*, deps(internal), deps(external)`
    fn encode_file_info(&mut self, info: &FileInfo, referenced: &mut Referenced) -> Bytes {
        let mut out = BytesMut::new();
        out.put_i64(info.version);
        put_len(&mut out, info.source_locations.len());
        for location in &info.source_locations {
            let id = self.locations.add(location.identifier());
            referenced.locations.push(id);
            put_id(&mut out, id);
        }
        self.put_dependencies(&mut out, &info.internal_dependencies, referenced);
        self.put_dependencies(&mut out, &info.external_dependencies, referenced);
        out.freeze()
    }

    /// `count:i32, { kind:u8, layerId:i32, targetId:i32 }*`
    fn put_dependencies(
        &mut self,
        out: &mut BytesMut,
        dependencies: &[Dependency],
        referenced: &mut Referenced,
    ) {
        put_len(out, dependencies.len());
        for dependency in dependencies {
            match dependency {
                Dependency::Location { location, layer } => {
                    out.put_u8(DEPENDENCY_LOCATION);
                    put_id(out, self.layer_ids.intern(layer.as_str()));
                    let id = self.locations.add(location.identifier());
                    referenced.locations.push(id);
                    put_id(out, id);
                }
                Dependency::File { path } => {
                    out.put_u8(DEPENDENCY_FILE);
                    put_id(out, 0);
                    let id = self.files.add(path);
                    referenced.files.push(id);
                    put_id(out, id);
                }
            }
        }
    }

    fn decode_file_info(&self, deletions: &Deletions, payload: &[u8]) -> Result<FileInfo> {
        self.decode_file_record(deletions, payload)
            .map_err(as_codec_error)
    }

    fn decode_file_record(&self, deletions: &Deletions, mut payload: &[u8]) -> Result<FileInfo> {
        let resolver = Resolver {
            locations: &self.locations,
            deleted: &deletions.locations,
        };

        let version = get_i64(&mut payload, "file version")?;
        let count = get_len(&mut payload, "source location count")?;
        let mut source_locations = Vec::new();
        for _ in 0..count {
            let id = get_id(&mut payload, "source location")?;
            if let Some(location) = resolver.resolve(id)? {
                source_locations.push(location);
            }
        }
        let internal_dependencies = self.get_dependencies(&mut payload, &resolver, deletions)?;
        let external_dependencies = self.get_dependencies(&mut payload, &resolver, deletions)?;

        if !payload.is_empty() {
            return Err(Error::Codec(format!(
                "{} trailing bytes after file record",
                payload.len()
            )));
        }

        Ok(FileInfo {
            version,
            source_locations,
            internal_dependencies,
            external_dependencies,
        })
    }

    fn get_dependencies(
        &self,
        payload: &mut &[u8],
        resolver: &Resolver<'_>,
        deletions: &Deletions,
    ) -> Result<Vec<Dependency>> {
        let count = get_len(payload, "dependency count")?;
        let mut dependencies = Vec::new();
        for _ in 0..count {
            let kind = get_u8(payload, "dependency kind")?;
            let layer = get_id(payload, "dependency layer")?;
            let target = get_id(payload, "dependency target")?;
            match kind {
                DEPENDENCY_LOCATION => {
                    let layer = self
                        .layer_ids
                        .id_to_string(layer)
                        .ok_or_else(|| Error::Codec(format!("Unknown layer id {}", layer)))?;
                    if let Some(location) = resolver.resolve(target)? {
                        dependencies.push(Dependency::Location {
                            location,
                            layer: LayerId::new(layer),
                        });
                    }
                }
                DEPENDENCY_FILE => {
                    if deletions.files.is_marked(target) {
                        continue;
                    }
                    let path = self
                        .files
                        .key_of(target)
                        .ok_or_else(|| Error::Codec(format!("Unknown file id {}", target)))?;
                    dependencies.push(Dependency::File { path });
                }
                other => {
                    return Err(Error::Codec(format!("Unknown dependency kind {}", other)));
                }
            }
        }
        Ok(dependencies)
    }

    fn file_payload(&self, id: u32) -> Option<&Bytes> {
        self.files
            .payload_slot_of(id)
            .and_then(|slot| self.file_payloads.get(slot))
    }
}

/// Storage engine for one index
pub struct IndexStorage {
    state: Mutex<IndexState>,
    deletions: Mutex<Deletions>,
    listeners: RwLock<Vec<Arc<dyn StorageListener>>>,
}

impl std::fmt::Debug for IndexStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStorage")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for IndexStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexStorage {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::from_parts(IndexState::default(), Deletions::default())
    }

    pub(crate) fn from_parts(state: IndexState, deletions: Deletions) -> Self {
        Self {
            state: Mutex::new(state),
            deletions: Mutex::new(deletions),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Run `f` with a consistent view of the whole engine
    pub(crate) fn with_parts<R>(&self, f: impl FnOnce(&IndexState, &Deletions) -> R) -> R {
        let state = self.state.lock();
        let deletions = self.deletions.lock();
        f(&state, &deletions)
    }

    /// Register a listener for mutations
    pub fn add_listener(&self, listener: Arc<dyn StorageListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.storage_changed();
        }
    }

    /// Store the record of a file, replacing any previous one
    pub fn write_file_info(&self, path: &str, info: &FileInfo) -> Result<()> {
        {
            let mut state = self.state.lock();
            let mut referenced = Referenced::default();
            let payload = state.encode_file_info(info, &mut referenced);
            let id = state.files.add(path);
            let slot = match state.files.payload_slot_of(id) {
                Some(slot) => slot,
                None => {
                    let slot = state.file_payloads.allocate();
                    state.files.set_payload(id, slot);
                    slot
                }
            };
            state.file_payloads.set(slot, payload);
            let mut deletions = self.deletions.lock();
            referenced.unmark(&mut deletions);
            deletions.files.unmark(id);
            debug!(path, id, version = info.version, "Wrote file info");
        }
        self.notify();
        Ok(())
    }

    /// Record of a file; `None` if never written or deleted
    pub fn read_file_info(&self, path: &str) -> Result<Option<FileInfo>> {
        let state = self.state.lock();
        let deletions = self.deletions.lock();

        let Some(id) = state.files.get(path) else {
            return Ok(None);
        };
        if deletions.files.is_marked(id) {
            return Ok(None);
        }
        match state.file_payload(id) {
            Some(payload) => state.decode_file_info(&deletions, payload).map(Some),
            None => Ok(None),
        }
    }

    /// Mark a file deleted and drop its record. The path stays interned.
    pub fn delete_file_info(&self, path: &str) -> Result<()> {
        let deleted = {
            let mut state = self.state.lock();
            match state.files.get(path) {
                Some(id) => {
                    if let Some(slot) = state.files.payload_slot_of(id) {
                        state.file_payloads.clear(slot);
                    }
                    self.deletions.lock().files.mark(id);
                    debug!(path, id, "Deleted file info");
                    true
                }
                None => false,
            }
        };
        if deleted {
            self.notify();
        }
        Ok(())
    }

    /// Store facts about a location in one layer
    pub fn write_location_info(
        &self,
        location: &Location,
        info: &LocationInfo,
        layer: &Layer,
    ) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let layer_key = layer.id().as_str();
            state.layer_ids.intern(layer_key);

            let mut referenced = Referenced::default();
            let payload = layer.codec().encode(
                info,
                &mut Interner {
                    locations: &mut state.locations,
                    referenced: &mut referenced.locations,
                },
            )?;

            let id = state.locations.add(location.identifier());
            let slot = match state.locations.payload_slot_of(id) {
                Some(slot) => slot,
                None => {
                    state.max_locations_size += 1;
                    let slot = state.max_locations_size;
                    state.locations.set_payload(id, slot);
                    slot
                }
            };
            state
                .layer_payloads
                .entry(layer_key.to_string())
                .or_default()
                .set(slot, payload);
            let mut deletions = self.deletions.lock();
            referenced.unmark(&mut deletions);
            deletions.locations.unmark(id);
            debug!(location = %location, layer = %layer.id(), id, slot, "Wrote location info");
        }
        self.notify();
        Ok(())
    }

    /// Facts about a location in one layer; `None` if never written or deleted
    pub fn read_location_info(
        &self,
        location: &Location,
        layer: &Layer,
    ) -> Result<Option<LocationInfo>> {
        let state = self.state.lock();
        let deletions = self.deletions.lock();

        let Some(id) = state.locations.get(location.identifier()) else {
            return Ok(None);
        };
        if deletions.locations.is_marked(id) {
            return Ok(None);
        }
        let payload = state
            .locations
            .payload_slot_of(id)
            .and_then(|slot| state.layer_payloads.get(layer.id().as_str())?.get(slot));
        let Some(payload) = payload else {
            return Ok(None);
        };

        let resolver = Resolver {
            locations: &state.locations,
            deleted: &deletions.locations,
        };
        layer.codec().decode(payload, &resolver).map(Some)
    }

    /// Mark a location deleted and drop its payload in every layer
    pub fn delete_location_info(&self, location: &Location) -> Result<()> {
        let deleted = {
            let mut state = self.state.lock();
            match state.locations.get(location.identifier()) {
                Some(id) => {
                    if let Some(slot) = state.locations.payload_slot_of(id) {
                        for store in state.layer_payloads.values_mut() {
                            store.clear(slot);
                        }
                    }
                    self.deletions.lock().locations.mark(id);
                    debug!(location = %location, id, "Deleted location info");
                    true
                }
                None => false,
            }
        };
        if deleted {
            self.notify();
        }
        Ok(())
    }

    /// Every live file record, in file id order
    pub fn read_all_file_infos(&self) -> Result<Vec<(String, FileInfo)>> {
        let state = self.state.lock();
        let deletions = self.deletions.lock();

        let mut files = Vec::new();
        for (id, path) in state.files.pool().iter() {
            if deletions.files.is_marked(id) {
                continue;
            }
            if let Some(payload) = state.file_payload(id) {
                files.push((path, state.decode_file_info(&deletions, payload)?));
            }
        }
        Ok(files)
    }

    /// Every live location holding a payload in `layer`
    pub fn read_all_layer_locations(&self, layer: &Layer) -> Result<Vec<(Location, LocationInfo)>> {
        let state = self.state.lock();
        let deletions = self.deletions.lock();

        let Some(store) = state.layer_payloads.get(layer.id().as_str()) else {
            return Ok(Vec::new());
        };
        let resolver = Resolver {
            locations: &state.locations,
            deleted: &deletions.locations,
        };

        let mut locations = Vec::new();
        for (id, key) in state.locations.pool().iter() {
            if deletions.locations.is_marked(id) {
                continue;
            }
            let payload = state
                .locations
                .payload_slot_of(id)
                .and_then(|slot| store.get(slot));
            if let Some(payload) = payload {
                let info = layer.codec().decode(payload, &resolver)?;
                locations.push((Location::new(key), info));
            }
        }
        Ok(locations)
    }

    /// Path and version of every live file, decoding only the record header
    pub fn read_file_names_and_stamps(&self) -> Result<Vec<PathAndStamp>> {
        let state = self.state.lock();
        let deletions = self.deletions.lock();

        let mut stamps = Vec::new();
        for (id, path) in state.files.pool().iter() {
            if deletions.files.is_marked(id) {
                continue;
            }
            if let Some(payload) = state.file_payload(id) {
                let stamp = get_i64(&mut &payload[..], "file version").map_err(as_codec_error)?;
                stamps.push(PathAndStamp { path, stamp });
            }
        }
        Ok(stamps)
    }

    /// Drop everything
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            *state = IndexState::default();
            *self.deletions.lock() = Deletions::default();
        }
        debug!("Cleared index storage");
        self.notify();
    }

    pub fn stats(&self) -> StorageStats {
        self.with_parts(|state, deletions| StorageStats {
            files: state.files.len(),
            locations: state.locations.len(),
            layers: state.layer_payloads.len(),
            deleted_files: deletions.files.cardinality(),
            deleted_locations: deletions.locations.cardinality(),
            max_locations_size: state.max_locations_size,
        })
    }
}
