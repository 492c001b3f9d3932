//! Storage layer
//!
//! # Architecture
//!
//! An engine keeps every record as interned strings plus opaque payloads:
//!
//! ```text
//! IndexStorage
//!   ├─→ files:      FilePool (path → id) ──→ LayeredPayloadStore (file records)
//!   ├─→ locations:  LocationPool (identifier → id, payload slot)
//!   ├─→ layers:     layer id → LayeredPayloadStore (slot → encoded LocationInfo)
//!   └─→ deletions:  DeletionMarks over file ids and location ids
//! ```
//!
//! ## Records
//!
//! File and location records reference other locations by pool id, so a
//! location identifier is stored once however often it is mentioned. Ids are
//! never reused; deleting a record only marks its id.
//!
//! ## Persistence
//!
//! `SnapshotManager` writes the whole engine as one binary snapshot, with a
//! `MAGIC` marker after every block. `StorageRuntime` flushes changed engines
//! on a timer and once more at shutdown.
//!
//! `PageFile` is the paged variant: fixed-size pages on disk with resident
//! pages bounded by a `TwoQueueCache`.

pub mod bitset;
pub mod buffer;
pub mod codec;
pub mod engine;
pub mod layer;
pub mod model;
pub mod page_file;
pub mod payload;
pub mod pool;
pub mod record;
pub mod runtime;
pub mod snapshot;

pub use bitset::DeletionMarks;
pub use buffer::{ByteBuffer, StringEncoder};
pub use codec::MAGIC;
pub use engine::{IndexStorage, StorageListener, StorageStats};
pub use layer::{
    BidirectionalEdgesCodec, Layer, LayerCodec, LocationInterner, LocationResolver,
    ReverseEdgesCodec,
};
pub use model::{Dependency, FileInfo, LayerId, Location, LocationInfo, PathAndStamp};
pub use page_file::{Page, PageFile, PageWriter, OVERHEAD_WORDS};
pub use payload::LayeredPayloadStore;
pub use pool::StringPool;
pub use record::{FilePool, LocationPool, RecordManager};
pub use runtime::StorageRuntime;
pub use snapshot::SnapshotManager;
