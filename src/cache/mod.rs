//! Memory-bounded caches for paged storage
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ TwoQueueCache<T, W>                           │
//! │   MAIN  hot, re-referenced   (≤ max)          │
//! │   IN    newly admitted       (≤ 20% of max)   │
//! │   OUT   ghosts of IN evictees (≤ 50% of max)  │
//! └──────────────────────┬────────────────────────┘
//!                        │ dirty evictees, sorted by position
//!                        ▼
//!               CacheWriter::write_back
//! ```
//!
//! Sizes are counted in 4-byte words as reported by
//! [`CacheObject::memory_size`]; budgets are configured in KB.

pub mod two_queue;

pub use two_queue::{Queue, TwoQueueCache, TwoQueueStats};

use crate::error::Result;

/// An object held by a cache
pub trait CacheObject {
    /// Unique key of the object
    fn position(&self) -> i32;

    /// Memory used by the object, in 4-byte words
    fn memory_size(&self) -> usize;

    /// Whether the object must be written back before it is dropped
    fn is_changed(&self) -> bool;

    /// Whether the object may be evicted right now
    fn can_remove(&self) -> bool {
        true
    }
}

/// Receives dirty objects evicted from a cache
pub trait CacheWriter<T> {
    /// Persist a batch of evicted objects, ordered by position
    fn write_back(&mut self, batch: Vec<T>) -> Result<()>;

    /// Called when eviction keeps finding objects that cannot be removed
    fn flush_log(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Cache operations used by paged storage
pub trait Cache<T: CacheObject> {
    /// Drop every entry without writing anything back
    fn clear(&mut self);

    /// Lookup that leaves recency order untouched
    fn find(&self, pos: i32) -> Option<&T>;

    /// Lookup that records an access
    fn get(&mut self, pos: i32) -> Option<&T>;

    /// Every changed object, ordered by position
    fn get_all_changed(&self) -> Vec<&T>;

    /// Budget in KB
    fn max_size(&self) -> usize;

    /// Resident size in KB
    fn size(&self) -> usize;

    fn put(&mut self, obj: T) -> Result<()>;

    fn remove(&mut self, pos: i32) -> Option<T>;

    /// Change the budget; may run an eviction pass
    fn set_max_size(&mut self, max_kb: usize) -> Result<()>;

    /// Replace the object at `pos`, returning the previous one if it was resident
    fn update(&mut self, pos: i32, obj: T) -> Result<Option<T>>;
}
