//! Key → payload slot indirection on top of a [`StringPool`]

use super::codec::{get_int_array, put_int_array};
use super::pool::StringPool;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

/// A string pool with one extra-info cell per id.
///
/// The cell holds 0 until a payload slot is assigned, otherwise the 1-based
/// slot index into a [`LayeredPayloadStore`](super::payload::LayeredPayloadStore).
#[derive(Debug, Clone)]
pub struct RecordManager {
    pool: StringPool,
    extra_info: Vec<u32>,
}

/// Pool of location identifiers
pub type LocationPool = RecordManager;

/// Pool of file paths
pub type FilePool = RecordManager;

impl RecordManager {
    pub fn new(pool: StringPool) -> Self {
        Self {
            pool,
            extra_info: vec![0],
        }
    }

    /// Manager whose keys are stored path-segment encoded
    pub fn optimized() -> Self {
        Self::new(StringPool::optimized())
    }

    pub fn pool(&self) -> &StringPool {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Intern `key`, returning its id
    pub fn add(&mut self, key: &str) -> u32 {
        let id = self.pool.intern(key);
        assert!(id != 0, "record manager produced id 0 for {:?}", key);
        let index = id as usize;
        if index == self.extra_info.len() {
            self.extra_info.push(0);
        }
        assert!(
            index < self.extra_info.len(),
            "record id {} skipped ahead of extra info ({} cells)",
            id,
            self.extra_info.len()
        );
        id
    }

    /// Id of `key` without interning
    pub fn get(&self, key: &str) -> Option<u32> {
        self.pool.get(key)
    }

    pub fn key_of(&self, id: u32) -> Option<String> {
        self.pool.id_to_string(id)
    }

    /// Payload slot assigned to `key`
    pub fn payload_slot(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|id| self.payload_slot_of(id))
    }

    /// Payload slot assigned to an id
    pub fn payload_slot_of(&self, id: u32) -> Option<u32> {
        match self.extra_info.get(id as usize) {
            Some(&slot) if slot != 0 && id != 0 => Some(slot),
            _ => None,
        }
    }

    pub fn set_payload(&mut self, id: u32, slot: u32) {
        assert!(
            self.pool.contains(id),
            "payload assigned to unknown record id {}",
            id
        );
        self.extra_info[id as usize] = slot;
    }

    /// Intern `key` and assign its slot
    pub fn set_payload_for(&mut self, key: &str, slot: u32) -> u32 {
        let id = self.add(key);
        self.extra_info[id as usize] = slot;
        id
    }

    /// `RecordManager-blob := StringPool-blob, extraInfo:int[]-blob`
    pub fn write_to(&self, buf: &mut impl BufMut) {
        self.pool.write_to(buf);
        put_int_array(buf, &self.extra_info);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        let pool = StringPool::read_from(buf)?;
        let extra_info = get_int_array(buf, "record extra info")?;
        if extra_info.len() != pool.len() + 1 {
            return Err(Error::Corrupt(format!(
                "Record manager has {} extra info cells for {} keys",
                extra_info.len(),
                pool.len()
            )));
        }
        Ok(Self { pool, extra_info })
    }
}
