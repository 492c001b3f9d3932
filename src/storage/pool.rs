//! String pool: open-addressing hash table mapping strings to dense ids
//!
//! # Layout
//!
//! ```text
//! table      [0, 3, 0, 1, 0, 0, 2, 0]   slot → id (0 = empty), power-of-two length
//! positions  [-, 0, 9, 17]              id → offset in buffer (index 0 reserved)
//! buffer     [len|"main"][len|"lib"][len|"src"]
//! ```
//!
//! Lookup is linear probing with wraparound until an empty slot or a
//! byte-exact match. The table never holds more than 2/3 occupied slots; the
//! insert that would cross that threshold doubles the table first.
//!
//! Ids start at 1, are assigned in creation order and never change.

use super::buffer::{ByteBuffer, StringEncoder};
use super::codec::{get_int_array, get_len, put_int_array, put_len};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

const INITIAL_TABLE_SIZE: usize = 16;

/// FNV-1a over the encoded bytes; stable across runs since tables are persisted
pub(crate) fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// String interning pool
#[derive(Debug, Clone)]
pub struct StringPool {
    table: Vec<u32>,
    positions: Vec<u32>,
    size: usize,
    buffer: ByteBuffer,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    /// Pool storing raw UTF-8
    pub fn new() -> Self {
        Self::with_buffer(ByteBuffer::plain())
    }

    /// Pool storing path segments through a nested pool
    pub fn optimized() -> Self {
        Self::with_buffer(ByteBuffer::new(StringEncoder::optimized()))
    }

    pub fn with_buffer(buffer: ByteBuffer) -> Self {
        Self {
            table: vec![0; INITIAL_TABLE_SIZE],
            positions: vec![0],
            size: 0,
            buffer,
        }
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current hash table length
    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Bytes used by the backing buffer
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    /// Id of `s`, interning it if absent
    pub fn intern(&mut self, s: &str) -> u32 {
        let bytes = self.buffer.encode(s);
        let hash = hash_bytes(&bytes);

        let mut slot = self.probe(&bytes, hash);
        let existing = self.table[slot];
        if existing != 0 {
            return existing;
        }

        if (self.size + 1) * 3 > self.table.len() * 2 {
            self.rehash(self.table.len() * 2);
            slot = Self::empty_slot(&self.table, hash);
        }

        let id = self.positions.len() as u32;
        assert!(id != 0, "string pool produced reserved id 0");
        let offset = self.buffer.append(&bytes);
        self.positions.push(offset);
        self.table[slot] = id;
        self.size += 1;
        id
    }

    /// Lookup only; `None` if `s` was never interned
    pub fn get(&self, s: &str) -> Option<u32> {
        let bytes = self.buffer.try_encode(s)?;
        let slot = self.probe(&bytes, hash_bytes(&bytes));
        match self.table[slot] {
            0 => None,
            id => Some(id),
        }
    }

    /// Whether `id` was handed out by this pool
    pub fn contains(&self, id: u32) -> bool {
        id != 0 && (id as usize) < self.positions.len()
    }

    /// String for an id, `None` for ids this pool never assigned
    pub fn id_to_string(&self, id: u32) -> Option<String> {
        if !self.contains(id) {
            return None;
        }
        let bytes = self.buffer.record_at(self.positions[id as usize]);
        Some(self.buffer.decode(bytes))
    }

    /// All `(id, string)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (u32, String)> + '_ {
        (1..self.positions.len() as u32).filter_map(move |id| Some((id, self.id_to_string(id)?)))
    }

    fn probe(&self, bytes: &[u8], hash: u32) -> usize {
        let mask = self.table.len() - 1;
        let mut slot = hash as usize & mask;
        loop {
            let id = self.table[slot];
            if id == 0 || self.buffer.record_at(self.positions[id as usize]) == bytes {
                return slot;
            }
            slot = (slot + 1) & mask;
        }
    }

    fn empty_slot(table: &[u32], hash: u32) -> usize {
        let mask = table.len() - 1;
        let mut slot = hash as usize & mask;
        while table[slot] != 0 {
            slot = (slot + 1) & mask;
        }
        slot
    }

    /// Reinsert every id into a larger table.
    ///
    /// Ids are distinct by construction so they are placed in the first empty
    /// slot of their probe sequence without comparing strings.
    fn rehash(&mut self, new_len: usize) {
        let mut table = vec![0; new_len];
        for &id in self.table.iter().filter(|&&id| id != 0) {
            let hash = hash_bytes(self.buffer.record_at(self.positions[id as usize]));
            let slot = Self::empty_slot(&table, hash);
            table[slot] = id;
        }
        self.table = table;
    }

    /// `StringPool-blob := size:i32, ids:int[]-blob, positions:int[]-blob, bytes:ByteBuffer-blob`
    pub fn write_to(&self, buf: &mut impl BufMut) {
        put_len(buf, self.size);
        put_int_array(buf, &self.table);
        put_int_array(buf, &self.positions);
        self.buffer.write_to(buf);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        Self::read(buf, false)
    }

    /// Read the plain pool nested inside an optimized encoder
    pub(crate) fn read_segments(buf: &mut impl Buf) -> Result<Self> {
        Self::read(buf, true)
    }

    fn read(buf: &mut impl Buf, nested: bool) -> Result<Self> {
        let size = get_len(buf, "pool size")?;
        let table = get_int_array(buf, "pool table")?;
        let positions = get_int_array(buf, "pool positions")?;
        let buffer = ByteBuffer::read_nested(buf, nested)?;

        let pool = Self {
            table,
            positions,
            size,
            buffer,
        };
        pool.validate()?;
        Ok(pool)
    }

    fn validate(&self) -> Result<()> {
        if !self.table.len().is_power_of_two() {
            return Err(Error::Corrupt(format!(
                "Pool table length {} is not a power of two",
                self.table.len()
            )));
        }
        if self.positions.is_empty() || self.size != self.positions.len() - 1 {
            return Err(Error::Corrupt(format!(
                "Pool size {} does not match {} positions",
                self.size,
                self.positions.len()
            )));
        }
        let occupied = self.table.iter().filter(|&&id| id != 0).count();
        if occupied != self.size || occupied >= self.table.len() {
            return Err(Error::Corrupt(format!(
                "Pool table holds {} ids, expected {}",
                occupied, self.size
            )));
        }
        if let Some(&id) = self.table.iter().find(|&&id| !self.contains(id) && id != 0) {
            return Err(Error::Corrupt(format!("Pool table references unknown id {}", id)));
        }
        for (id, &offset) in self.positions.iter().enumerate().skip(1) {
            if !self.buffer.is_valid_record(offset) {
                return Err(Error::Corrupt(format!(
                    "Pool id {} points outside the buffer (offset {})",
                    id, offset
                )));
            }
            if let StringEncoder::Optimized(segments) = self.buffer.encoder() {
                let mut record = self.buffer.record_at(offset);
                if record.len() % 4 != 0 {
                    return Err(Error::Corrupt(format!("Pool id {} has a torn segment list", id)));
                }
                while record.has_remaining() {
                    if !segments.contains(record.get_u32()) {
                        return Err(Error::Corrupt(format!(
                            "Pool id {} references unknown segment",
                            id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_intern_is_idempotent() {
        let mut pool = StringPool::new();
        let a = pool.intern("alpha");
        let b = pool.intern("beta");

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(pool.intern("alpha"), a);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get("beta"), Some(b));
        assert_eq!(pool.get("gamma"), None);
        assert_eq!(pool.id_to_string(a).as_deref(), Some("alpha"));
        assert_eq!(pool.id_to_string(0), None);
        assert_eq!(pool.id_to_string(3), None);
    }

    #[test]
    fn test_ids_survive_rehash() {
        let mut pool = StringPool::new();
        let initial = pool.table_len();

        let ids: Vec<u32> = (0..500).map(|i| pool.intern(&format!("key-{}", i))).collect();

        // At least two doublings happened
        assert!(pool.table_len() >= initial * 4);
        assert!(pool.len() * 3 <= pool.table_len() * 2);

        for (i, &id) in ids.iter().enumerate() {
            let key = format!("key-{}", i);
            assert_eq!(id, i as u32 + 1);
            assert_eq!(pool.get(&key), Some(id));
            assert_eq!(pool.id_to_string(id), Some(key));
        }
    }

    #[test]
    fn test_distinct_strings_get_distinct_ids() {
        let mut pool = StringPool::optimized();
        let keys = ["a/b", "a/c", "a", "b/a", "", "a/b/"];
        let ids: Vec<u32> = keys.iter().map(|k| pool.intern(k)).collect();

        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), keys.len());

        for (k, id) in keys.iter().zip(ids) {
            assert_eq!(pool.id_to_string(id).as_deref(), Some(*k));
        }
    }

    #[test]
    fn test_blob_reload() -> Result<()> {
        let mut pool = StringPool::optimized();
        for i in 0..100 {
            pool.intern(&format!("lib/src/file_{}.dart", i));
        }

        let mut out = BytesMut::new();
        pool.write_to(&mut out);
        let mut buf = out.freeze();
        let mut loaded = StringPool::read_from(&mut buf)?;
        assert!(!buf.has_remaining());

        assert_eq!(loaded.len(), 100);
        assert_eq!(loaded.get("lib/src/file_42.dart"), pool.get("lib/src/file_42.dart"));
        // New ids continue after the loaded ones
        assert_eq!(loaded.intern("lib/new.dart"), 101);
        Ok(())
    }

    #[test]
    fn test_blob_with_bad_table_rejected() {
        let mut pool = StringPool::new();
        pool.intern("x");

        let mut out = BytesMut::new();
        put_len(&mut out, 2); // lies about size
        put_int_array(&mut out, &pool.table);
        put_int_array(&mut out, &pool.positions);
        pool.buffer.write_to(&mut out);

        let mut buf = out.freeze();
        assert!(matches!(StringPool::read_from(&mut buf), Err(Error::Corrupt(_))));
    }
}
