//! Growable array of optional payload blobs, one store per layer
//!
//! ```text
//! slot:   0      1         2      3
//!        [-] [Some(..)] [None] [Some(..)]
//! ```
//!
//! Slot 0 is never used so 0 can mean "no slot" in the record managers.

use super::codec::{get_bytes, get_i32, get_len, put_len};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

#[derive(Debug, Clone)]
pub struct LayeredPayloadStore {
    slots: Vec<Option<Bytes>>,
}

impl Default for LayeredPayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LayeredPayloadStore {
    pub fn new() -> Self {
        Self { slots: vec![None] }
    }

    /// Number of addressable slots, counting the unused slot 0
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently holding a payload
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Grow with `None` slots until `slot` is addressable
    pub fn ensure(&mut self, slot: u32) {
        let needed = slot as usize + 1;
        if self.slots.len() < needed {
            self.slots.resize(needed, None);
        }
    }

    /// Append a fresh empty slot and return its index
    pub fn allocate(&mut self) -> u32 {
        self.slots.push(None);
        (self.slots.len() - 1) as u32
    }

    pub fn set(&mut self, slot: u32, payload: Bytes) {
        assert!(slot != 0, "payload slot 0 is reserved");
        self.ensure(slot);
        self.slots[slot as usize] = Some(payload);
    }

    pub fn get(&self, slot: u32) -> Option<&Bytes> {
        if slot == 0 {
            return None;
        }
        self.slots.get(slot as usize).and_then(|s| s.as_ref())
    }

    pub fn clear(&mut self, slot: u32) {
        if let Some(s) = self.slots.get_mut(slot as usize) {
            *s = None;
        }
    }

    /// `LayeredPayloadStore-blob := count:i32, { len:i32 (-1 = empty), bytes }*`
    pub fn write_to(&self, buf: &mut impl BufMut) {
        put_len(buf, self.slots.len());
        for slot in &self.slots {
            match slot {
                Some(bytes) => {
                    put_len(buf, bytes.len());
                    buf.put_slice(bytes);
                }
                None => buf.put_i32(-1),
            }
        }
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        let count = get_len(buf, "payload slot count")?;
        if count == 0 {
            return Err(Error::Corrupt("Payload store without slot 0".to_string()));
        }
        let mut slots = Vec::with_capacity(count.min(buf.remaining() / 4 + 1));
        for _ in 0..count {
            let len = get_i32(buf, "payload length")?;
            let slot = match len {
                -1 => None,
                n if n >= 0 => Some(get_bytes(buf, n as usize, "payload")?),
                n => {
                    return Err(Error::Corrupt(format!("Invalid payload length {}", n)));
                }
            };
            slots.push(slot);
        }
        if slots[0].is_some() {
            return Err(Error::Corrupt("Payload stored in reserved slot 0".to_string()));
        }
        Ok(Self { slots })
    }
}
