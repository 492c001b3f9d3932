//! Deletion marks: one bit per record id
//!
//! Deleting never frees an id. The bit is set, the payload slot is cleared and
//! every read consults the marks before decoding.

use super::codec::{get_id, get_len, put_id, put_len};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

const WORD_BITS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionMarks {
    words: Vec<u64>,
}

impl DeletionMarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, id: u32) {
        let (word, bit) = Self::locate(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= bit;
    }

    pub fn unmark(&mut self, id: u32) {
        let (word, bit) = Self::locate(id);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
    }

    pub fn is_marked(&self, id: u32) -> bool {
        let (word, bit) = Self::locate(id);
        self.words.get(word).map_or(false, |w| w & bit != 0)
    }

    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Marked ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..WORD_BITS)
                .filter(move |b| w & (1u64 << b) != 0)
                .map(move |b| (i * WORD_BITS + b) as u32)
        })
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    fn locate(id: u32) -> (usize, u64) {
        let id = id as usize;
        (id / WORD_BITS, 1u64 << (id % WORD_BITS))
    }

    /// `BitSet-blob := cardinality:i32, set-bit-indices:i32[cardinality]`
    pub fn write_to(&self, buf: &mut impl BufMut) {
        put_len(buf, self.cardinality());
        for id in self.iter() {
            put_id(buf, id);
        }
    }

    /// Read marks over ids `1..=max_id`; any other id is `Error::Corrupt`
    pub fn read_from(buf: &mut impl Buf, max_id: u32) -> Result<Self> {
        let count = get_len(buf, "deletion mark count")?;
        let mut marks = Self::new();
        for _ in 0..count {
            let id = get_id(buf, "deleted id")?;
            if id == 0 || id > max_id {
                return Err(Error::Corrupt(format!(
                    "Deleted id {} outside 1..={}",
                    id, max_id
                )));
            }
            marks.mark(id);
        }
        Ok(marks)
    }
}
