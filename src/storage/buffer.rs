//! Growable byte buffer backing interned strings
//!
//! Each record is stored as `[4-byte length][encoded bytes]` and addressed by
//! its starting offset. How a string becomes bytes is decided by the buffer's
//! [`StringEncoder`]:
//!
//! ```text
//! Plain       "lib/src/a.dart" → UTF-8 bytes
//! Optimized   "lib/src/a.dart" → [id("lib"), id("src"), id("a.dart")]   (nested plain pool)
//! ```
//!
//! The optimized encoder pays off for path-like keys that share long prefixes.

use super::codec::{get_bytes, get_len, get_u8, put_len};
use super::pool::StringPool;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

const LEN_PREFIX: usize = 4;
const SEGMENT_SEPARATOR: char = '/';

const TAG_PLAIN: u8 = 1;
const TAG_OPTIMIZED: u8 = 2;

/// Strategy for turning strings into stored bytes
#[derive(Debug, Clone)]
pub enum StringEncoder {
    /// Raw UTF-8
    Plain,
    /// Path segments interned into a nested plain pool, stored as 4-byte ids
    Optimized(Box<StringPool>),
}

impl StringEncoder {
    pub fn optimized() -> Self {
        StringEncoder::Optimized(Box::new(StringPool::new()))
    }

    fn tag(&self) -> u8 {
        match self {
            StringEncoder::Plain => TAG_PLAIN,
            StringEncoder::Optimized(_) => TAG_OPTIMIZED,
        }
    }

    /// Encode, interning new segments if needed
    fn encode(&mut self, s: &str) -> Vec<u8> {
        match self {
            StringEncoder::Plain => s.as_bytes().to_vec(),
            StringEncoder::Optimized(segments) => {
                let mut out = Vec::new();
                for segment in s.split(SEGMENT_SEPARATOR) {
                    out.put_u32(segments.intern(segment));
                }
                out
            }
        }
    }

    /// Encode without mutating; `None` if some segment was never interned
    fn try_encode(&self, s: &str) -> Option<Vec<u8>> {
        match self {
            StringEncoder::Plain => Some(s.as_bytes().to_vec()),
            StringEncoder::Optimized(segments) => {
                let mut out = Vec::new();
                for segment in s.split(SEGMENT_SEPARATOR) {
                    out.put_u32(segments.get(segment)?);
                }
                Some(out)
            }
        }
    }

    fn decode(&self, mut bytes: &[u8]) -> String {
        match self {
            StringEncoder::Plain => String::from_utf8_lossy(bytes).into_owned(),
            StringEncoder::Optimized(segments) => {
                let mut out = String::new();
                let mut first = true;
                while bytes.remaining() >= 4 {
                    if !first {
                        out.push(SEGMENT_SEPARATOR);
                    }
                    first = false;
                    if let Some(segment) = segments.id_to_string(bytes.get_u32()) {
                        out.push_str(&segment);
                    }
                }
                out
            }
        }
    }
}

/// Append-only byte store for length-prefixed records
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    encoder: StringEncoder,
}

impl ByteBuffer {
    pub fn new(encoder: StringEncoder) -> Self {
        Self {
            data: Vec::new(),
            encoder,
        }
    }

    pub fn plain() -> Self {
        Self::new(StringEncoder::Plain)
    }

    pub fn encoder(&self) -> &StringEncoder {
        &self.encoder
    }

    /// Number of bytes stored
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encode a string with this buffer's encoder
    pub fn encode(&mut self, s: &str) -> Vec<u8> {
        self.encoder.encode(s)
    }

    /// Encode without interning anything
    pub fn try_encode(&self, s: &str) -> Option<Vec<u8>> {
        self.encoder.try_encode(s)
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        self.encoder.decode(bytes)
    }

    /// Append a record, returning its offset
    pub fn append(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.data.len();
        assert!(
            offset + LEN_PREFIX + bytes.len() <= u32::MAX as usize,
            "byte buffer exceeds 4 GB"
        );
        self.data.put_u32(bytes.len() as u32);
        self.data.extend_from_slice(bytes);
        offset as u32
    }

    /// Record bytes at an offset previously returned by `append`
    pub fn record_at(&self, offset: u32) -> &[u8] {
        let start = offset as usize;
        let mut prefix = &self.data[start..start + LEN_PREFIX];
        let len = prefix.get_u32() as usize;
        &self.data[start + LEN_PREFIX..start + LEN_PREFIX + len]
    }

    /// Whether `offset` addresses a complete record
    pub fn is_valid_record(&self, offset: u32) -> bool {
        let start = offset as usize;
        match self.data.get(start..start + LEN_PREFIX) {
            Some(mut prefix) => {
                let len = prefix.get_u32() as usize;
                start + LEN_PREFIX + len <= self.data.len()
            }
            None => false,
        }
    }

    /// `ByteBuffer-blob := length:i32, raw bytes, encoderTag:u8 [, nested StringPool-blob]`
    pub fn write_to(&self, buf: &mut impl BufMut) {
        put_len(buf, self.data.len());
        buf.put_slice(&self.data);
        buf.put_u8(self.encoder.tag());
        if let StringEncoder::Optimized(segments) = &self.encoder {
            segments.write_to(buf);
        }
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        Self::read_nested(buf, false)
    }

    pub(crate) fn read_nested(buf: &mut impl Buf, nested: bool) -> Result<Self> {
        let len = get_len(buf, "byte buffer length")?;
        let data = get_bytes(buf, len, "byte buffer")?.to_vec();
        let encoder = match get_u8(buf, "encoder tag")? {
            TAG_PLAIN => StringEncoder::Plain,
            TAG_OPTIMIZED if !nested => {
                StringEncoder::Optimized(Box::new(StringPool::read_segments(buf)?))
            }
            tag => {
                return Err(Error::Corrupt(format!(
                    "Unknown encoder tag {} (nested: {})",
                    tag, nested
                )))
            }
        };
        Ok(Self { data, encoder })
    }
}
