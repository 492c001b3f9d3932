//! Bounds-checked primitives shared by the record codec and the snapshot format
//!
//! All integers are big-endian. Every read checks `remaining()` first so a
//! truncated buffer surfaces as `Error::Corrupt` instead of a panic.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

/// Framing magic written after every structural block of a snapshot
pub const MAGIC: i64 = 0xCAFE_BABE;

fn ensure(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Corrupt(format!(
            "Unexpected end of data reading {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf, what: &str) -> Result<u8> {
    ensure(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn get_i32(buf: &mut impl Buf, what: &str) -> Result<i32> {
    ensure(buf, 4, what)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut impl Buf, what: &str) -> Result<i64> {
    ensure(buf, 8, what)?;
    Ok(buf.get_i64())
}

/// Read a non-negative i32 as a length or count
pub fn get_len(buf: &mut impl Buf, what: &str) -> Result<usize> {
    let n = get_i32(buf, what)?;
    usize::try_from(n).map_err(|_| Error::Corrupt(format!("Negative {}: {}", what, n)))
}

/// Read a non-negative i32 as an id
pub fn get_id(buf: &mut impl Buf, what: &str) -> Result<u32> {
    let n = get_i32(buf, what)?;
    u32::try_from(n).map_err(|_| Error::Corrupt(format!("Negative {}: {}", what, n)))
}

/// Convert a length to its on-disk i32 form
pub fn put_len(buf: &mut impl BufMut, len: usize) {
    assert!(len <= i32::MAX as usize, "length {} does not fit in i32", len);
    buf.put_i32(len as i32);
}

pub fn put_id(buf: &mut impl BufMut, id: u32) {
    assert!(id <= i32::MAX as u32, "id {} does not fit in i32", id);
    buf.put_i32(id as i32);
}

pub fn get_bytes(buf: &mut impl Buf, len: usize, what: &str) -> Result<Bytes> {
    ensure(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

/// `int[]-blob := count:i32, value:i32*`
pub fn put_int_array(buf: &mut impl BufMut, values: &[u32]) {
    put_len(buf, values.len());
    for &v in values {
        put_id(buf, v);
    }
}

pub fn get_int_array(buf: &mut impl Buf, what: &str) -> Result<Vec<u32>> {
    let count = get_len(buf, what)?;
    ensure(buf, count.saturating_mul(4), what)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(get_id(buf, what)?);
    }
    Ok(values)
}

/// `UTF8 := length:i32, bytes`
pub fn put_str(buf: &mut impl BufMut, s: &str) {
    put_len(buf, s.len());
    buf.put_slice(s.as_bytes());
}

pub fn get_str(buf: &mut impl Buf, what: &str) -> Result<String> {
    let len = get_len(buf, what)?;
    let bytes = get_bytes(buf, len, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Corrupt(format!("Invalid UTF-8 in {}: {}", what, e)))
}

/// Truncation inside a payload blob is a codec failure, not snapshot corruption
pub fn as_codec_error(e: Error) -> Error {
    match e {
        Error::Corrupt(msg) => Error::Codec(msg),
        other => other,
    }
}

pub fn put_magic(buf: &mut impl BufMut) {
    buf.put_i64(MAGIC);
}

/// Check the framing magic after the named section
pub fn check_magic(buf: &mut impl Buf, section: &str) -> Result<()> {
    let magic = get_i64(buf, section)?;
    if magic != MAGIC {
        return Err(Error::Corrupt(format!(
            "Bad magic after {}: expected {:#x}, found {:#x}",
            section, MAGIC, magic
        )));
    }
    Ok(())
}
