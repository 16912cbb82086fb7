//! Fixed-layout request blocks and readers for driver replies.
//!
//! Driver requests are zero-filled blocks with big-endian words and
//! NUL-terminated ASCII strings at fixed offsets.

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};

/// A zero-filled block of fixed length.
///
/// Writing past the end of the block is a bug in the layout, not a runtime
/// condition, and panics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireBuffer {
    bytes: BytesMut,
}

impl WireBuffer {
    pub fn new(len: usize) -> Self {
        let mut bytes = BytesMut::with_capacity(len);
        bytes.resize(len, 0);
        WireBuffer { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Writes `value` and its terminator into the `capacity` bytes starting
    /// at `offset`.
    pub fn put_str(&mut self, offset: usize, capacity: usize, value: &str) -> Result<()> {
        let encoded = c_string(value)?;
        if encoded.len() > capacity {
            return Err(Error::FieldOverflow {
                value: value.to_string(),
                capacity,
            });
        }
        self.bytes[offset..offset + encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// Encodes `value` as a NUL-terminated ASCII string.
pub fn c_string(value: &str) -> Result<Vec<u8>> {
    if !value.is_ascii() || value.contains('\0') {
        return Err(Error::InvalidString(value.to_string()));
    }
    let mut encoded = Vec::with_capacity(value.len() + 1);
    encoded.extend_from_slice(value.as_bytes());
    encoded.push(0);
    Ok(encoded)
}

/// Reads a NUL-terminated string. A missing terminator ends the string at
/// the end of `bytes`.
pub fn read_c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads the big-endian word at `offset`, if `bytes` is long enough.
pub fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let mut field = bytes.get(offset..offset + 4)?;
    Some(field.get_u32())
}

/// Splits a reply of exactly `N` words into an array.
pub fn read_words<const N: usize>(bytes: &[u8], what: &'static str) -> Result<[u32; N]> {
    if bytes.len() != N * 4 {
        return Err(Error::MalformedResponse {
            what,
            expected: N * 4,
            actual: bytes.len(),
        });
    }
    let mut buf = bytes;
    let mut words = [0; N];
    for word in words.iter_mut() {
        *word = buf.get_u32();
    }
    Ok(words)
}
