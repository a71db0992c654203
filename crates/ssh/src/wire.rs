//! Encoding of the SSH data types from RFC 4251 Section 5.
//!
//! Writing goes through [`SshBufMut`], an extension of [`bytes::BufMut`], so any
//! `Vec<u8>` or `BytesMut` can be used as a message builder. Reading uses the
//! borrowing [`Reader`] cursor, which reports truncation as a protocol error
//! instead of panicking.

use bytes::BufMut;
use fynx_platform::{FynxError, FynxResult};

/// Writers for the SSH wire types.
pub trait SshBufMut: BufMut {
    /// `boolean`
    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// `string` (uint32 length followed by the bytes)
    fn put_string(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }

    /// `name-list` (comma separated, as a `string`)
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_string(joined.as_bytes());
    }

    /// `mpint` from an unsigned big-endian magnitude
    fn put_mpint(&mut self, magnitude: &[u8]) {
        let encoded = mpint_body(magnitude);
        self.put_string(&encoded);
    }
}

impl<T: BufMut + ?Sized> SshBufMut for T {}

/// Two's complement body of an `mpint` for a non-negative magnitude.
///
/// Leading zero bytes are stripped and a zero byte is prepended when the top
/// bit is set. Zero encodes as an empty body.
pub fn mpint_body(magnitude: &[u8]) -> Vec<u8> {
    let first = magnitude.iter().position(|&b| b != 0);
    let Some(first) = first else {
        return Vec::new();
    };
    let trimmed = &magnitude[first..];
    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Full `mpint` encoding (length prefix included).
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(magnitude.len() + 5);
    out.put_mpint(magnitude);
    out
}

/// Cursor over a received message.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the first byte of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything after the current position.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> FynxResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(FynxError::Protocol(format!(
                "Truncated message: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// `byte`
    pub fn u8(&mut self) -> FynxResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// `boolean`
    pub fn bool(&mut self) -> FynxResult<bool> {
        Ok(self.u8()? != 0)
    }

    /// `uint32`
    pub fn u32(&mut self) -> FynxResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Fixed number of raw bytes.
    pub fn bytes(&mut self, n: usize) -> FynxResult<&'a [u8]> {
        self.take(n)
    }

    /// `string` as raw bytes
    pub fn string(&mut self) -> FynxResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// `string` decoded as UTF-8 (lossy, peers send arbitrary text)
    pub fn utf8(&mut self) -> FynxResult<String> {
        Ok(String::from_utf8_lossy(self.string()?).into_owned())
    }

    /// `name-list`
    pub fn name_list(&mut self) -> FynxResult<Vec<String>> {
        let raw = self.string()?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let text = std::str::from_utf8(raw)
            .map_err(|_| FynxError::Protocol("name-list is not valid UTF-8".to_string()))?;
        Ok(text.split(',').map(str::to_string).collect())
    }

    /// `mpint` as its raw two's complement body
    pub fn mpint(&mut self) -> FynxResult<&'a [u8]> {
        self.string()
    }
}
