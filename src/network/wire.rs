//! Wire Codec
//!
//! Big-endian framing primitives shared by every wire-touching module.
//! All integers are big-endian; strings are u16-length-prefixed UTF-8.
//! The handshake format is bit-exact, so nothing here goes through serde.

use thiserror::Error;

/// Wire decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Ran out of bytes mid-field.
    #[error("unexpected end of payload: needed {needed} bytes, {available} available")]
    UnexpectedEnd {
        /// Bytes the current field required.
        needed: usize,
        /// Bytes left in the payload.
        available: usize,
    },
    /// Declared length field is not usable.
    #[error("invalid length field: {0}")]
    InvalidLength(i32),
    /// String bytes are not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Cursor-style reader over a received payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Create a reader over a payload.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEnd {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a boolean (any nonzero byte is true).
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a big-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian i64.
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    /// Read a fixed-size block into an array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a u16-length-prefixed block, rejecting a zero length.
    ///
    /// Used for key material and ciphertext, where an empty block is a
    /// protocol violation rather than a valid value.
    pub fn read_block(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u16()?;
        if len == 0 {
            return Err(WireError::InvalidLength(0));
        }
        self.take(len as usize)
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

/// Growable writer producing a wire payload.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single byte.
    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Append a boolean as one byte.
    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(v as u8)
    }

    /// Append a big-endian u16.
    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a big-endian u32.
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a big-endian i64.
    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append raw bytes with no length prefix.
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Append a u16-length-prefixed block.
    pub fn put_block(&mut self, v: &[u8]) -> &mut Self {
        debug_assert!(v.len() <= u16::MAX as usize);
        self.put_u16(v.len() as u16);
        self.put_bytes(v)
    }

    /// Append a u16-length-prefixed UTF-8 string.
    pub fn put_string(&mut self, v: &str) -> &mut Self {
        self.put_block(v.as_bytes())
    }

    /// Finish and take the payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_round_trip() {
        let mut w = WireWriter::new();
        w.put_u8(7).put_u16(1024).put_u32(70_000).put_i64(-5);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u16().unwrap(), 1024);
        assert_eq!(r.read_u32().unwrap(), 70_000);
        assert_eq!(r.read_i64().unwrap(), -5);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = WireWriter::new();
        w.put_u16(0x0102).put_u32(0x03040506);
        assert_eq!(w.into_bytes(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_string_round_trip() {
        let mut w = WireWriter::new();
        w.put_string("Alice").put_string("");
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "Alice");
        assert_eq!(r.read_string().unwrap(), "");
    }

    #[test]
    fn test_truncated_string_fails() {
        // Length prefix claims 10 bytes, only 3 present.
        let bytes = [0, 10, b'a', b'b', b'c'];
        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.read_string(),
            Err(WireError::UnexpectedEnd { needed: 10, available: 3 })
        ));
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let bytes = [0, 2, 0xff, 0xfe];
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_string(), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn test_empty_block_rejected() {
        let bytes = [0, 0];
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_block(), Err(WireError::InvalidLength(0)));
    }

    #[test]
    fn test_read_past_end() {
        let mut r = WireReader::new(&[1]);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn test_fixed_array_read() {
        let data = [9u8; 32];
        let mut w = WireWriter::new();
        w.put_bytes(&data);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        let arr: [u8; 32] = r.read_array().unwrap();
        assert_eq!(arr, data);
    }
}
