//! Bounds-checked big-endian reader and writer.
//!
//! All multi-byte fields are network byte order. Every read checks the
//! remaining length first; nothing reads past the end of the slice.

use super::ProtocolError;

/// Sequential reader over a borrowed byte slice.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless at least `needed` bytes remain.
    #[inline]
    pub fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if needed > self.remaining() {
            return Err(ProtocolError::Truncated {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Validate an element-count prefix before reading the array behind it.
    ///
    /// Rejects counts above `max`, then counts whose `count * elem_size`
    /// bytes are not actually present.
    pub fn expect_elements(
        &self,
        count: usize,
        elem_size: usize,
        max: usize,
    ) -> Result<(), ProtocolError> {
        if count > max {
            return Err(ProtocolError::CountOutOfRange { count, max });
        }
        self.ensure(count * elem_size)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    /// Fixed-width NUL-padded string field.
    pub fn fixed_str(&mut self, width: usize) -> Result<String, ProtocolError> {
        let raw = self.bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Fail if any bytes remain.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

/// Append-only big-endian writer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Write `s` into a `width`-byte NUL-padded field, truncating at a
    /// character boundary if it does not fit.
    pub fn put_fixed_str(&mut self, s: &str, width: usize) {
        let mut end = s.len().min(width);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.extend_from_slice(&s.as_bytes()[..end]);
        self.buf.resize(self.buf.len() + (width - end), 0);
    }

    /// Overwrite previously written bytes at `offset`.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
