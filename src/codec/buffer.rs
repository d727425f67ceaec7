//! Cursor-based binary reader and writer.
//!
//! All multi-byte integers are Big Endian (network byte order). Variable
//! length values use the length-prefixed blob format: a u16 length followed
//! by the raw bytes, which caps any embedded blob at 65535 bytes. Strings
//! are UTF-8 bytes wrapped in the blob format.
//!
//! Every access advances an internal cursor via [`BufferReader::skip`] /
//! [`BufferWriter::skip`], which return the offset *before* the move.
//! Accessing past the end of the buffer fails with
//! [`Gtp3Error::OutOfBounds`] instead of panicking or silently truncating.

use bytes::{Bytes, BytesMut};

use crate::error::{Gtp3Error, Result};

/// Reading cursor over an immutable byte buffer.
pub struct BufferReader {
    data: Bytes,
    offset: usize,
}

impl BufferReader {
    /// Create a reader positioned at the start of `data`.
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    /// Total buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the buffer is zero length.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current cursor position.
    pub fn tell(&self) -> usize {
        self.offset
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Reserve `len` bytes and return the offset before the reservation.
    pub fn skip(&mut self, len: usize) -> Result<usize> {
        let current = self.offset;
        if len > self.data.len() - current {
            return Err(Gtp3Error::OutOfBounds);
        }
        self.offset = current + len;
        Ok(current)
    }

    /// Move the cursor to an absolute position. Negative positions are
    /// offsets from the end of the buffer.
    pub fn seek(&mut self, pos: isize) -> Result<()> {
        let target = if pos < 0 {
            self.data
                .len()
                .checked_add_signed(pos)
                .ok_or(Gtp3Error::OutOfBounds)?
        } else {
            pos as usize
        };
        if target > self.data.len() {
            return Err(Gtp3Error::OutOfBounds);
        }
        self.offset = target;
        Ok(())
    }

    /// Read a single byte, nonzero means true.
    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.uint8()? != 0)
    }

    pub fn uint8(&mut self) -> Result<u8> {
        let at = self.skip(1)?;
        Ok(self.data[at])
    }

    pub fn uint16(&mut self) -> Result<u16> {
        let at = self.skip(2)?;
        Ok(u16::from_be_bytes([self.data[at], self.data[at + 1]]))
    }

    pub fn uint32(&mut self) -> Result<u32> {
        let at = self.skip(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[at..at + 4]);
        Ok(u32::from_be_bytes(raw))
    }

    /// Read a u64 laid out on the wire as two consecutive big-endian u32
    /// halves, which is byte-identical to a single big-endian u64.
    pub fn uint64(&mut self) -> Result<u64> {
        let at = self.skip(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[at..at + 8]);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read a length-prefixed blob. Zero-copy slice of the source buffer.
    pub fn blob(&mut self) -> Result<Bytes> {
        let len = self.uint16()? as usize;
        let at = self.skip(len)?;
        Ok(self.data.slice(at..at + len))
    }

    /// Read a UTF-8 string wrapped in the blob format.
    pub fn str(&mut self) -> Result<String> {
        let raw = self.blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Gtp3Error::MalformedFrame("invalid UTF-8 string".into()))
    }
}

/// Writing cursor over a fixed-capacity byte buffer.
///
/// The writer refuses to grow past the capacity given at construction,
/// failing with [`Gtp3Error::OutOfBounds`] instead.
pub struct BufferWriter {
    data: BytesMut,
    capacity: usize,
    offset: usize,
}

impl BufferWriter {
    /// Create a writer bounded at `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            offset: 0,
        }
    }

    /// Current cursor position.
    pub fn tell(&self) -> usize {
        self.offset
    }

    /// Reserve `len` bytes (zero-filled if extending) and return the offset
    /// before the reservation.
    pub fn skip(&mut self, len: usize) -> Result<usize> {
        let current = self.offset;
        let end = current.checked_add(len).ok_or(Gtp3Error::OutOfBounds)?;
        if end > self.capacity {
            return Err(Gtp3Error::OutOfBounds);
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.offset = end;
        Ok(current)
    }

    /// Move the cursor to an absolute position within the written region.
    /// Negative positions are offsets from the end of the written region,
    /// which allows rewinding to patch a previously reserved field.
    pub fn seek(&mut self, pos: isize) -> Result<()> {
        let target = if pos < 0 {
            self.data
                .len()
                .checked_add_signed(pos)
                .ok_or(Gtp3Error::OutOfBounds)?
        } else {
            pos as usize
        };
        if target > self.data.len() {
            return Err(Gtp3Error::OutOfBounds);
        }
        self.offset = target;
        Ok(())
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.uint8(u8::from(v))
    }

    pub fn uint8(&mut self, v: u8) -> Result<()> {
        let at = self.skip(1)?;
        self.data[at] = v;
        Ok(())
    }

    pub fn uint16(&mut self, v: u16) -> Result<()> {
        let at = self.skip(2)?;
        self.data[at..at + 2].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn uint32(&mut self, v: u32) -> Result<()> {
        let at = self.skip(4)?;
        self.data[at..at + 4].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Write a u64 as two big-endian u32 halves (a single big-endian u64).
    pub fn uint64(&mut self, v: u64) -> Result<()> {
        let at = self.skip(8)?;
        self.data[at..at + 8].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Write a length-prefixed blob. Blobs longer than 65535 bytes do not
    /// fit the u16 length prefix and are rejected.
    pub fn blob(&mut self, v: &[u8]) -> Result<()> {
        let len = u16::try_from(v.len()).map_err(|_| Gtp3Error::OutOfBounds)?;
        self.uint16(len)?;
        let at = self.skip(v.len())?;
        self.data[at..at + v.len()].copy_from_slice(v);
        Ok(())
    }

    /// Write a UTF-8 string in the blob format.
    pub fn str(&mut self, v: &str) -> Result<()> {
        self.blob(v.as_bytes())
    }

    /// Consume the writer, returning the written bytes.
    pub fn done(self) -> Bytes {
        self.data.freeze()
    }
}

/// Exact encoded size of a string field (length prefix + UTF-8 bytes).
pub fn str_len(v: &str) -> usize {
    2 + v.len()
}

/// Exact encoded size of a blob field (length prefix + bytes).
pub fn blob_len(v: &[u8]) -> usize {
    2 + v.len()
}
