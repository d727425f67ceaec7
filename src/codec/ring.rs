//! Fixed-capacity circular byte buffer.
//!
//! Accumulates a channel payload that arrives split across multiple frames
//! before the complete bytes are handed to the payload codec. Writes and
//! reads wrap around the ring boundary transparently; bytes always come out
//! in exact write order.

use bytes::{Bytes, BytesMut};

use crate::error::{Gtp3Error, Result};

/// Circular byte buffer with a fixed capacity.
pub struct RingBuffer {
    buffer: Box<[u8]>,
    start: usize,
    length: usize,
}

impl RingBuffer {
    /// Create a ring holding at most `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size].into_boxed_slice(),
            start: 0,
            length: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Free space remaining.
    pub fn available(&self) -> usize {
        self.buffer.len() - self.length
    }

    /// Append `data`, wrapping around the ring boundary if needed.
    ///
    /// Fails with [`Gtp3Error::BufferFull`] when `data` does not fit; the
    /// ring is left untouched in that case.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.available() {
            return Err(Gtp3Error::BufferFull);
        }

        let size = self.buffer.len();
        let write_start = (self.start + self.length) % size;

        if write_start + data.len() > size {
            let split_at = size - write_start;
            self.buffer[write_start..].copy_from_slice(&data[..split_at]);
            self.buffer[..data.len() - split_at].copy_from_slice(&data[split_at..]);
        } else {
            self.buffer[write_start..write_start + data.len()].copy_from_slice(data);
        }

        self.length += data.len();
        Ok(())
    }

    /// Copy up to `out.len()` bytes into `out`, releasing them from the
    /// ring. Returns the number of bytes actually copied.
    pub fn extract(&mut self, out: &mut [u8]) -> usize {
        let effective = self.length.min(out.len());
        let size = self.buffer.len();

        if self.start + effective > size {
            let split_at = size - self.start;
            out[..split_at].copy_from_slice(&self.buffer[self.start..]);
            out[split_at..effective].copy_from_slice(&self.buffer[..effective - split_at]);
        } else {
            out[..effective].copy_from_slice(&self.buffer[self.start..self.start + effective]);
        }

        self.length -= effective;
        self.start = (self.start + effective) % size;
        effective
    }

    /// Read and release up to `bytes` buffered bytes.
    pub fn read(&mut self, bytes: usize) -> Bytes {
        let effective = self.length.min(bytes);
        let mut out = BytesMut::zeroed(effective);
        self.extract(&mut out);
        out.freeze()
    }

    /// Read and release everything currently buffered.
    pub fn read_all(&mut self) -> Bytes {
        self.read(self.length)
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.start = 0;
        self.length = 0;
    }
}
