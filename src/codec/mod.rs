//! Binary codec primitives.
//!
//! [`BufferReader`]/[`BufferWriter`] are the cursor codecs every frame field
//! goes through; [`RingBuffer`] accumulates fragmented channel payloads.

mod buffer;
mod ring;

pub use buffer::{blob_len, str_len, BufferReader, BufferWriter};
pub use ring::RingBuffer;
