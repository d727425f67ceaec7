//! Payload envelope codec.
//!
//! Every channel payload travels inside a one-byte envelope: a mode byte
//! followed by the payload bytes, either raw or zlib-deflated. Payloads at
//! or above the compression threshold are deflated; compression runs on the
//! blocking pool so large payloads never stall the connection driver.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Gtp3Error, Result};

/// Envelope mode bytes.
pub mod mode {
    /// Payload bytes follow as-is.
    pub const RAW: u8 = 0x00;
    /// Payload bytes are zlib-deflated.
    pub const DEFLATE: u8 = 0x01;
}

/// Payload codec handle.
///
/// Cheap to clone; every channel holds one so payload work happens at the
/// channel boundary, outside the connection driver.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    compress_limit: usize,
}

impl PayloadCodec {
    /// Create a codec that deflates payloads of `compress_limit` bytes
    /// or more.
    pub fn new(compress_limit: usize) -> Self {
        Self { compress_limit }
    }

    /// Wrap `data` in an envelope, deflating it when it meets the
    /// compression threshold.
    pub async fn encode(&self, data: Bytes) -> Result<Bytes> {
        if data.len() < self.compress_limit {
            let mut out = BytesMut::with_capacity(1 + data.len());
            out.put_u8(mode::RAW);
            out.put_slice(&data);
            return Ok(out.freeze());
        }

        run_blocking(move || {
            let mut encoder =
                ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 1), Compression::default());
            encoder.write_all(&data)?;
            let compressed = encoder.finish()?;

            let mut out = BytesMut::with_capacity(1 + compressed.len());
            out.put_u8(mode::DEFLATE);
            out.put_slice(&compressed);
            Ok(out.freeze())
        })
        .await
    }

    /// Strip the envelope from `data`, inflating the payload when its mode
    /// byte says so.
    pub async fn decode(&self, data: Bytes) -> Result<Bytes> {
        let Some(&mode_byte) = data.first() else {
            return Err(Gtp3Error::MalformedFrame("empty payload envelope".into()));
        };
        let body = data.slice(1..);

        match mode_byte {
            mode::RAW => Ok(body),
            mode::DEFLATE => {
                run_blocking(move || {
                    let mut decoder = ZlibDecoder::new(&body[..]);
                    let mut out = Vec::with_capacity(body.len() * 2);
                    decoder.read_to_end(&mut out)?;
                    Ok(Bytes::from(out))
                })
                .await
            }
            other => Err(Gtp3Error::MalformedFrame(format!(
                "unknown payload mode 0x{other:02X}"
            ))),
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Gtp3Error::Io(std::io::Error::other(e)))?
}

/// Serialize `value` to JSON payload bytes.
pub fn to_json<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserialize JSON payload bytes.
pub fn from_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}
