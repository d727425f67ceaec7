//! Transport abstraction.
//!
//! The protocol engine runs over any message-oriented transport that can
//! carry one encoded frame per message, the way a WebSocket carries binary
//! messages. [`StreamTransport`] adapts an ordered byte stream by prefixing
//! each frame with its length.

use std::future::Future;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

/// A bidirectional, ordered, message-oriented frame carrier.
///
/// `recv` resolves to `None` when the peer has closed the transport; any
/// other failure is an I/O error. Implementations do not need to survive
/// errors: the connection layer replaces the transport on resume.
pub trait Transport: Send + 'static {
    /// Send one frame as a single message.
    fn send(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next frame, or `None` on clean close.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Length-prefixed framing over an ordered byte stream.
///
/// Each frame travels as a Big Endian u16 length followed by that many
/// bytes. The prefix bounds frames at the protocol frame limit by
/// construction.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Unwrap the inner stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        let len = u16::try_from(frame.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds length prefix", frame.len()),
            )
        })?;

        let mut message = BytesMut::with_capacity(2 + frame.len());
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(&frame);
        self.stream.write_all(&message).await?;
        self.stream.flush().await
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        // EOF before the first prefix byte is a clean close; EOF anywhere
        // later is a torn frame.
        let mut prefix = [0u8; 2];
        if self.stream.read(&mut prefix[..1]).await? == 0 {
            return Ok(None);
        }
        self.stream.read_exact(&mut prefix[1..]).await?;

        let len = u16::from_be_bytes(prefix) as usize;
        let mut frame = BytesMut::zeroed(len);
        self.stream.read_exact(&mut frame).await?;
        Ok(Some(frame.freeze()))
    }
}

/// A connected pair of in-process transports, for tests and local wiring.
pub fn duplex_pair(
    capacity: usize,
) -> (StreamTransport<DuplexStream>, StreamTransport<DuplexStream>) {
    let (a, b) = tokio::io::duplex(capacity);
    (StreamTransport::new(a), StreamTransport::new(b))
}
