//! Error types for the GTP3 protocol engine.

use thiserror::Error;

/// Main error type for all GTP3 operations.
#[derive(Debug, Error)]
pub enum Gtp3Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON payload serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown frame type code or truncated frame body. Fatal for the
    /// connection that decoded it.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Id space exhausted (channel ids or per-channel request ids).
    #[error("id pool exhausted")]
    PoolExhausted,

    /// Reassembly ring buffer cannot hold the incoming fragment.
    #[error("reassembly buffer full")]
    BufferFull,

    /// Codec cursor moved past the end of its buffer.
    #[error("buffer access out of bounds")]
    OutOfBounds,

    /// Operation attempted on a channel that is not open.
    #[error("channel closed")]
    ChannelClosed,

    /// Channel was torn down while the operation was outstanding.
    #[error("channel reset")]
    ChannelReset,

    /// No reply arrived within the request timeout.
    #[error("request timed out")]
    RequestTimeout,

    /// The remote endpoint answered the request with a FAILURE frame.
    #[error("request failed ({code}): {message}")]
    RequestFailed { code: u16, message: String },

    /// The remote endpoint rejected a channel open with OPEN_FAILURE.
    #[error("channel open rejected ({code}): {message}")]
    OpenRejected { code: u16, message: String },

    /// HANDSHAKE did not arrive within the open timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The remote endpoint did not accept the RESUME (session unknown or
    /// expired); all session state was discarded.
    #[error("resume rejected, session state lost")]
    ResumeRejected,

    /// Unacknowledged-frame count reached the hard limit. The connection is
    /// assumed desynchronized and is dropped.
    #[error("acknowledgement hard limit exceeded")]
    AckLimitExceeded,

    /// Peer sent a duplicate or out-of-order sequence number.
    #[error("sequence error: expected {expected}, got {got}")]
    SequenceError { expected: u16, got: u16 },

    /// The connection is closed or the driver task is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame would exceed the protocol frame size limit.
    #[error("frame size limit exceeded ({size} > {limit})")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Result type alias using Gtp3Error.
pub type Result<T> = std::result::Result<T, Gtp3Error>;
