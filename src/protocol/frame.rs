//! Frame encoding and decoding.
//!
//! A frame is the smallest unit exchanged with the transport: one type code
//! byte followed by type-specific fields encoded with the buffer codec.
//! Sequenced frames carry a u16 sequence number directly after the type
//! byte; channel frames additionally carry the target channel id.

use bytes::Bytes;

use super::{frame_type, FRAME_LIMIT, MAGIC};
use crate::codec::{blob_len, str_len, BufferReader, BufferWriter};
use crate::error::{Gtp3Error, Result};

/// A decoded GTP3 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    // Connection control
    Hello { magic: u32, version: String },
    Handshake { magic: u32, version: String, session: u64 },
    Resume { session: u64, last_seq: u16 },
    Sync { last_seq: u16 },
    Ack { last_seq: u16 },
    Bye { code: u16, message: String },

    // Connection messages
    Ignore,
    Ping,
    Pong,
    RequestAck,

    // Channel control
    Open {
        seq: u16,
        sender_channel: u16,
        channel_type: String,
        token: String,
        parent_channel: u16,
    },
    OpenSuccess {
        seq: u16,
        recipient_channel: u16,
        sender_channel: u16,
    },
    OpenFailure {
        seq: u16,
        recipient_channel: u16,
        code: u16,
        message: String,
    },
    Reset { sender_channel: u16 },

    // Channel messages
    Message {
        seq: u16,
        channel: u16,
        message: String,
        flags: u16,
        payload: Bytes,
    },
    Request {
        seq: u16,
        channel: u16,
        message: String,
        request: u16,
        flags: u16,
        payload: Bytes,
    },
    Success {
        seq: u16,
        channel: u16,
        request: u16,
        flags: u16,
        payload: Bytes,
    },
    Failure {
        seq: u16,
        channel: u16,
        request: u16,
        code: u16,
        message: String,
    },
    Close {
        seq: u16,
        channel: u16,
        code: u16,
        message: String,
    },
}

impl Frame {
    /// Build a HELLO frame with the protocol magic filled in.
    pub fn hello(version: impl Into<String>) -> Self {
        Frame::Hello {
            magic: MAGIC,
            version: version.into(),
        }
    }

    /// The wire type code of this frame.
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Hello { .. } => frame_type::HELLO,
            Frame::Handshake { .. } => frame_type::HANDSHAKE,
            Frame::Resume { .. } => frame_type::RESUME,
            Frame::Sync { .. } => frame_type::SYNC,
            Frame::Ack { .. } => frame_type::ACK,
            Frame::Bye { .. } => frame_type::BYE,
            Frame::Ignore => frame_type::IGNORE,
            Frame::Ping => frame_type::PING,
            Frame::Pong => frame_type::PONG,
            Frame::RequestAck => frame_type::REQUEST_ACK,
            Frame::Open { .. } => frame_type::OPEN,
            Frame::OpenSuccess { .. } => frame_type::OPEN_SUCCESS,
            Frame::OpenFailure { .. } => frame_type::OPEN_FAILURE,
            Frame::Reset { .. } => frame_type::RESET,
            Frame::Message { .. } => frame_type::MESSAGE,
            Frame::Request { .. } => frame_type::REQUEST,
            Frame::Success { .. } => frame_type::SUCCESS,
            Frame::Failure { .. } => frame_type::FAILURE,
            Frame::Close { .. } => frame_type::CLOSE,
        }
    }

    /// True if this frame consumes an outbound sequence number and must be
    /// acknowledged by the peer.
    pub fn is_sequenced(&self) -> bool {
        self.seq().is_some()
    }

    /// Sequence number for sequenced frames.
    pub fn seq(&self) -> Option<u16> {
        match self {
            Frame::Open { seq, .. }
            | Frame::OpenSuccess { seq, .. }
            | Frame::OpenFailure { seq, .. }
            | Frame::Message { seq, .. }
            | Frame::Request { seq, .. }
            | Frame::Success { seq, .. }
            | Frame::Failure { seq, .. }
            | Frame::Close { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Assign the sequence number of a sequenced frame. No-op otherwise.
    pub fn set_seq(&mut self, value: u16) {
        match self {
            Frame::Open { seq, .. }
            | Frame::OpenSuccess { seq, .. }
            | Frame::OpenFailure { seq, .. }
            | Frame::Message { seq, .. }
            | Frame::Request { seq, .. }
            | Frame::Success { seq, .. }
            | Frame::Failure { seq, .. }
            | Frame::Close { seq, .. } => *seq = value,
            _ => {}
        }
    }

    /// Target channel id for frames addressed to one of our channels.
    pub fn channel(&self) -> Option<u16> {
        match self {
            Frame::Message { channel, .. }
            | Frame::Request { channel, .. }
            | Frame::Success { channel, .. }
            | Frame::Failure { channel, .. }
            | Frame::Close { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// Exact encoded size in bytes.
    fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::Hello { version, .. } => 4 + str_len(version),
            Frame::Handshake { version, .. } => 4 + str_len(version) + 8,
            Frame::Resume { .. } => 8 + 2,
            Frame::Sync { .. } | Frame::Ack { .. } => 2,
            Frame::Bye { message, .. } => 2 + str_len(message),
            Frame::Ignore | Frame::Ping | Frame::Pong | Frame::RequestAck => 0,
            Frame::Open {
                channel_type, token, ..
            } => 2 + 2 + str_len(channel_type) + str_len(token) + 2,
            Frame::OpenSuccess { .. } => 2 + 2 + 2,
            Frame::OpenFailure { message, .. } => 2 + 2 + 2 + str_len(message),
            Frame::Reset { .. } => 2,
            Frame::Message {
                message, payload, ..
            } => 2 + 2 + str_len(message) + 2 + blob_len(payload),
            Frame::Request {
                message, payload, ..
            } => 2 + 2 + str_len(message) + 2 + 2 + blob_len(payload),
            Frame::Success { payload, .. } => 2 + 2 + 2 + 2 + blob_len(payload),
            Frame::Failure { message, .. } => 2 + 2 + 2 + 2 + str_len(message),
            Frame::Close { message, .. } => 2 + 2 + 2 + str_len(message),
        }
    }

    /// Encode the frame into a buffer sized exactly to its content.
    ///
    /// Fails with [`Gtp3Error::FrameTooLarge`] when the encoded frame would
    /// exceed the protocol frame limit.
    pub fn encode(&self) -> Result<Bytes> {
        let len = self.encoded_len();
        if len > FRAME_LIMIT {
            return Err(Gtp3Error::FrameTooLarge {
                size: len,
                limit: FRAME_LIMIT,
            });
        }

        let mut w = BufferWriter::new(len);
        w.uint8(self.kind())?;

        match self {
            Frame::Hello { magic, version } => {
                w.uint32(*magic)?;
                w.str(version)?;
            }
            Frame::Handshake {
                magic,
                version,
                session,
            } => {
                w.uint32(*magic)?;
                w.str(version)?;
                w.uint64(*session)?;
            }
            Frame::Resume { session, last_seq } => {
                w.uint64(*session)?;
                w.uint16(*last_seq)?;
            }
            Frame::Sync { last_seq } | Frame::Ack { last_seq } => {
                w.uint16(*last_seq)?;
            }
            Frame::Bye { code, message } => {
                w.uint16(*code)?;
                w.str(message)?;
            }
            Frame::Ignore | Frame::Ping | Frame::Pong | Frame::RequestAck => {}
            Frame::Open {
                seq,
                sender_channel,
                channel_type,
                token,
                parent_channel,
            } => {
                w.uint16(*seq)?;
                w.uint16(*sender_channel)?;
                w.str(channel_type)?;
                w.str(token)?;
                w.uint16(*parent_channel)?;
            }
            Frame::OpenSuccess {
                seq,
                recipient_channel,
                sender_channel,
            } => {
                w.uint16(*seq)?;
                w.uint16(*recipient_channel)?;
                w.uint16(*sender_channel)?;
            }
            Frame::OpenFailure {
                seq,
                recipient_channel,
                code,
                message,
            } => {
                w.uint16(*seq)?;
                w.uint16(*recipient_channel)?;
                w.uint16(*code)?;
                w.str(message)?;
            }
            Frame::Reset { sender_channel } => {
                w.uint16(*sender_channel)?;
            }
            Frame::Message {
                seq,
                channel,
                message,
                flags,
                payload,
            } => {
                w.uint16(*seq)?;
                w.uint16(*channel)?;
                w.str(message)?;
                w.uint16(*flags)?;
                w.blob(payload)?;
            }
            Frame::Request {
                seq,
                channel,
                message,
                request,
                flags,
                payload,
            } => {
                w.uint16(*seq)?;
                w.uint16(*channel)?;
                w.str(message)?;
                w.uint16(*request)?;
                w.uint16(*flags)?;
                w.blob(payload)?;
            }
            Frame::Success {
                seq,
                channel,
                request,
                flags,
                payload,
            } => {
                w.uint16(*seq)?;
                w.uint16(*channel)?;
                w.uint16(*request)?;
                w.uint16(*flags)?;
                w.blob(payload)?;
            }
            Frame::Failure {
                seq,
                channel,
                request,
                code,
                message,
            } => {
                w.uint16(*seq)?;
                w.uint16(*channel)?;
                w.uint16(*request)?;
                w.uint16(*code)?;
                w.str(message)?;
            }
            Frame::Close {
                seq,
                channel,
                code,
                message,
            } => {
                w.uint16(*seq)?;
                w.uint16(*channel)?;
                w.uint16(*code)?;
                w.str(message)?;
            }
        }

        Ok(w.done())
    }

    /// Decode a frame from a raw buffer.
    ///
    /// An unknown type code or a body shorter than its fields require fails
    /// with [`Gtp3Error::MalformedFrame`]; both indicate desynchronization
    /// or a protocol version mismatch and must never be ignored.
    pub fn decode(buffer: Bytes) -> Result<Frame> {
        let mut r = BufferReader::new(buffer);
        let kind = r
            .uint8()
            .map_err(|_| Gtp3Error::MalformedFrame("empty frame".into()))?;

        let frame = match kind {
            frame_type::HELLO => Frame::Hello {
                magic: r.uint32()?,
                version: r.str()?,
            },
            frame_type::HANDSHAKE => Frame::Handshake {
                magic: r.uint32()?,
                version: r.str()?,
                session: r.uint64()?,
            },
            frame_type::RESUME => Frame::Resume {
                session: r.uint64()?,
                last_seq: r.uint16()?,
            },
            frame_type::SYNC => Frame::Sync {
                last_seq: r.uint16()?,
            },
            frame_type::ACK => Frame::Ack {
                last_seq: r.uint16()?,
            },
            frame_type::BYE => Frame::Bye {
                code: r.uint16()?,
                message: r.str()?,
            },
            frame_type::IGNORE => Frame::Ignore,
            frame_type::PING => Frame::Ping,
            frame_type::PONG => Frame::Pong,
            frame_type::REQUEST_ACK => Frame::RequestAck,
            frame_type::OPEN => Frame::Open {
                seq: r.uint16()?,
                sender_channel: r.uint16()?,
                channel_type: r.str()?,
                token: r.str()?,
                parent_channel: r.uint16()?,
            },
            frame_type::OPEN_SUCCESS => Frame::OpenSuccess {
                seq: r.uint16()?,
                recipient_channel: r.uint16()?,
                sender_channel: r.uint16()?,
            },
            frame_type::OPEN_FAILURE => Frame::OpenFailure {
                seq: r.uint16()?,
                recipient_channel: r.uint16()?,
                code: r.uint16()?,
                message: r.str()?,
            },
            frame_type::RESET => Frame::Reset {
                sender_channel: r.uint16()?,
            },
            frame_type::MESSAGE => Frame::Message {
                seq: r.uint16()?,
                channel: r.uint16()?,
                message: r.str()?,
                flags: r.uint16()?,
                payload: r.blob()?,
            },
            frame_type::REQUEST => Frame::Request {
                seq: r.uint16()?,
                channel: r.uint16()?,
                message: r.str()?,
                request: r.uint16()?,
                flags: r.uint16()?,
                payload: r.blob()?,
            },
            frame_type::SUCCESS => Frame::Success {
                seq: r.uint16()?,
                channel: r.uint16()?,
                request: r.uint16()?,
                flags: r.uint16()?,
                payload: r.blob()?,
            },
            frame_type::FAILURE => Frame::Failure {
                seq: r.uint16()?,
                channel: r.uint16()?,
                request: r.uint16()?,
                code: r.uint16()?,
                message: r.str()?,
            },
            frame_type::CLOSE => Frame::Close {
                seq: r.uint16()?,
                channel: r.uint16()?,
                code: r.uint16()?,
                message: r.str()?,
            },
            other => {
                return Err(Gtp3Error::MalformedFrame(format!(
                    "unknown frame type 0x{other:02X}"
                )))
            }
        };

        Ok(frame)
    }
}
