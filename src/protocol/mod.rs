//! GTP3 wire protocol definitions.
//!
//! Frame type codes, fixed protocol parameters and the frame codec. All
//! multi-byte integers on the wire are Big Endian.

mod frame;
mod pool;

pub use frame::Frame;
pub use pool::NumberPool;

/// Protocol magic number ("GTP3").
pub const MAGIC: u32 = 0x4754_5033;

/// Maximum size of an encoded frame in bytes.
pub const FRAME_LIMIT: usize = 65535;

/// Frame type codes.
///
/// Connection frames address the connection itself; channel frames carry a
/// channel id and are routed to the addressed channel.
pub mod frame_type {
    // Connection control
    pub const HELLO: u8 = 0x10;
    pub const HANDSHAKE: u8 = 0x11;
    pub const RESUME: u8 = 0x12;
    pub const SYNC: u8 = 0x13;
    pub const ACK: u8 = 0x14;
    pub const BYE: u8 = 0x15;

    // Connection messages
    pub const IGNORE: u8 = 0x20;
    pub const PING: u8 = 0x21;
    pub const PONG: u8 = 0x22;
    pub const REQUEST_ACK: u8 = 0x23;

    // Channel control
    pub const OPEN: u8 = 0x30;
    pub const OPEN_SUCCESS: u8 = 0x31;
    pub const OPEN_FAILURE: u8 = 0x32;
    pub const RESET: u8 = 0x33;

    // Channel messages
    pub const MESSAGE: u8 = 0x40;
    pub const REQUEST: u8 = 0x41;
    pub const SUCCESS: u8 = 0x42;
    pub const FAILURE: u8 = 0x43;
    pub const CLOSE: u8 = 0x44;
}

/// Bit flags carried by payload-bearing channel frames.
pub mod flags {
    /// The payload continues in the next frame of the same kind.
    pub const FRAGMENT: u16 = 0x0001;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}
