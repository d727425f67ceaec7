//! GTP3 protocol engine.
//!
//! A framed, multiplexed, resumable channel protocol for message-oriented
//! transports. One [`Socket`] drives a connection: it handshakes, keeps a
//! retention window of unacknowledged frames so a dropped transport can be
//! replaced mid-session, and multiplexes any number of [`Channel`]s, each
//! with fire-and-forget messages and request/response calls. Payloads are
//! compressed transparently once they cross a size threshold.
//!
//! All protocol state lives in a background driver task; the handles are
//! cheap and safe to use from any task.
//!
//! ```no_run
//! use gtp3::{ProtocolConfig, Socket, StreamTransport};
//!
//! # async fn run() -> gtp3::Result<()> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let transport = StreamTransport::new(stream);
//!
//! let (socket, _events) = Socket::connect(transport, ProtocolConfig::default()).await?;
//! let channel = socket.open_channel("status", "secret-token").await?;
//!
//! let reply = channel.request("version", bytes::Bytes::new()).await?;
//! println!("server runs {:?}", reply);
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod channel;
pub mod codec;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use channel::{Channel, ChannelEvent, ChannelMessage, ChannelRequest, RequestResponder};
pub use error::{Gtp3Error, Result};
pub use payload::PayloadCodec;
pub use protocol::Frame;
pub use socket::{Backoff, OpenRequest, ProtocolConfig, Socket, SocketEvent, SocketEvents};
pub use transport::{duplex_pair, StreamTransport, Transport};
