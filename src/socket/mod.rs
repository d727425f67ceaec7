//! Connection layer.
//!
//! [`Socket`] is the handle to one GTP3 connection. All protocol state
//! lives in a driver task spawned by [`Socket::connect`]; the handle and
//! the channel handles talk to it over a command queue, and connection
//! lifecycle notifications come back on [`SocketEvents`].

mod driver;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::backpressure::WindowLimits;
use crate::channel::Channel;
use crate::error::{Gtp3Error, Result};
use crate::payload::PayloadCodec;
use crate::transport::Transport;

/// Connection tuning parameters.
///
/// The defaults are the interoperable protocol values; changing the wire
/// ones (ack interval, window limits) requires the peer to agree.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Version string announced in the handshake.
    pub version: String,
    /// Acknowledge every n-th received sequenced frame.
    pub ack_interval: u16,
    /// Outbound window thresholds.
    pub window: WindowLimits,
    /// Frames to send between acknowledgement probes.
    pub request_ack_cooldown: usize,
    /// Time allowed for the peer's handshake after HELLO.
    pub handshake_timeout: Duration,
    /// Time allowed for the peer to answer a channel open.
    pub open_timeout: Duration,
    /// Time allowed for the peer to answer a request.
    pub request_timeout: Duration,
    /// How long a dropped transport may be replaced before the
    /// connection fails.
    pub resume_window: Duration,
    /// Interval between latency probes, `None` to disable.
    pub heartbeat_interval: Option<Duration>,
    /// Maximum channels open at once.
    pub channels_limit: u16,
    /// Maximum outstanding requests per channel.
    pub inflight_requests: u16,
    /// Payloads at or above this size are compressed.
    pub compress_limit: usize,
    /// Per-channel reassembly buffer for fragmented payloads.
    pub reassembly_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: concat!("gtp3-rs/", env!("CARGO_PKG_VERSION")).to_owned(),
            ack_interval: 8,
            window: WindowLimits::default(),
            request_ack_cooldown: 4,
            handshake_timeout: Duration::from_secs(5),
            open_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            resume_window: Duration::from_secs(30),
            heartbeat_interval: Some(Duration::from_secs(10)),
            channels_limit: u16::MAX,
            inflight_requests: 250,
            compress_limit: 250,
            reassembly_capacity: 1024 * 1024,
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug)]
pub enum SocketEvent {
    /// The transport dropped; the connection is waiting for a replacement.
    Reconnecting,
    /// A replacement transport was accepted and the stream resumed.
    Resumed,
    /// The peer did not recognize the session; all channels were lost.
    Reset,
    /// The peer wants to open a channel.
    ChannelOpen(OpenRequest),
    /// A latency probe completed.
    Latency(Duration),
    /// The connection is over.
    Closed { code: u16, message: String },
}

/// A channel open initiated by the peer.
///
/// Dropping the request unanswered rejects it.
#[derive(Debug)]
pub struct OpenRequest {
    channel_type: String,
    token: String,
    remote_channel: u16,
    commands: mpsc::Sender<Command>,
    answered: bool,
}

impl OpenRequest {
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Accept the open and get a handle to the new channel.
    pub async fn accept(mut self) -> Result<Channel> {
        self.answered = true;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::AcceptOpen {
                remote_channel: self.remote_channel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)?;
        reply_rx.await.map_err(|_| Gtp3Error::ConnectionClosed)?
    }

    /// Reject the open with a code and message.
    pub async fn reject(mut self, code: u16, message: impl Into<String>) -> Result<()> {
        self.answered = true;
        self.commands
            .send(Command::RejectOpen {
                remote_channel: self.remote_channel,
                code,
                message: message.into(),
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)
    }
}

impl Drop for OpenRequest {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self.commands.try_send(Command::RejectOpen {
                remote_channel: self.remote_channel,
                code: 0,
                message: "unhandled".into(),
            });
        }
    }
}

/// Commands sent from handles to the driver task.
#[derive(Debug)]
pub(crate) enum Command {
    OpenChannel {
        channel_type: String,
        token: String,
        parent: u16,
        reply: oneshot::Sender<Result<Channel>>,
    },
    AcceptOpen {
        remote_channel: u16,
        reply: oneshot::Sender<Result<Channel>>,
    },
    RejectOpen {
        remote_channel: u16,
        code: u16,
        message: String,
    },
    Send {
        channel: u16,
        message: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Request {
        channel: u16,
        message: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    RespondSuccess {
        channel: u16,
        request: u16,
        payload: Bytes,
    },
    RespondFailure {
        channel: u16,
        request: u16,
        code: u16,
        message: String,
    },
    CloseChannel {
        channel: u16,
        code: u16,
        message: String,
    },
    Ping {
        reply: oneshot::Sender<Result<Duration>>,
    },
    Close {
        code: u16,
        message: String,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a live GTP3 connection.
#[derive(Debug)]
pub struct Socket<T: Transport> {
    commands: mpsc::Sender<Command>,
    transports: mpsc::Sender<T>,
    codec: PayloadCodec,
    peer_version: String,
}

impl<T: Transport> Socket<T> {
    /// Establish a connection over `transport`.
    ///
    /// Sends HELLO, waits for the peer's HANDSHAKE and spawns the driver
    /// task. Returns the connection handle and its event stream.
    pub async fn connect(transport: T, config: ProtocolConfig) -> Result<(Self, SocketEvents)> {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (transport_tx, transport_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let codec = PayloadCodec::new(config.compress_limit);
        let driver = driver::Driver::new(
            transport,
            config,
            cmd_tx.downgrade(),
            cmd_rx,
            transport_rx,
            event_tx,
            handshake_tx,
        );
        tokio::spawn(driver.run());

        let peer_version = handshake_rx
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)??;

        let socket = Self {
            commands: cmd_tx,
            transports: transport_tx,
            codec,
            peer_version,
        };
        Ok((socket, SocketEvents { events: event_rx }))
    }

    /// Version string the peer announced in its handshake.
    pub fn peer_version(&self) -> &str {
        &self.peer_version
    }

    /// Open a channel of `channel_type`, authenticating with `token`.
    pub async fn open_channel(
        &self,
        channel_type: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Channel> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::OpenChannel {
                channel_type: channel_type.into(),
                token: token.into(),
                parent: 0,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)?;
        reply_rx.await.map_err(|_| Gtp3Error::ConnectionClosed)?
    }

    /// Measure round-trip latency to the peer.
    pub async fn ping(&self) -> Result<Duration> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Ping { reply: reply_tx })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)?;
        reply_rx.await.map_err(|_| Gtp3Error::ConnectionClosed)?
    }

    /// Hand the driver a replacement transport after a drop.
    ///
    /// The driver requests a resume on it; the outcome arrives as a
    /// [`SocketEvent::Resumed`], [`SocketEvent::Reset`] or
    /// [`SocketEvent::Closed`] event.
    pub async fn resume(&self, transport: T) -> Result<()> {
        self.transports
            .send(transport)
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)
    }

    /// Close the connection with a BYE frame.
    pub async fn close(&self, code: u16, message: impl Into<String>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Close {
                code,
                message: message.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)?;
        let _ = reply_rx.await;
        Ok(())
    }

    /// Payload codec used by this connection's channels.
    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }
}

impl<T: Transport> Clone for Socket<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            transports: self.transports.clone(),
            codec: self.codec.clone(),
            peer_version: self.peer_version.clone(),
        }
    }
}

/// Receiving side of the connection's lifecycle events.
#[derive(Debug)]
pub struct SocketEvents {
    events: mpsc::Receiver<SocketEvent>,
}

impl SocketEvents {
    /// Next lifecycle event, `None` once the driver has shut down.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }
}

/// Exponential reconnect backoff.
///
/// Yields delays doubling from `base` for up to `max_attempts` attempts,
/// then ends. Pair it with [`Socket::resume`] when dialing replacement
/// transports.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            attempt: 0,
            max_attempts,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 5)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.base * 2u32.pow(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
