//! Channel handles.
//!
//! A [`Channel`] is the user-facing half of a multiplexed logical stream.
//! It talks to the connection driver through commands and receives routed
//! events on its own queue. Payload envelopes are encoded and decoded here,
//! at the handle boundary, so compression work stays off the driver task.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Gtp3Error, Result};
use crate::payload::{self, PayloadCodec};
use crate::socket::Command;

/// Events routed to a channel by the connection driver.
///
/// Payloads are still enveloped in driver-produced events;
/// [`Channel::recv`] decodes them before handing them out.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A fire-and-forget message from the peer.
    Message(ChannelMessage),
    /// A request from the peer that expects an answer.
    Request(ChannelRequest),
    /// The peer closed the channel.
    Closed { code: u16, message: String },
    /// The channel was torn down without a close exchange.
    Reset,
}

/// A message received on a channel.
#[derive(Debug)]
pub struct ChannelMessage {
    pub message: String,
    pub payload: Bytes,
}

impl ChannelMessage {
    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        payload::from_json(&self.payload)
    }
}

/// A request received on a channel, carrying its responder.
#[derive(Debug)]
pub struct ChannelRequest {
    pub message: String,
    pub payload: Bytes,
    pub responder: RequestResponder,
}

impl ChannelRequest {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        payload::from_json(&self.payload)
    }
}

/// One-shot responder for a received request.
///
/// Dropping an unanswered responder fails the request on the peer side
/// rather than leaving it to time out.
#[derive(Debug)]
pub struct RequestResponder {
    channel: u16,
    request: u16,
    commands: mpsc::Sender<Command>,
    codec: PayloadCodec,
    answered: bool,
}

impl RequestResponder {
    pub(crate) fn new(
        channel: u16,
        request: u16,
        commands: mpsc::Sender<Command>,
        codec: PayloadCodec,
    ) -> Self {
        Self {
            channel,
            request,
            commands,
            codec,
            answered: false,
        }
    }

    /// Answer the request with a payload.
    pub async fn respond(mut self, data: Bytes) -> Result<()> {
        self.answered = true;
        let payload = self.codec.encode(data).await?;
        self.commands
            .send(Command::RespondSuccess {
                channel: self.channel,
                request: self.request,
                payload,
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)
    }

    /// Answer the request with a JSON payload.
    pub async fn respond_json<T: Serialize>(self, value: &T) -> Result<()> {
        let data = payload::to_json(value)?;
        self.respond(data).await
    }

    /// Fail the request with a code and message.
    pub async fn fail(mut self, code: u16, message: impl Into<String>) -> Result<()> {
        self.answered = true;
        self.commands
            .send(Command::RespondFailure {
                channel: self.channel,
                request: self.request,
                code,
                message: message.into(),
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)
    }
}

impl Drop for RequestResponder {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self.commands.try_send(Command::RespondFailure {
                channel: self.channel,
                request: self.request,
                code: 0,
                message: "unhandled".into(),
            });
        }
    }
}

/// Handle to an open channel.
pub struct Channel {
    id: u16,
    commands: mpsc::Sender<Command>,
    codec: PayloadCodec,
    events: mpsc::Receiver<ChannelEvent>,
    closed: bool,
}

impl Channel {
    pub(crate) fn new(
        id: u16,
        commands: mpsc::Sender<Command>,
        codec: PayloadCodec,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            id,
            commands,
            codec,
            events,
            closed: false,
        }
    }

    /// Local channel id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Send a fire-and-forget message.
    pub async fn send(&self, message: impl Into<String>, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(Gtp3Error::ChannelClosed);
        }
        let payload = self.codec.encode(data).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                channel: self.id,
                message: message.into(),
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)?;
        reply_rx.await.map_err(|_| Gtp3Error::ConnectionClosed)?
    }

    /// Send a fire-and-forget message with a JSON payload.
    pub async fn send_json<T: Serialize>(
        &self,
        message: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        let data = payload::to_json(value)?;
        self.send(message, data).await
    }

    /// Send a request and wait for the peer's answer.
    pub async fn request(&self, message: impl Into<String>, data: Bytes) -> Result<Bytes> {
        if self.closed {
            return Err(Gtp3Error::ChannelClosed);
        }
        let payload = self.codec.encode(data).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                channel: self.id,
                message: message.into(),
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)?;
        let response = reply_rx.await.map_err(|_| Gtp3Error::ConnectionClosed)??;
        self.codec.decode(response).await
    }

    /// Send a JSON request and deserialize the JSON answer.
    pub async fn request_json<T: Serialize, R: DeserializeOwned>(
        &self,
        message: impl Into<String>,
        value: &T,
    ) -> Result<R> {
        let data = payload::to_json(value)?;
        let response = self.request(message, data).await?;
        payload::from_json(&response)
    }

    /// Receive the next event on this channel.
    ///
    /// Resolves to `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Result<Option<ChannelEvent>> {
        let Some(event) = self.events.recv().await else {
            return Ok(None);
        };

        let event = match event {
            ChannelEvent::Message(mut msg) => {
                msg.payload = self.codec.decode(msg.payload).await?;
                ChannelEvent::Message(msg)
            }
            ChannelEvent::Request(mut req) => {
                req.payload = self.codec.decode(req.payload).await?;
                ChannelEvent::Request(req)
            }
            other @ (ChannelEvent::Closed { .. } | ChannelEvent::Reset) => {
                self.closed = true;
                other
            }
        };
        Ok(Some(event))
    }

    /// Close the channel.
    ///
    /// The close completes on the wire once the peer acknowledges it; the
    /// handle is unusable immediately.
    pub async fn close(&mut self, code: u16, message: impl Into<String>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.commands
            .send(Command::CloseChannel {
                channel: self.id,
                code,
                message: message.into(),
            })
            .await
            .map_err(|_| Gtp3Error::ConnectionClosed)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.commands.try_send(Command::CloseChannel {
                channel: self.id,
                code: 0,
                message: "dropped".into(),
            });
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}
