//! Connection driver task.
//!
//! One driver task owns every piece of mutable connection state: the
//! transport, sequence counters, the ack window, channel tables and
//! pending waiters. Handles never touch that state directly; they queue
//! commands and the driver serializes everything, so the protocol needs
//! no locks at all.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::backpressure::AckWindow;
use crate::channel::{Channel, ChannelEvent, ChannelMessage, ChannelRequest, RequestResponder};
use crate::codec::RingBuffer;
use crate::error::{Gtp3Error, Result};
use crate::payload::PayloadCodec;
use crate::protocol::{flags, Frame, NumberPool, MAGIC};
use crate::socket::{Command, OpenRequest, ProtocolConfig, SocketEvent};
use crate::transport::Transport;

/// Largest payload slice carried by a single frame before fragmentation.
const PAYLOAD_CHUNK: usize = 32 * 1024;

enum State {
    Handshaking,
    Connected,
    Resuming { deadline: Instant, syncing: bool },
    Closed,
}

enum Phase {
    Open,
    Closing { close_seq: u16 },
}

struct ChannelState {
    remote_id: u16,
    events: mpsc::Sender<ChannelEvent>,
    phase: Phase,
    requests: NumberPool,
    pending: HashMap<u16, PendingRequest>,
    ring: RingBuffer,
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Bytes>>,
    deadline: Instant,
}

struct PendingOpen {
    reply: oneshot::Sender<Result<Channel>>,
    deadline: Instant,
}

enum PingWaiter {
    User {
        reply: oneshot::Sender<Result<Duration>>,
        sent: Instant,
    },
    Heartbeat {
        sent: Instant,
    },
}

enum Step<T> {
    Incoming(io::Result<Option<Bytes>>),
    Command(Option<Command>),
    NewTransport(Option<T>),
    Deadline,
}

pub(super) struct Driver<T: Transport> {
    transport: Option<T>,
    config: ProtocolConfig,
    state: State,
    session: u64,
    out_seq: u16,
    in_seq: u16,
    window: AckWindow,
    paused: bool,
    deferred: VecDeque<Frame>,
    channel_ids: NumberPool,
    channels: HashMap<u16, ChannelState>,
    pending_opens: HashMap<u16, PendingOpen>,
    pings: VecDeque<PingWaiter>,
    next_heartbeat: Option<Instant>,
    // weak: the command queue must close once the last handle is gone
    command_tx: mpsc::WeakSender<Command>,
    commands: mpsc::Receiver<Command>,
    transports: mpsc::Receiver<T>,
    transports_closed: bool,
    events: mpsc::Sender<SocketEvent>,
    handshake: Option<oneshot::Sender<Result<String>>>,
    handshake_deadline: Instant,
    codec: PayloadCodec,
}

impl<T: Transport> Driver<T> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        transport: T,
        config: ProtocolConfig,
        command_tx: mpsc::WeakSender<Command>,
        commands: mpsc::Receiver<Command>,
        transports: mpsc::Receiver<T>,
        events: mpsc::Sender<SocketEvent>,
        handshake: oneshot::Sender<Result<String>>,
    ) -> Self {
        let codec = PayloadCodec::new(config.compress_limit);
        let window = AckWindow::new(config.window);
        let channel_ids = NumberPool::new(config.channels_limit);
        let handshake_deadline = Instant::now() + config.handshake_timeout;

        Self {
            transport: Some(transport),
            config,
            state: State::Handshaking,
            session: 0,
            out_seq: 0,
            in_seq: 0,
            window,
            paused: false,
            deferred: VecDeque::new(),
            channel_ids,
            channels: HashMap::new(),
            pending_opens: HashMap::new(),
            pings: VecDeque::new(),
            next_heartbeat: None,
            command_tx,
            commands,
            transports,
            transports_closed: false,
            events,
            handshake: Some(handshake),
            handshake_deadline,
            codec,
        }
    }

    pub(super) async fn run(mut self) {
        let hello = Frame::hello(self.config.version.clone());
        self.send_raw(hello).await;

        while !matches!(self.state, State::Closed) {
            match self.next_step().await {
                Step::Incoming(Ok(Some(buffer))) => {
                    if let Err(e) = self.on_frame(buffer).await {
                        self.fatal(e).await;
                    }
                }
                Step::Incoming(Ok(None)) => self.on_transport_lost().await,
                Step::Incoming(Err(e)) => {
                    debug!(error = %e, "transport read failed");
                    self.on_transport_lost().await;
                }
                Step::Command(Some(command)) => self.on_command(command).await,
                Step::Command(None) => {
                    debug!("last handle dropped");
                    self.send_raw(Frame::Bye {
                        code: 0,
                        message: "handles dropped".into(),
                    })
                    .await;
                    self.shutdown(0, "handles dropped".into()).await;
                }
                Step::NewTransport(Some(transport)) => self.on_new_transport(transport).await,
                Step::NewTransport(None) => self.transports_closed = true,
                Step::Deadline => self.on_deadline().await,
            }
        }
    }

    async fn next_step(&mut self) -> Step<T> {
        let deadline = self.next_deadline();
        let has_transport = self.transport.is_some();
        let transport = &mut self.transport;
        let commands = &mut self.commands;
        let transports = &mut self.transports;
        let transports_open = !self.transports_closed;

        tokio::select! {
            incoming = async {
                match transport.as_mut() {
                    Some(t) => t.recv().await,
                    None => std::future::pending().await,
                }
            }, if has_transport => Step::Incoming(incoming),
            command = commands.recv() => Step::Command(command),
            replacement = transports.recv(), if transports_open => {
                Step::NewTransport(replacement)
            }
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            }, if deadline.is_some() => Step::Deadline,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut fold = |candidate: Instant| {
            next = Some(match next {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };

        match self.state {
            State::Handshaking => fold(self.handshake_deadline),
            State::Resuming { deadline, .. } => fold(deadline),
            State::Connected => {
                if let Some(at) = self.next_heartbeat {
                    fold(at);
                }
            }
            State::Closed => {}
        }
        for open in self.pending_opens.values() {
            fold(open.deadline);
        }
        for channel in self.channels.values() {
            for request in channel.pending.values() {
                fold(request.deadline);
            }
        }
        next
    }

    // ---- timers ------------------------------------------------------

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if matches!(self.state, State::Handshaking) && self.handshake_deadline <= now {
            self.fatal(Gtp3Error::HandshakeTimeout).await;
            return;
        }
        if let State::Resuming { deadline, .. } = self.state {
            if deadline <= now {
                self.fatal(Gtp3Error::ConnectionClosed).await;
                return;
            }
        }

        let expired_opens: Vec<u16> = self
            .pending_opens
            .iter()
            .filter(|(_, open)| open.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in expired_opens {
            if let Some(open) = self.pending_opens.remove(&id) {
                warn!(channel = id, "channel open timed out");
                self.channel_ids.release(id);
                let _ = open.reply.send(Err(Gtp3Error::RequestTimeout));
            }
        }

        for channel in self.channels.values_mut() {
            let expired: Vec<u16> = channel
                .pending
                .iter()
                .filter(|(_, req)| req.deadline <= now)
                .map(|(&id, _)| id)
                .collect();
            for id in expired {
                if let Some(request) = channel.pending.remove(&id) {
                    channel.requests.release(id);
                    let _ = request.reply.send(Err(Gtp3Error::RequestTimeout));
                }
            }
        }

        if matches!(self.state, State::Connected) {
            if let (Some(at), Some(interval)) = (self.next_heartbeat, self.config.heartbeat_interval)
            {
                if at <= now {
                    self.next_heartbeat = Some(now + interval);
                    self.pings.push_back(PingWaiter::Heartbeat { sent: now });
                    self.send_raw(Frame::Ping).await;
                }
            }
        }
    }

    // ---- commands ----------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenChannel {
                channel_type,
                token,
                parent,
                reply,
            } => {
                if matches!(self.state, State::Handshaking | State::Closed) {
                    let _ = reply.send(Err(Gtp3Error::ConnectionClosed));
                    return;
                }
                let id = match self.channel_ids.allocate() {
                    Ok(id) => id,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                debug!(channel = id, %channel_type, "opening channel");
                let frame = Frame::Open {
                    seq: 0,
                    sender_channel: id,
                    channel_type,
                    token,
                    parent_channel: parent,
                };
                self.pending_opens.insert(
                    id,
                    PendingOpen {
                        reply,
                        deadline: Instant::now() + self.config.open_timeout,
                    },
                );
                if let Err(e) = self.dispatch_sequenced(frame).await {
                    self.fatal(e).await;
                }
            }
            Command::AcceptOpen {
                remote_channel,
                reply,
            } => {
                let id = match self.channel_ids.allocate() {
                    Ok(id) => id,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let frame = Frame::OpenSuccess {
                    seq: 0,
                    recipient_channel: remote_channel,
                    sender_channel: id,
                };
                match self.register_channel(id, remote_channel) {
                    Ok(channel) => {
                        let _ = reply.send(Ok(channel));
                        if let Err(e) = self.dispatch_sequenced(frame).await {
                            self.fatal(e).await;
                        }
                    }
                    Err(e) => {
                        self.channel_ids.release(id);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::RejectOpen {
                remote_channel,
                code,
                message,
            } => {
                let frame = Frame::OpenFailure {
                    seq: 0,
                    recipient_channel: remote_channel,
                    code,
                    message,
                };
                if let Err(e) = self.dispatch_sequenced(frame).await {
                    self.fatal(e).await;
                }
            }
            Command::Send {
                channel,
                message,
                payload,
                reply,
            } => {
                let Some(remote_id) = self.open_remote_id(channel) else {
                    let _ = reply.send(Err(Gtp3Error::ChannelClosed));
                    return;
                };
                let _ = reply.send(Ok(()));
                for (chunk, more) in payload_chunks(payload) {
                    let frame = Frame::Message {
                        seq: 0,
                        channel: remote_id,
                        message: message.clone(),
                        flags: if more { flags::FRAGMENT } else { 0 },
                        payload: chunk,
                    };
                    if let Err(e) = self.queue_payload(frame).await {
                        self.fatal(e).await;
                        return;
                    }
                }
            }
            Command::Request {
                channel,
                message,
                payload,
                reply,
            } => {
                if self.open_remote_id(channel).is_none() {
                    let _ = reply.send(Err(Gtp3Error::ChannelClosed));
                    return;
                }
                let Some(state) = self.channels.get_mut(&channel) else {
                    let _ = reply.send(Err(Gtp3Error::ChannelClosed));
                    return;
                };
                let remote_id = state.remote_id;
                let request = match state.requests.allocate() {
                    Ok(id) => id,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                state.pending.insert(
                    request,
                    PendingRequest {
                        reply,
                        deadline: Instant::now() + self.config.request_timeout,
                    },
                );
                for (chunk, more) in payload_chunks(payload) {
                    let frame = Frame::Request {
                        seq: 0,
                        channel: remote_id,
                        message: message.clone(),
                        request,
                        flags: if more { flags::FRAGMENT } else { 0 },
                        payload: chunk,
                    };
                    if let Err(e) = self.queue_payload(frame).await {
                        self.fatal(e).await;
                        return;
                    }
                }
            }
            Command::RespondSuccess {
                channel,
                request,
                payload,
            } => {
                let Some(remote_id) = self.open_remote_id(channel) else {
                    return;
                };
                for (chunk, more) in payload_chunks(payload) {
                    let frame = Frame::Success {
                        seq: 0,
                        channel: remote_id,
                        request,
                        flags: if more { flags::FRAGMENT } else { 0 },
                        payload: chunk,
                    };
                    if let Err(e) = self.queue_payload(frame).await {
                        self.fatal(e).await;
                        return;
                    }
                }
            }
            Command::RespondFailure {
                channel,
                request,
                code,
                message,
            } => {
                let Some(remote_id) = self.open_remote_id(channel) else {
                    return;
                };
                let frame = Frame::Failure {
                    seq: 0,
                    channel: remote_id,
                    request,
                    code,
                    message,
                };
                if let Err(e) = self.queue_payload(frame).await {
                    self.fatal(e).await;
                }
            }
            Command::CloseChannel {
                channel,
                code,
                message,
            } => {
                let Some(remote_id) = self.open_remote_id(channel) else {
                    return;
                };
                let frame = Frame::Close {
                    seq: 0,
                    channel: remote_id,
                    code,
                    message,
                };
                match self.dispatch_sequenced(frame).await {
                    Ok(close_seq) => {
                        if let Some(state) = self.channels.get_mut(&channel) {
                            state.phase = Phase::Closing { close_seq };
                            for (id, request) in state.pending.drain() {
                                state.requests.release(id);
                                let _ = request.reply.send(Err(Gtp3Error::ChannelClosed));
                            }
                        }
                    }
                    Err(e) => self.fatal(e).await,
                }
            }
            Command::Ping { reply } => {
                if matches!(self.state, State::Connected) && self.transport.is_some() {
                    self.pings.push_back(PingWaiter::User {
                        reply,
                        sent: Instant::now(),
                    });
                    self.send_raw(Frame::Ping).await;
                } else {
                    let _ = reply.send(Err(Gtp3Error::ConnectionClosed));
                }
            }
            Command::Close {
                code,
                message,
                reply,
            } => {
                self.send_raw(Frame::Bye {
                    code,
                    message: message.clone(),
                })
                .await;
                self.shutdown(code, message).await;
                let _ = reply.send(());
            }
        }
    }

    /// Remote id of a channel that is open for sending, if any.
    fn open_remote_id(&self, channel: u16) -> Option<u16> {
        match self.channels.get(&channel) {
            Some(state) if matches!(state.phase, Phase::Open) => Some(state.remote_id),
            _ => None,
        }
    }

    fn register_channel(&mut self, local: u16, remote: u16) -> Result<Channel> {
        let commands = self
            .command_tx
            .upgrade()
            .ok_or(Gtp3Error::ConnectionClosed)?;
        let (tx, rx) = mpsc::channel(256);
        self.channels.insert(
            local,
            ChannelState {
                remote_id: remote,
                events: tx,
                phase: Phase::Open,
                requests: NumberPool::new(self.config.inflight_requests),
                pending: HashMap::new(),
                ring: RingBuffer::new(self.config.reassembly_capacity),
            },
        );
        Ok(Channel::new(local, commands, self.codec.clone(), rx))
    }

    // ---- inbound frames ----------------------------------------------

    async fn on_frame(&mut self, buffer: Bytes) -> Result<()> {
        let frame = Frame::decode(buffer)?;
        trace!(kind = frame.kind(), seq = ?frame.seq(), "frame received");

        match self.state {
            State::Handshaking => self.on_handshake_frame(frame).await,
            State::Resuming { syncing: true, .. } => self.on_resume_frame(frame).await,
            State::Resuming { syncing: false, .. } => Ok(()),
            State::Connected => self.on_connected_frame(frame).await,
            State::Closed => Ok(()),
        }
    }

    async fn on_handshake_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Handshake {
                magic,
                version,
                session,
            } => {
                if magic != MAGIC {
                    return Err(Gtp3Error::MalformedFrame(format!(
                        "bad handshake magic 0x{magic:08X}"
                    )));
                }
                debug!(session, %version, "handshake complete");
                self.session = session;
                self.state = State::Connected;
                self.arm_heartbeat();
                if let Some(reply) = self.handshake.take() {
                    let _ = reply.send(Ok(version));
                }
                Ok(())
            }
            Frame::Ignore => Ok(()),
            Frame::Bye { code, message } => {
                self.shutdown(code, message).await;
                Ok(())
            }
            other => Err(Gtp3Error::MalformedFrame(format!(
                "frame 0x{:02X} before handshake",
                other.kind()
            ))),
        }
    }

    async fn on_resume_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Sync { last_seq } => {
                self.apply_ack(last_seq);
                let backlog: Vec<Bytes> = self.window.frames().cloned().collect();
                debug!(frames = backlog.len(), "resuming stream");
                for encoded in backlog {
                    if !self.send_encoded(encoded).await {
                        return Ok(());
                    }
                }
                self.state = State::Connected;
                self.arm_heartbeat();
                let _ = self.events.send(SocketEvent::Resumed).await;
                self.flush_deferred().await
            }
            Frame::Handshake { magic, session, .. } => {
                if magic != MAGIC {
                    return Err(Gtp3Error::MalformedFrame(format!(
                        "bad handshake magic 0x{magic:08X}"
                    )));
                }
                warn!(old = self.session, new = session, "session not resumable");
                self.reset(session).await;
                Ok(())
            }
            Frame::Bye { code, message } => {
                self.shutdown(code, message).await;
                Ok(())
            }
            Frame::Ignore => Ok(()),
            other => {
                trace!(kind = other.kind(), "frame ignored during resume");
                Ok(())
            }
        }
    }

    async fn on_connected_frame(&mut self, frame: Frame) -> Result<()> {
        let seq = frame.seq();
        if let Some(seq) = seq {
            let expected = self.in_seq.wrapping_add(1);
            if seq != expected {
                return Err(Gtp3Error::SequenceError { expected, got: seq });
            }
            self.in_seq = seq;
        }

        match frame {
            Frame::Ignore | Frame::Sync { .. } => {}
            Frame::Ping => self.send_raw(Frame::Pong).await,
            Frame::Pong => self.on_pong().await,
            Frame::RequestAck => {
                let ack = Frame::Ack {
                    last_seq: self.in_seq,
                };
                self.send_raw(ack).await;
            }
            Frame::Ack { last_seq } => self.handle_ack(last_seq).await?,
            Frame::Bye { code, message } => {
                self.shutdown(code, message).await;
                return Ok(());
            }
            Frame::Hello { .. } | Frame::Handshake { .. } | Frame::Resume { .. } => {
                return Err(Gtp3Error::MalformedFrame(format!(
                    "unexpected frame 0x{:02X} on established connection",
                    frame.kind()
                )));
            }
            Frame::Open {
                sender_channel,
                channel_type,
                token,
                ..
            } => {
                let request = self.command_tx.upgrade().map(|commands| OpenRequest {
                    channel_type,
                    token,
                    remote_channel: sender_channel,
                    commands,
                    answered: false,
                });
                let delivered = match request {
                    Some(request) => self
                        .events
                        .send(SocketEvent::ChannelOpen(request))
                        .await
                        .is_ok(),
                    None => false,
                };
                if !delivered {
                    let refusal = Frame::OpenFailure {
                        seq: 0,
                        recipient_channel: sender_channel,
                        code: 0,
                        message: "unavailable".into(),
                    };
                    self.dispatch_sequenced(refusal).await?;
                }
            }
            Frame::OpenSuccess {
                recipient_channel,
                sender_channel,
                ..
            } => match self.pending_opens.remove(&recipient_channel) {
                Some(open) => match self.register_channel(recipient_channel, sender_channel) {
                    Ok(channel) => {
                        let _ = open.reply.send(Ok(channel));
                    }
                    Err(e) => {
                        self.channel_ids.release(recipient_channel);
                        let _ = open.reply.send(Err(e));
                    }
                },
                None => {
                    self.send_raw(Frame::Reset {
                        sender_channel: recipient_channel,
                    })
                    .await;
                }
            },
            Frame::OpenFailure {
                recipient_channel,
                code,
                message,
                ..
            } => {
                if let Some(open) = self.pending_opens.remove(&recipient_channel) {
                    self.channel_ids.release(recipient_channel);
                    let _ = open.reply.send(Err(Gtp3Error::OpenRejected { code, message }));
                }
            }
            Frame::Reset { sender_channel } => self.on_reset(sender_channel).await,
            Frame::Message {
                channel,
                message,
                flags: frame_flags,
                payload,
                ..
            } => {
                let Some(state) = self.channels.get_mut(&channel) else {
                    self.send_raw(Frame::Reset {
                        sender_channel: channel,
                    })
                    .await;
                    self.maybe_ack(seq).await;
                    return Ok(());
                };
                if matches!(state.phase, Phase::Open) {
                    match assemble(state, frame_flags, payload) {
                        Ok(Some(payload)) => {
                            let _ = state
                                .events
                                .send(ChannelEvent::Message(ChannelMessage { message, payload }))
                                .await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(channel, error = %e, "payload reassembly failed");
                            self.reset_channel(channel).await;
                        }
                    }
                }
            }
            Frame::Request {
                channel,
                message,
                request,
                flags: frame_flags,
                payload,
                ..
            } => {
                let Some(state) = self.channels.get_mut(&channel) else {
                    self.send_raw(Frame::Reset {
                        sender_channel: channel,
                    })
                    .await;
                    self.maybe_ack(seq).await;
                    return Ok(());
                };
                if matches!(state.phase, Phase::Open) {
                    match assemble(state, frame_flags, payload) {
                        Ok(Some(payload)) => {
                            if let Some(commands) = self.command_tx.upgrade() {
                                let responder = RequestResponder::new(
                                    channel,
                                    request,
                                    commands,
                                    self.codec.clone(),
                                );
                                let _ = state
                                    .events
                                    .send(ChannelEvent::Request(ChannelRequest {
                                        message,
                                        payload,
                                        responder,
                                    }))
                                    .await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(channel, error = %e, "payload reassembly failed");
                            self.reset_channel(channel).await;
                        }
                    }
                }
            }
            Frame::Success {
                channel,
                request,
                flags: frame_flags,
                payload,
                ..
            } => {
                if let Some(state) = self.channels.get_mut(&channel) {
                    match assemble(state, frame_flags, payload) {
                        Ok(Some(payload)) => {
                            if let Some(pending) = state.pending.remove(&request) {
                                state.requests.release(request);
                                let _ = pending.reply.send(Ok(payload));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(channel, error = %e, "payload reassembly failed");
                            self.reset_channel(channel).await;
                        }
                    }
                }
            }
            Frame::Failure {
                channel,
                request,
                code,
                message,
                ..
            } => {
                if let Some(state) = self.channels.get_mut(&channel) {
                    if let Some(pending) = state.pending.remove(&request) {
                        state.requests.release(request);
                        let _ = pending
                            .reply
                            .send(Err(Gtp3Error::RequestFailed { code, message }));
                    }
                }
            }
            Frame::Close {
                channel,
                code,
                message,
                ..
            } => {
                match self.channels.remove(&channel) {
                    Some(mut state) => {
                        debug!(channel, code, "channel closed by peer");
                        self.channel_ids.release(channel);
                        for (_, request) in state.pending.drain() {
                            let _ = request.reply.send(Err(Gtp3Error::ChannelClosed));
                        }
                        let _ = state
                            .events
                            .send(ChannelEvent::Closed { code, message })
                            .await;
                    }
                    None => {
                        self.send_raw(Frame::Reset {
                            sender_channel: channel,
                        })
                        .await;
                    }
                }
            }
        }

        self.maybe_ack(seq).await;
        Ok(())
    }

    /// Acknowledge every n-th received sequenced frame.
    async fn maybe_ack(&mut self, seq: Option<u16>) {
        if let Some(seq) = seq {
            if seq % self.config.ack_interval == 0 {
                let ack = Frame::Ack {
                    last_seq: self.in_seq,
                };
                self.send_raw(ack).await;
            }
        }
    }

    async fn on_pong(&mut self) {
        let now = Instant::now();
        match self.pings.pop_front() {
            Some(PingWaiter::User { reply, sent }) => {
                let _ = reply.send(Ok(now - sent));
            }
            Some(PingWaiter::Heartbeat { sent }) => {
                let _ = self.events.send(SocketEvent::Latency(now - sent)).await;
            }
            None => trace!("unsolicited pong"),
        }
    }

    async fn on_reset(&mut self, remote_id: u16) {
        let local = self
            .channels
            .iter()
            .find(|(_, state)| state.remote_id == remote_id)
            .map(|(&id, _)| id);
        let Some(local) = local else {
            return;
        };
        warn!(channel = local, "channel reset by peer");
        if let Some(mut state) = self.channels.remove(&local) {
            self.channel_ids.release(local);
            for (_, request) in state.pending.drain() {
                let _ = request.reply.send(Err(Gtp3Error::ChannelReset));
            }
            let _ = state.events.send(ChannelEvent::Reset).await;
        }
    }

    /// Tear down one channel and tell the peer, keeping the connection up.
    async fn reset_channel(&mut self, local: u16) {
        let Some(mut state) = self.channels.remove(&local) else {
            return;
        };
        self.channel_ids.release(local);
        for (_, request) in state.pending.drain() {
            let _ = request.reply.send(Err(Gtp3Error::ChannelReset));
        }
        let _ = state.events.try_send(ChannelEvent::Reset);
        self.send_raw(Frame::Reset {
            sender_channel: local,
        })
        .await;
    }

    async fn handle_ack(&mut self, seq: u16) -> Result<()> {
        self.apply_ack(seq);
        self.flush_deferred().await
    }

    fn apply_ack(&mut self, seq: u16) {
        let previous = self.window.last_ack();
        self.window.ack(seq);

        // a locally closed channel is gone once its CLOSE frame is covered
        let wrapped = seq < previous;
        let finished: Vec<u16> = self
            .channels
            .iter()
            .filter_map(|(&id, state)| match state.phase {
                Phase::Closing { close_seq } => {
                    let covered = if wrapped {
                        close_seq > previous || close_seq <= seq
                    } else {
                        close_seq > previous && close_seq <= seq
                    };
                    covered.then_some(id)
                }
                _ => None,
            })
            .collect();
        for id in finished {
            self.channels.remove(&id);
            self.channel_ids.release(id);
            trace!(channel = id, "close acknowledged");
        }
    }

    async fn flush_deferred(&mut self) -> Result<()> {
        if self.paused && self.window.can_resume() {
            self.paused = false;
            debug!("resuming paused output");
            while let Some(frame) = self.deferred.pop_front() {
                self.dispatch_sequenced(frame).await?;
                if self.window.should_pause() {
                    self.paused = true;
                    break;
                }
            }
        }
        Ok(())
    }

    // ---- connection lifecycle ----------------------------------------

    async fn on_transport_lost(&mut self) {
        if matches!(self.state, State::Closed) {
            return;
        }
        self.transport = None;
        self.next_heartbeat = None;
        for waiter in self.pings.drain(..) {
            if let PingWaiter::User { reply, .. } = waiter {
                let _ = reply.send(Err(Gtp3Error::ConnectionClosed));
            }
        }

        if matches!(self.state, State::Handshaking) || self.config.resume_window.is_zero() {
            self.fatal(Gtp3Error::ConnectionClosed).await;
            return;
        }

        debug!("transport lost, awaiting replacement");
        self.state = State::Resuming {
            deadline: Instant::now() + self.config.resume_window,
            syncing: false,
        };
        let _ = self.events.send(SocketEvent::Reconnecting).await;
    }

    async fn on_new_transport(&mut self, transport: T) {
        if matches!(self.state, State::Handshaking | State::Closed) {
            return;
        }
        let deadline = match self.state {
            State::Resuming { deadline, .. } => deadline,
            _ => Instant::now() + self.config.resume_window,
        };
        self.transport = Some(transport);
        let resume = Frame::Resume {
            session: self.session,
            last_seq: self.in_seq,
        };
        self.send_raw(resume).await;
        if self.transport.is_some() {
            self.state = State::Resuming {
                deadline,
                syncing: true,
            };
        }
    }

    /// Tear down the whole session after the peer rejected a resume.
    async fn reset(&mut self, session: u64) {
        for (_, mut state) in self.channels.drain() {
            for (_, request) in state.pending.drain() {
                let _ = request.reply.send(Err(Gtp3Error::ChannelReset));
            }
            let _ = state.events.try_send(ChannelEvent::Reset);
        }
        for (_, open) in self.pending_opens.drain() {
            let _ = open.reply.send(Err(Gtp3Error::ResumeRejected));
        }
        self.channel_ids.clear();
        self.window.clear();
        self.deferred.clear();
        self.paused = false;
        self.out_seq = 0;
        self.in_seq = 0;
        self.session = session;
        self.state = State::Connected;
        self.arm_heartbeat();
        let _ = self.events.send(SocketEvent::Reset).await;
    }

    async fn shutdown(&mut self, code: u16, message: String) {
        debug!(code, %message, "connection closed");
        self.fail_waiters(|| Gtp3Error::ConnectionClosed);
        for (_, state) in self.channels.drain() {
            let _ = state.events.try_send(ChannelEvent::Closed {
                code,
                message: message.clone(),
            });
        }
        self.state = State::Closed;
        let _ = self.events.send(SocketEvent::Closed { code, message }).await;
    }

    async fn fatal(&mut self, err: Gtp3Error) {
        if matches!(self.state, State::Closed) {
            return;
        }
        error!(error = %err, "connection failed");
        let message = err.to_string();
        if let Some(reply) = self.handshake.take() {
            let _ = reply.send(Err(err));
        }
        self.fail_waiters(|| Gtp3Error::ConnectionClosed);
        for (_, state) in self.channels.drain() {
            let _ = state.events.try_send(ChannelEvent::Closed {
                code: 0,
                message: message.clone(),
            });
        }
        self.state = State::Closed;
        let _ = self
            .events
            .send(SocketEvent::Closed { code: 0, message })
            .await;
    }

    fn fail_waiters(&mut self, err: impl Fn() -> Gtp3Error) {
        for (_, open) in self.pending_opens.drain() {
            let _ = open.reply.send(Err(err()));
        }
        for state in self.channels.values_mut() {
            for (_, request) in state.pending.drain() {
                let _ = request.reply.send(Err(err()));
            }
        }
        for waiter in self.pings.drain(..) {
            if let PingWaiter::User { reply, .. } = waiter {
                let _ = reply.send(Err(err()));
            }
        }
    }

    fn arm_heartbeat(&mut self) {
        self.next_heartbeat = self
            .config
            .heartbeat_interval
            .map(|interval| Instant::now() + interval);
    }

    // ---- outbound path -----------------------------------------------

    /// Queue a payload-class frame, deferring it while the window is paused.
    async fn queue_payload(&mut self, frame: Frame) -> Result<()> {
        if self.paused || self.window.should_pause() {
            if !self.paused {
                debug!(unacked = self.window.len(), "pausing output");
                self.paused = true;
            }
            self.deferred.push_back(frame);
            return Ok(());
        }
        self.dispatch_sequenced(frame).await?;
        Ok(())
    }

    /// Assign the next sequence number, retain the frame in the ack window
    /// and put it on the wire. Returns the assigned sequence number.
    async fn dispatch_sequenced(&mut self, mut frame: Frame) -> Result<u16> {
        self.out_seq = self.out_seq.wrapping_add(1);
        frame.set_seq(self.out_seq);
        let encoded = frame.encode()?;
        self.window.push(self.out_seq, encoded.clone())?;
        self.send_encoded(encoded).await;

        if self.window.should_request_ack(self.config.request_ack_cooldown) {
            self.send_raw(Frame::RequestAck).await;
        }
        Ok(self.out_seq)
    }

    /// Encode and send an unsequenced frame, if a transport is up.
    async fn send_raw(&mut self, frame: Frame) {
        match frame.encode() {
            Ok(encoded) => {
                self.send_encoded(encoded).await;
            }
            Err(e) => error!(error = %e, "frame encoding failed"),
        }
    }

    /// Put encoded bytes on the wire. A write failure drops the transport;
    /// sequenced frames survive in the ack window for retransmission.
    async fn send_encoded(&mut self, encoded: Bytes) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.send(encoded).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "transport write failed");
                self.on_transport_lost().await;
                false
            }
        }
    }
}

/// Run fragment reassembly for one inbound payload frame.
///
/// Returns the complete payload once the final fragment arrives, `None`
/// while more fragments are pending.
fn assemble(state: &mut ChannelState, frame_flags: u16, payload: Bytes) -> Result<Option<Bytes>> {
    if flags::has_flag(frame_flags, flags::FRAGMENT) {
        state.ring.write(&payload)?;
        return Ok(None);
    }
    if state.ring.is_empty() {
        return Ok(Some(payload));
    }
    state.ring.write(&payload)?;
    Ok(Some(state.ring.read_all()))
}

/// Split an enveloped payload into frame-sized chunks.
///
/// The boolean marks chunks that have more data following them.
fn payload_chunks(payload: Bytes) -> Vec<(Bytes, bool)> {
    if payload.len() <= PAYLOAD_CHUNK {
        return vec![(payload, false)];
    }
    let mut chunks = Vec::with_capacity(payload.len() / PAYLOAD_CHUNK + 1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + PAYLOAD_CHUNK).min(payload.len());
        chunks.push((payload.slice(offset..end), end < payload.len()));
        offset = end;
    }
    chunks
}
