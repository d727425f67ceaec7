//! End-to-end protocol tests against a scripted peer.
//!
//! The peer side speaks raw frames over an in-process duplex transport,
//! which pins down the wire behavior rather than just handle-level
//! round-trips.

use std::time::Duration;

use bytes::Bytes;
use gtp3::protocol::{flags, MAGIC};
use gtp3::{
    duplex_pair, Channel, ChannelEvent, Frame, Gtp3Error, PayloadCodec, ProtocolConfig, Socket,
    SocketEvent, SocketEvents, StreamTransport, Transport,
};
use tokio::io::DuplexStream;

type TestTransport = StreamTransport<DuplexStream>;
type TestSocket = Socket<TestTransport>;

const SESSION: u64 = 7;

/// Scripted remote endpoint. Sequenced frames it sends get consecutive
/// sequence numbers, the way a conforming implementation numbers them.
struct Peer {
    transport: TestTransport,
    seq: u16,
}

impl Peer {
    async fn accept(mut transport: TestTransport, session: u64) -> Self {
        let hello = Frame::decode(transport.recv().await.unwrap().unwrap()).unwrap();
        let Frame::Hello { magic, .. } = hello else {
            panic!("expected HELLO, got {hello:?}");
        };
        assert_eq!(magic, MAGIC);

        let mut peer = Self { transport, seq: 0 };
        peer.send(Frame::Handshake {
            magic: MAGIC,
            version: "test-peer/1".into(),
            session,
        })
        .await;
        peer
    }

    fn resumed(transport: TestTransport, seq: u16) -> Self {
        Self { transport, seq }
    }

    async fn send(&mut self, mut frame: Frame) {
        if frame.is_sequenced() {
            self.seq = self.seq.wrapping_add(1);
            frame.set_seq(self.seq);
        }
        self.transport.send(frame.encode().unwrap()).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        Frame::decode(self.transport.recv().await.unwrap().unwrap()).unwrap()
    }
}

async fn connect() -> (TestSocket, SocketEvents, Peer) {
    connect_with(ProtocolConfig::default()).await
}

async fn connect_with(config: ProtocolConfig) -> (TestSocket, SocketEvents, Peer) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (client, server) = duplex_pair(1 << 16);
    let (connected, peer) = tokio::join!(
        Socket::connect(client, config),
        Peer::accept(server, SESSION),
    );
    let (socket, events) = connected.unwrap();
    assert_eq!(socket.peer_version(), "test-peer/1");
    (socket, events, peer)
}

/// Open a channel named "echo"; the peer assigns itself id 42.
/// Returns the handle and the client-side channel id.
async fn open_echo(socket: &TestSocket, peer: &mut Peer) -> (Channel, u16) {
    let (channel, local_id) = tokio::join!(socket.open_channel("echo", "token"), async {
        let frame = peer.recv().await;
        let Frame::Open {
            sender_channel,
            channel_type,
            token,
            ..
        } = frame
        else {
            panic!("expected OPEN, got {frame:?}");
        };
        assert_eq!(channel_type, "echo");
        assert_eq!(token, "token");
        peer.send(Frame::OpenSuccess {
            seq: 0,
            recipient_channel: sender_channel,
            sender_channel: 42,
        })
        .await;
        sender_channel
    });
    (channel.unwrap(), local_id)
}

/// Raw-mode payload envelope.
fn envelope(data: &[u8]) -> Bytes {
    let mut bytes = Vec::with_capacity(1 + data.len());
    bytes.push(0x00);
    bytes.extend_from_slice(data);
    Bytes::from(bytes)
}

#[tokio::test]
async fn request_round_trip() {
    let (socket, _events, mut peer) = connect().await;
    let (channel, local_id) = open_echo(&socket, &mut peer).await;

    let (response, _) = tokio::join!(channel.request("ping", Bytes::from_static(b"hello")), async {
        let frame = peer.recv().await;
        let Frame::Request {
            channel,
            message,
            request,
            payload,
            ..
        } = frame
        else {
            panic!("expected REQUEST, got {frame:?}");
        };
        assert_eq!(channel, 42);
        assert_eq!(message, "ping");
        assert_eq!(&payload[..], b"\x00hello");
        peer.send(Frame::Success {
            seq: 0,
            channel: local_id,
            request,
            flags: 0,
            payload: envelope(b"pong"),
        })
        .await;
    });

    assert_eq!(&response.unwrap()[..], b"pong");
}

#[tokio::test]
async fn request_failure_carries_code_and_message() {
    let (socket, _events, mut peer) = connect().await;
    let (channel, local_id) = open_echo(&socket, &mut peer).await;

    let (response, _) = tokio::join!(channel.request("nope", Bytes::new()), async {
        let frame = peer.recv().await;
        let Frame::Request { request, .. } = frame else {
            panic!("expected REQUEST, got {frame:?}");
        };
        peer.send(Frame::Failure {
            seq: 0,
            channel: local_id,
            request,
            code: 404,
            message: "no handler".into(),
        })
        .await;
    });

    match response.unwrap_err() {
        Gtp3Error::RequestFailed { code, message } => {
            assert_eq!(code, 404);
            assert_eq!(message, "no handler");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn peer_message_is_delivered_decoded() {
    let (socket, _events, mut peer) = connect().await;
    let (mut channel, local_id) = open_echo(&socket, &mut peer).await;

    peer.send(Frame::Message {
        seq: 0,
        channel: local_id,
        message: "update".into(),
        flags: 0,
        payload: envelope(b"fresh"),
    })
    .await;

    let event = channel.recv().await.unwrap().unwrap();
    let ChannelEvent::Message(msg) = event else {
        panic!("expected message event");
    };
    assert_eq!(msg.message, "update");
    assert_eq!(&msg.payload[..], b"fresh");
}

#[tokio::test]
async fn large_payload_is_compressed_on_the_wire() {
    let (socket, _events, mut peer) = connect().await;
    let (channel, _) = open_echo(&socket, &mut peer).await;

    let data = Bytes::from(vec![0x42u8; 10_000]);
    channel.send("blob", data.clone()).await.unwrap();

    let frame = peer.recv().await;
    let Frame::Message { payload, .. } = frame else {
        panic!("expected MESSAGE, got {frame:?}");
    };
    assert_eq!(payload[0], 0x01);
    assert!(payload.len() < data.len());

    let decoded = PayloadCodec::new(250).decode(payload).await.unwrap();
    assert_eq!(decoded, data);
}

#[tokio::test]
async fn small_payload_stays_uncompressed() {
    let (socket, _events, mut peer) = connect().await;
    let (channel, _) = open_echo(&socket, &mut peer).await;

    channel.send("note", Bytes::from_static(b"tiny")).await.unwrap();

    let Frame::Message { payload, .. } = peer.recv().await else {
        panic!("expected MESSAGE");
    };
    assert_eq!(&payload[..], b"\x00tiny");
}

#[tokio::test]
async fn oversized_payload_is_fragmented() {
    let (socket, _events, mut peer) = connect().await;
    let (channel, _) = open_echo(&socket, &mut peer).await;

    // incompressible bytes so the envelope stays larger than one frame
    let mut state = 1u32;
    let data: Bytes = (0..100_000usize)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect::<Vec<u8>>()
        .into();

    channel.send("bulk", data.clone()).await.unwrap();

    let mut wire_payload = Vec::new();
    let mut fragments = 0;
    loop {
        let frame = peer.recv().await;
        let Frame::Message {
            message,
            flags: frame_flags,
            payload,
            ..
        } = frame
        else {
            panic!("expected MESSAGE, got {frame:?}");
        };
        assert_eq!(message, "bulk");
        wire_payload.extend_from_slice(&payload);
        fragments += 1;
        if !flags::has_flag(frame_flags, flags::FRAGMENT) {
            break;
        }
    }
    assert!(fragments > 1, "payload should span multiple frames");

    let decoded = PayloadCodec::new(250)
        .decode(Bytes::from(wire_payload))
        .await
        .unwrap();
    assert_eq!(decoded, data);
}

#[tokio::test]
async fn fragmented_inbound_payload_is_reassembled() {
    let (socket, _events, mut peer) = connect().await;
    let (mut channel, local_id) = open_echo(&socket, &mut peer).await;

    let full = envelope(b"spread over frames");
    let (a, rest) = full.split_at(5);
    let (b, c) = rest.split_at(7);

    for (chunk, more) in [(a, true), (b, true), (c, false)] {
        peer.send(Frame::Message {
            seq: 0,
            channel: local_id,
            message: "joined".into(),
            flags: if more { flags::FRAGMENT } else { 0 },
            payload: Bytes::copy_from_slice(chunk),
        })
        .await;
    }

    let event = channel.recv().await.unwrap().unwrap();
    let ChannelEvent::Message(msg) = event else {
        panic!("expected message event");
    };
    assert_eq!(&msg.payload[..], b"spread over frames");
}

#[tokio::test]
async fn resume_retransmits_unacked_frames_in_order() {
    let (socket, mut events, mut peer) = connect().await;
    let (channel, _) = open_echo(&socket, &mut peer).await;

    channel.send("m1", Bytes::from_static(b"one")).await.unwrap();
    channel.send("m2", Bytes::from_static(b"two")).await.unwrap();
    assert!(matches!(peer.recv().await, Frame::Message { seq: 2, .. }));
    assert!(matches!(peer.recv().await, Frame::Message { seq: 3, .. }));

    let peer_seq = peer.seq;
    drop(peer);
    assert!(matches!(
        events.recv().await,
        Some(SocketEvent::Reconnecting)
    ));

    let (client, server) = duplex_pair(1 << 16);
    socket.resume(client).await.unwrap();
    let mut peer = Peer::resumed(server, peer_seq);

    let frame = peer.recv().await;
    let Frame::Resume { session, last_seq } = frame else {
        panic!("expected RESUME, got {frame:?}");
    };
    assert_eq!(session, SESSION);
    assert_eq!(last_seq, 1);

    // only the OPEN was acknowledged; both messages must come again, in order
    peer.send(Frame::Sync { last_seq: 1 }).await;
    let first = peer.recv().await;
    let Frame::Message { seq: 2, message, .. } = first else {
        panic!("expected retransmitted m1, got {first:?}");
    };
    assert_eq!(message, "m1");
    let second = peer.recv().await;
    let Frame::Message { seq: 3, message, .. } = second else {
        panic!("expected retransmitted m2, got {second:?}");
    };
    assert_eq!(message, "m2");

    assert!(matches!(events.recv().await, Some(SocketEvent::Resumed)));

    // the stream continues with fresh sequence numbers
    channel.send("m3", Bytes::from_static(b"three")).await.unwrap();
    assert!(matches!(peer.recv().await, Frame::Message { seq: 4, .. }));
}

#[tokio::test]
async fn rejected_resume_resets_the_session() {
    let (socket, mut events, mut peer) = connect().await;
    let (mut channel, _) = open_echo(&socket, &mut peer).await;

    drop(peer);
    assert!(matches!(
        events.recv().await,
        Some(SocketEvent::Reconnecting)
    ));

    let (client, server) = duplex_pair(1 << 16);
    socket.resume(client).await.unwrap();
    let mut peer = Peer::resumed(server, 0);
    assert!(matches!(peer.recv().await, Frame::Resume { .. }));

    // the peer no longer knows the session and answers with a new handshake
    peer.send(Frame::Handshake {
        magic: MAGIC,
        version: "test-peer/1".into(),
        session: 99,
    })
    .await;

    assert!(matches!(events.recv().await, Some(SocketEvent::Reset)));
    let event = channel.recv().await.unwrap().unwrap();
    assert!(matches!(event, ChannelEvent::Reset));

    let err = channel.request("late", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Gtp3Error::ChannelClosed));
}

#[tokio::test]
async fn unacked_hard_limit_kills_the_connection() {
    let mut config = ProtocolConfig::default();
    config.window.soft = 10_000;
    config.window.pause = 10_000;
    config.window.hard = 8;

    let (socket, mut events, mut peer) = connect_with(config).await;
    let (channel, _) = open_echo(&socket, &mut peer).await;

    // the peer acknowledges nothing; the window fills and trips the limit
    for i in 0..10u16 {
        if channel
            .send(format!("m{i}"), Bytes::from_static(b"x"))
            .await
            .is_err()
        {
            break;
        }
    }

    loop {
        match events.recv().await {
            Some(SocketEvent::Closed { .. }) => break,
            Some(_) => continue,
            None => panic!("event stream ended without Closed"),
        }
    }
}

#[tokio::test]
async fn backpressure_pauses_and_resumes_payload_flow() {
    let mut config = ProtocolConfig::default();
    config.window.soft = 2;
    config.window.pause = 3;
    config.window.hard = 100;
    config.request_ack_cooldown = 10_000;

    let (socket, _events, mut peer) = connect_with(config).await;
    let (channel, _) = open_echo(&socket, &mut peer).await;

    // OPEN occupies seq 1; two messages reach the pause threshold of 3
    for i in 0..5u16 {
        channel
            .send(format!("m{i}"), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    assert!(matches!(peer.recv().await, Frame::Message { seq: 2, .. }));
    assert!(matches!(peer.recv().await, Frame::Message { seq: 3, .. }));

    // nothing else may arrive while the window is full
    let pending = tokio::time::timeout(Duration::from_millis(100), peer.recv()).await;
    assert!(pending.is_err(), "paused sender must not transmit");

    // acknowledging drains the window below the soft limit and releases
    // the deferred frames
    peer.send(Frame::Ack { last_seq: 3 }).await;
    assert!(matches!(peer.recv().await, Frame::Message { seq: 4, .. }));
    assert!(matches!(peer.recv().await, Frame::Message { seq: 5, .. }));
}

#[tokio::test]
async fn request_on_closed_channel_sends_nothing() {
    let (socket, _events, mut peer) = connect().await;
    let (mut channel, _) = open_echo(&socket, &mut peer).await;

    channel.close(0, "done").await.unwrap();
    assert!(matches!(peer.recv().await, Frame::Close { .. }));

    let err = channel.request("late", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Gtp3Error::ChannelClosed));

    let silent = tokio::time::timeout(Duration::from_millis(100), peer.recv()).await;
    assert!(silent.is_err(), "no frame may follow a local close");
}

#[tokio::test]
async fn peer_close_tears_down_the_channel() {
    let (socket, _events, mut peer) = connect().await;
    let (mut channel, local_id) = open_echo(&socket, &mut peer).await;

    peer.send(Frame::Close {
        seq: 0,
        channel: local_id,
        code: 4,
        message: "going away".into(),
    })
    .await;

    let event = channel.recv().await.unwrap().unwrap();
    let ChannelEvent::Closed { code, message } = event else {
        panic!("expected close event");
    };
    assert_eq!(code, 4);
    assert_eq!(message, "going away");

    let err = channel.send("late", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Gtp3Error::ChannelClosed));
}

#[tokio::test]
async fn handshake_timeout_fails_connect() {
    let config = ProtocolConfig {
        handshake_timeout: Duration::from_millis(50),
        ..ProtocolConfig::default()
    };

    let (client, server) = duplex_pair(1 << 16);
    // keep the peer side open but silent
    let _server = server;

    let err = Socket::connect(client, config).await.unwrap_err();
    assert!(matches!(err, Gtp3Error::HandshakeTimeout));
}

#[tokio::test]
async fn frame_for_unknown_channel_is_reset() {
    let (_socket, _events, mut peer) = connect().await;

    peer.send(Frame::Message {
        seq: 0,
        channel: 77,
        message: "ghost".into(),
        flags: 0,
        payload: envelope(b""),
    })
    .await;

    let frame = peer.recv().await;
    assert!(matches!(frame, Frame::Reset { sender_channel: 77 }));
}

#[tokio::test]
async fn every_eighth_frame_is_acknowledged() {
    let (socket, _events, mut peer) = connect().await;
    let (_channel, local_id) = open_echo(&socket, &mut peer).await;

    // OPEN_SUCCESS was seq 1; seven messages take the inbound stream to 8
    for i in 0..7u16 {
        peer.send(Frame::Message {
            seq: 0,
            channel: local_id,
            message: format!("m{i}"),
            flags: 0,
            payload: envelope(b""),
        })
        .await;
    }

    let frame = peer.recv().await;
    assert!(matches!(frame, Frame::Ack { last_seq: 8 }));
}

#[tokio::test]
async fn ping_measures_round_trip() {
    let (socket, _events, mut peer) = connect().await;

    let (latency, _) = tokio::join!(socket.ping(), async {
        assert!(matches!(peer.recv().await, Frame::Ping));
        peer.send(Frame::Pong).await;
    });
    assert!(latency.unwrap() < Duration::from_secs(1));
}

#[tokio::test]
async fn json_request_round_trip() {
    let (socket, _events, mut peer) = connect().await;
    let (channel, local_id) = open_echo(&socket, &mut peer).await;

    let query = serde_json::json!({ "name": "status" });
    let (response, _) = tokio::join!(
        channel.request_json::<_, serde_json::Value>("query", &query),
        async {
            let frame = peer.recv().await;
            let Frame::Request {
                request, payload, ..
            } = frame
            else {
                panic!("expected REQUEST, got {frame:?}");
            };
            let received: serde_json::Value = serde_json::from_slice(&payload[1..]).unwrap();
            assert_eq!(received["name"], "status");

            let answer = serde_json::to_vec(&serde_json::json!({ "ok": true })).unwrap();
            peer.send(Frame::Success {
                seq: 0,
                channel: local_id,
                request,
                flags: 0,
                payload: envelope(&answer),
            })
            .await;
        }
    );

    assert_eq!(response.unwrap()["ok"], true);
}

#[tokio::test]
async fn heartbeat_reports_latency() {
    let config = ProtocolConfig {
        heartbeat_interval: Some(Duration::from_millis(50)),
        ..ProtocolConfig::default()
    };
    let (_socket, mut events, mut peer) = connect_with(config).await;

    assert!(matches!(peer.recv().await, Frame::Ping));
    peer.send(Frame::Pong).await;

    let Some(SocketEvent::Latency(latency)) = events.recv().await else {
        panic!("expected latency event");
    };
    assert!(latency < Duration::from_secs(1));
}

#[tokio::test]
async fn peer_initiated_open_is_accepted() {
    let (_socket, mut events, mut peer) = connect().await;

    peer.send(Frame::Open {
        seq: 0,
        sender_channel: 5,
        channel_type: "push".into(),
        token: "t".into(),
        parent_channel: 0,
    })
    .await;

    let Some(SocketEvent::ChannelOpen(request)) = events.recv().await else {
        panic!("expected channel open event");
    };
    assert_eq!(request.channel_type(), "push");
    assert_eq!(request.token(), "t");

    let mut channel = request.accept().await.unwrap();
    let frame = peer.recv().await;
    let Frame::OpenSuccess {
        recipient_channel,
        sender_channel,
        ..
    } = frame
    else {
        panic!("expected OPEN_SUCCESS, got {frame:?}");
    };
    assert_eq!(recipient_channel, 5);
    assert_eq!(sender_channel, channel.id());

    peer.send(Frame::Message {
        seq: 0,
        channel: channel.id(),
        message: "hi".into(),
        flags: 0,
        payload: envelope(b"yo"),
    })
    .await;
    let event = channel.recv().await.unwrap().unwrap();
    let ChannelEvent::Message(msg) = event else {
        panic!("expected message event");
    };
    assert_eq!(&msg.payload[..], b"yo");
}

#[tokio::test]
async fn peer_initiated_open_can_be_rejected() {
    let (_socket, mut events, mut peer) = connect().await;

    peer.send(Frame::Open {
        seq: 0,
        sender_channel: 5,
        channel_type: "push".into(),
        token: "bad".into(),
        parent_channel: 0,
    })
    .await;

    let Some(SocketEvent::ChannelOpen(request)) = events.recv().await else {
        panic!("expected channel open event");
    };
    request.reject(401, "bad token").await.unwrap();

    let frame = peer.recv().await;
    let Frame::OpenFailure {
        recipient_channel,
        code,
        message,
        ..
    } = frame
    else {
        panic!("expected OPEN_FAILURE, got {frame:?}");
    };
    assert_eq!(recipient_channel, 5);
    assert_eq!(code, 401);
    assert_eq!(message, "bad token");
}

#[tokio::test]
async fn unanswered_request_times_out_and_releases_its_id() {
    let config = ProtocolConfig {
        request_timeout: Duration::from_millis(100),
        ..ProtocolConfig::default()
    };
    let (socket, _events, mut peer) = connect_with(config).await;
    let (channel, local_id) = open_echo(&socket, &mut peer).await;

    let err = channel.request("slow", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Gtp3Error::RequestTimeout));
    let frame = peer.recv().await;
    let Frame::Request {
        request: first_id, ..
    } = frame
    else {
        panic!("expected REQUEST, got {frame:?}");
    };

    // the timed-out id went back to the pool and gets reused
    let (response, _) = tokio::join!(channel.request("retry", Bytes::new()), async {
        let frame = peer.recv().await;
        let Frame::Request { request, .. } = frame else {
            panic!("expected REQUEST, got {frame:?}");
        };
        assert_eq!(request, first_id);
        peer.send(Frame::Success {
            seq: 0,
            channel: local_id,
            request,
            flags: 0,
            payload: envelope(b"late is fine"),
        })
        .await;
    });
    assert_eq!(&response.unwrap()[..], b"late is fine");
}

#[tokio::test]
async fn inflight_request_limit_fails_fast() {
    let mut config = ProtocolConfig::default();
    config.inflight_requests = 2;
    let (socket, _events, mut peer) = connect_with(config).await;
    let (channel, _) = open_echo(&socket, &mut peer).await;

    let first = channel.request("r1", Bytes::new());
    let second = channel.request("r2", Bytes::new());
    tokio::pin!(first, second);
    // both stay outstanding waiting for answers that never come
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut first)
        .await
        .is_err());
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut second)
        .await
        .is_err());

    let err = channel.request("r3", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Gtp3Error::PoolExhausted));

    // the refused request never reached the wire
    assert!(matches!(peer.recv().await, Frame::Request { .. }));
    assert!(matches!(peer.recv().await, Frame::Request { .. }));
    let silent = tokio::time::timeout(Duration::from_millis(100), peer.recv()).await;
    assert!(silent.is_err(), "only two requests may be transmitted");
}

#[tokio::test]
async fn reassembly_overflow_resets_only_the_channel() {
    let mut config = ProtocolConfig::default();
    config.reassembly_capacity = 16;
    let (socket, _events, mut peer) = connect_with(config).await;
    let (mut channel, local_id) = open_echo(&socket, &mut peer).await;

    // a fragment larger than the reassembly buffer
    peer.send(Frame::Message {
        seq: 0,
        channel: local_id,
        message: "big".into(),
        flags: flags::FRAGMENT,
        payload: Bytes::from(vec![0u8; 64]),
    })
    .await;

    let frame = peer.recv().await;
    assert!(matches!(frame, Frame::Reset { sender_channel } if sender_channel == local_id));
    let event = channel.recv().await.unwrap().unwrap();
    assert!(matches!(event, ChannelEvent::Reset));

    // the connection itself survives and serves new channels
    let (mut replacement, new_id) = open_echo(&socket, &mut peer).await;
    peer.send(Frame::Message {
        seq: 0,
        channel: new_id,
        message: "hello".into(),
        flags: 0,
        payload: envelope(b"still here"),
    })
    .await;
    let event = replacement.recv().await.unwrap().unwrap();
    let ChannelEvent::Message(msg) = event else {
        panic!("expected message event");
    };
    assert_eq!(&msg.payload[..], b"still here");
}

#[tokio::test]
async fn dropping_every_handle_stops_the_driver() {
    let (socket, events, mut peer) = connect().await;

    drop(socket);
    drop(events);

    // the driver says goodbye and hangs up instead of lingering
    assert!(matches!(peer.recv().await, Frame::Bye { .. }));
    assert!(peer.transport.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn live_channel_keeps_the_connection_running() {
    let (socket, events, mut peer) = connect().await;
    let (channel, local_id) = open_echo(&socket, &mut peer).await;

    drop(socket);
    drop(events);

    // the surviving channel handle keeps the driver serving traffic
    let (response, _) = tokio::join!(channel.request("ping", Bytes::new()), async {
        let frame = peer.recv().await;
        let Frame::Request { request, .. } = frame else {
            panic!("expected REQUEST, got {frame:?}");
        };
        peer.send(Frame::Success {
            seq: 0,
            channel: local_id,
            request,
            flags: 0,
            payload: envelope(b"pong"),
        })
        .await;
    });
    assert_eq!(&response.unwrap()[..], b"pong");

    drop(channel);
    assert!(matches!(peer.recv().await, Frame::Close { .. }));
    assert!(matches!(peer.recv().await, Frame::Bye { .. }));
    assert!(peer.transport.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn bye_closes_the_connection() {
    let (_socket, mut events, mut peer) = connect().await;

    peer.send(Frame::Bye {
        code: 42,
        message: "done".into(),
    })
    .await;

    let Some(SocketEvent::Closed { code, message }) = events.recv().await else {
        panic!("expected closed event");
    };
    assert_eq!(code, 42);
    assert_eq!(message, "done");
}

#[tokio::test]
async fn out_of_order_sequence_is_fatal() {
    let (_socket, mut events, mut peer) = connect().await;

    // skip a sequence number
    peer.seq = 1;
    peer.send(Frame::Message {
        seq: 0,
        channel: 1,
        message: "skip".into(),
        flags: 0,
        payload: envelope(b""),
    })
    .await;

    let Some(SocketEvent::Closed { message, .. }) = events.recv().await else {
        panic!("expected closed event");
    };
    assert!(message.contains("sequence"));
}
