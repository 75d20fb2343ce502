//! Integration tests for host and peers over real TCP connections.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanlink::prelude::*;
use lanlink::protocol::{FrameBuffer, Message, WireCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

// =========================================================================
// Helpers
// =========================================================================

/// Thread-safe list of observed events.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Polls `check` until it holds, panicking after five seconds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn start_host() -> (Host, u16) {
    start_host_with(Host::builder()).await
}

async fn start_host_with(builder: HostBuilder) -> (Host, u16) {
    let host = builder
        .bind_address("127.0.0.1")
        .start(0)
        .await
        .expect("host should start");
    let port = host.local_addr().expect("should have local addr").port();
    (host, port)
}

/// Connects `peer` and waits until the host has given it an id.
async fn join(peer: &Peer, port: u16) {
    peer.connect("127.0.0.1", port)
        .await
        .expect("should connect");
    wait_for_state(peer, PeerState::Joined).await;
}

async fn wait_for_state(peer: &Peer, state: PeerState) {
    let mut states = peer.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .expect("state channel open");
}

/// Records `from:text` for every message a peer receives.
fn record_receives(peer: &Peer) -> Log {
    let log = Log::default();
    let sink = log.clone();
    peer.on_receive(move |msg| {
        let from = msg.from_nickname.clone().unwrap_or_else(|| "host".into());
        sink.push(format!("{from}:{}", msg.text().unwrap_or("<binary>")));
    });
    log
}

/// Sends one frame over a raw socket.
async fn send_raw(stream: &mut TcpStream, message: &Message) {
    let frame = WireCodec::default().encode(message).unwrap();
    stream.write_all(&frame).await.unwrap();
}

/// Reads from a raw socket until one message is complete.
async fn recv_raw(stream: &mut TcpStream, frames: &mut FrameBuffer) -> Message {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(message) = frames.next_message().unwrap() {
            return message;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for a message");
        frames.push(&buf[..n]);
    }
}

/// Drains a raw socket until the host closes it.
async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 4096];
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "host should close the connection");
}

async fn raw_handshake(stream: &mut TcpStream, frames: &mut FrameBuffer, nickname: &str) -> PeerId {
    let ask = Message::new(RoutingTag::NicknameAsk, PeerId::HOST, PeerId::HOST).with_value(nickname);
    send_raw(stream, &ask).await;
    let reply = recv_raw(stream, frames).await;
    assert_eq!(reply.routing_tag(), RoutingTag::Id);
    reply.to_id()
}

// =========================================================================
// Identity handshake
// =========================================================================

#[tokio::test]
async fn test_two_peers_get_distinct_ids_and_broadcast_skips_sender() {
    let (host, port) = start_host().await;
    let host_log = Log::default();
    let sink = host_log.clone();
    host.on_receive(move |msg| {
        sink.push(format!("{:?}:{}", msg.from_nickname, msg.text().unwrap_or("")));
    });

    let alice = Peer::new("Alice");
    let alice_log = record_receives(&alice);
    join(&alice, port).await;

    let bob = Peer::new("Bob");
    let bob_log = record_receives(&bob);
    join(&bob, port).await;

    assert_eq!(alice.local_id(), PeerId(1));
    assert_eq!(bob.local_id(), PeerId(2));

    alice.send_to_all("hi", 0).unwrap();

    eventually("bob to receive hi", || bob_log.contains("Alice:hi")).await;
    eventually("host to receive hi", || host_log.contains("Some(\"Alice\"):hi")).await;

    // Give a stray echo time to arrive before checking it did not.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice_log.entries().is_empty(), "sender saw its own broadcast");
}

#[tokio::test]
async fn test_send_right_after_connect_uses_assigned_identity() {
    let (host, port) = start_host().await;
    let host_log = Log::default();
    let sink = host_log.clone();
    host.on_receive(move |msg| sink.push(format!("{}:{:?}", msg.from_id, msg.from_nickname)));

    let bob = Peer::new("Bob");
    let bob_log = record_receives(&bob);
    join(&bob, port).await;

    let alice = Peer::new("Alice");
    let alice_log = record_receives(&alice);
    alice.connect("127.0.0.1", port).await.expect("should connect");
    alice.send_to_all("hi", 0).unwrap();
    alice.send_to_server("ready", 0).unwrap();

    eventually("bob to receive hi", || bob_log.contains("Alice:hi")).await;
    eventually("host to receive both", || host_log.len() == 2).await;
    assert_eq!(host_log.entries(), vec!["peer-2:Some(\"Alice\")"; 2]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice_log.entries().is_empty(), "sender saw its own broadcast");
    assert_eq!(alice.local_id(), PeerId(2));
}

#[tokio::test]
async fn test_duplicate_nicknames_are_suffixed() {
    let (host, port) = start_host().await;

    let first = Peer::new("Player");
    join(&first, port).await;
    let second = Peer::new("Player");
    join(&second, port).await;

    eventually("second nickname", || second.nickname() == "Player1").await;
    assert_eq!(first.nickname(), "Player");

    let peers = host.peers();
    assert_eq!(peers.nickname(PeerId(1)), Some("Player"));
    assert_eq!(peers.nickname(PeerId(2)), Some("Player1"));
}

#[tokio::test]
async fn test_directories_converge() {
    let (host, port) = start_host().await;

    let alice_joins = Log::default();
    let alice = Peer::new("Alice");
    let sink = alice_joins.clone();
    alice.on_client_connect(move |nick| sink.push(nick));

    let bob = Peer::new("Bob");
    let carol = Peer::new("Carol");
    join(&alice, port).await;
    join(&bob, port).await;
    join(&carol, port).await;

    for peer in [&alice, &bob, &carol] {
        eventually("full directory", || peer.directory().len() == 3).await;
        let directory = peer.directory();
        assert_eq!(directory.id_of("Alice"), Some(PeerId(1)));
        assert_eq!(directory.id_of("Bob"), Some(PeerId(2)));
        assert_eq!(directory.id_of("Carol"), Some(PeerId(3)));
    }
    assert_eq!(host.peers(), alice.directory());

    // Each peer is announced exactly once.
    assert_eq!(alice_joins.entries(), vec!["Alice", "Bob", "Carol"]);
}

#[tokio::test]
async fn test_directories_converge_when_joins_interleave() {
    let (host, port) = start_host().await;

    let peers = [Peer::new("Alice"), Peer::new("Bob"), Peer::new("Carol")];
    let announced: Vec<Log> = peers
        .iter()
        .map(|peer| {
            let log = Log::default();
            let sink = log.clone();
            peer.on_client_connect(move |nick| sink.push(nick));
            log
        })
        .collect();

    let (a, b, c) = tokio::join!(
        peers[0].connect("127.0.0.1", port),
        peers[1].connect("127.0.0.1", port),
        peers[2].connect("127.0.0.1", port),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    eventually("host to identify everyone", || host.peers().len() == 3).await;
    let expected = host.peers();
    for (peer, log) in peers.iter().zip(&announced) {
        eventually("directory to match the host", || peer.directory() == expected).await;
        assert_eq!(peer.state(), PeerState::Joined);
        eventually("three announcements", || log.len() >= 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut seen = log.entries();
        seen.sort();
        assert_eq!(seen, vec!["Alice", "Bob", "Carol"], "each peer announced once");
    }

    let mut ids: Vec<u8> = peers.iter().map(|peer| peer.local_id().0).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_host_reports_connects_in_order() {
    let connects = Log::default();
    let sink = connects.clone();
    let (_host, port) =
        start_host_with(Host::builder().on_client_connect(move |nick| sink.push(nick))).await;

    let alice = Peer::new("Alice");
    join(&alice, port).await;
    let bob = Peer::new("Alice");
    join(&bob, port).await;

    eventually("two connects", || connects.len() == 2).await;
    assert_eq!(connects.entries(), vec!["Alice", "Alice1"]);
}

#[tokio::test]
async fn test_exhausted_identities_reject_handshake() {
    let errors = Log::default();
    let sink = errors.clone();
    let (_host, port) = start_host_with(
        Host::builder()
            .max_peers(1)
            .on_error(move |e| sink.push(e.to_string())),
    )
    .await;

    let alice = Peer::new("Alice");
    join(&alice, port).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let ask = Message::new(RoutingTag::NicknameAsk, PeerId::HOST, PeerId::HOST).with_value("Bob");
    send_raw(&mut stream, &ask).await;
    expect_closed(&mut stream).await;

    eventually("exhaustion error", || errors.entries().iter().any(|e| e.contains("no free peer id"))).await;
    assert_eq!(alice.local_id(), PeerId(1));
}

// =========================================================================
// Routing
// =========================================================================

#[tokio::test]
async fn test_client_to_client_reaches_only_target() {
    let (host, port) = start_host().await;
    let host_log = Log::default();
    let sink = host_log.clone();
    host.on_receive(move |msg| sink.push(msg.text().unwrap_or("").to_string()));

    let alice = Peer::new("Alice");
    let bob = Peer::new("Bob");
    let carol = Peer::new("Carol");
    let alice_log = record_receives(&alice);
    let bob_log = record_receives(&bob);
    let carol_log = record_receives(&carol);
    join(&alice, port).await;
    join(&bob, port).await;
    join(&carol, port).await;
    eventually("alice sees everyone", || alice.directory().len() == 3).await;

    alice.send_to_client("Bob", "psst", 1).unwrap();
    alice.send_to_client("Alice", "memo", 1).unwrap();

    eventually("bob gets psst", || bob_log.contains("Alice:psst")).await;
    eventually("alice gets her memo", || alice_log.contains("Alice:memo")).await;
    eventually("host sees both", || host_log.len() == 2).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(carol_log.entries().is_empty());
    assert_eq!(bob_log.entries(), vec!["Alice:psst"]);
}

#[tokio::test]
async fn test_client_to_server_reaches_only_host() {
    let (host, port) = start_host().await;
    let host_log = Log::default();
    let sink = host_log.clone();
    host.on_receive(move |msg| {
        sink.push(format!(
            "{}:{}:{:?}",
            msg.from_nickname.as_deref().unwrap_or("?"),
            msg.app_tag,
            msg.payload
        ));
    });

    let alice = Peer::new("Alice");
    let bob = Peer::new("Bob");
    let bob_log = record_receives(&bob);
    join(&alice, port).await;
    join(&bob, port).await;

    alice.send_to_server(vec![1u8, 2, 3], 42).unwrap();

    eventually("host gets bytes", || host_log.len() == 1).await;
    assert_eq!(host_log.entries(), vec!["Alice:42:Binary([1, 2, 3])"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob_log.entries().is_empty());
}

#[tokio::test]
async fn test_host_sends_to_one_and_to_all() {
    let (host, port) = start_host().await;

    let alice = Peer::new("Alice");
    let bob = Peer::new("Bob");
    let alice_log = record_receives(&alice);
    let bob_log = record_receives(&bob);
    join(&alice, port).await;
    join(&bob, port).await;

    host.send_to_client("Bob", "secret", 0).unwrap();
    host.send_to_all("everyone", 0).unwrap();

    eventually("bob gets both", || bob_log.len() == 2).await;
    assert_eq!(bob_log.entries(), vec!["host:secret", "host:everyone"]);
    eventually("alice gets broadcast", || alice_log.len() == 1).await;
    assert_eq!(alice_log.entries(), vec!["host:everyone"]);
}

#[tokio::test]
async fn test_send_to_unknown_nickname_is_not_found() {
    let (host, port) = start_host().await;
    let alice = Peer::new("Alice");
    join(&alice, port).await;

    assert!(matches!(
        host.send_to_client("Nobody", "hi", 0),
        Err(LanError::NotFound(name)) if name == "Nobody"
    ));
    assert!(matches!(
        alice.send_to_client("Nobody", "hi", 0),
        Err(LanError::NotFound(_))
    ));
}

// =========================================================================
// Disconnects and failures
// =========================================================================

#[tokio::test]
async fn test_disconnect_cleans_up_and_frees_id() {
    let host_leaves = Log::default();
    let sink = host_leaves.clone();
    let (host, port) =
        start_host_with(Host::builder().on_client_disconnect(move |nick| sink.push(nick))).await;

    let alice = Peer::new("Alice");
    let alice_leaves = Log::default();
    let sink = alice_leaves.clone();
    alice.on_client_disconnect(move |nick| sink.push(nick));

    let bob = Peer::new("Bob");
    join(&alice, port).await;
    join(&bob, port).await;
    eventually("alice knows bob", || alice.directory().contains(PeerId(2))).await;

    bob.disconnect();
    bob.disconnect();
    assert_eq!(bob.state(), PeerState::Disconnected);

    eventually("host drops bob", || host_leaves.contains("Bob")).await;
    eventually("alice drops bob", || !alice.directory().contains(PeerId(2))).await;
    assert_eq!(alice_leaves.entries(), vec!["Bob"]);
    assert_eq!(host.peers().len(), 1);

    let carol = Peer::new("Carol");
    join(&carol, port).await;
    assert_eq!(carol.local_id(), PeerId(2));
}

#[tokio::test]
async fn test_corrupt_frame_closes_connection() {
    let errors = Log::default();
    let leaves = Log::default();
    let error_sink = errors.clone();
    let leave_sink = leaves.clone();
    let (_host, port) = start_host_with(
        Host::builder()
            .on_error(move |e| error_sink.push(e.to_string()))
            .on_client_disconnect(move |nick| leave_sink.push(nick)),
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut frames = FrameBuffer::new(WireCodec::default());
    assert_eq!(raw_handshake(&mut stream, &mut frames, "Raw").await, PeerId(1));

    // Five bytes that are not a DEFLATE stream.
    let mut garbage = 5u32.to_le_bytes().to_vec();
    garbage.extend_from_slice(&[0xff; 5]);
    stream.write_all(&garbage).await.unwrap();

    expect_closed(&mut stream).await;
    eventually("disconnect reported", || leaves.contains("Raw")).await;
    assert!(errors.entries().iter().any(|e| e.contains("corrupt frame")));
}

#[tokio::test]
async fn test_handshake_frames_arrive_in_order() {
    let (_host, port) = start_host().await;
    let alice = Peer::new("Alice");
    join(&alice, port).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut frames = FrameBuffer::new(WireCodec::default());
    let id = raw_handshake(&mut stream, &mut frames, "Bob").await;
    assert_eq!(id, PeerId(2));

    let own = recv_raw(&mut stream, &mut frames).await;
    assert_eq!(own.routing_tag(), RoutingTag::Nickname);
    assert_eq!((own.to_id(), own.value()), (PeerId(2), "Bob"));

    let backfill = recv_raw(&mut stream, &mut frames).await;
    assert_eq!(backfill.routing_tag(), RoutingTag::Nickname);
    assert_eq!((backfill.to_id(), backfill.value()), (PeerId(1), "Alice"));
}

#[tokio::test]
async fn test_unidentified_traffic_is_ignored() {
    let (host, port) = start_host().await;
    let received = Log::default();
    let sink = received.clone();
    host.on_receive(move |msg| sink.push(msg.text().unwrap_or("")));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let early = Message::new(RoutingTag::ClientToServer, PeerId(9), PeerId::HOST).with_value("early");
    send_raw(&mut stream, &early).await;

    let mut frames = FrameBuffer::new(WireCodec::default());
    raw_handshake(&mut stream, &mut frames, "Late").await;
    let late = Message::new(RoutingTag::ClientToServer, PeerId(1), PeerId::HOST).with_value("late");
    send_raw(&mut stream, &late).await;

    eventually("late message", || received.contains("late")).await;
    assert_eq!(received.entries(), vec!["late"]);
}

#[tokio::test]
async fn test_idle_timeout_closes_silent_connection() {
    let (_host, port) =
        start_host_with(Host::builder().idle_timeout(Duration::from_millis(100))).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_closed(&mut stream).await;
}

#[tokio::test]
async fn test_host_stop_is_idempotent() {
    let (host, port) = start_host().await;
    let alice = Peer::builder()
        .nickname("Alice")
        .reconnect_interval(Duration::from_secs(60))
        .build();
    let lost = Log::default();
    let sink = lost.clone();
    alice.on_lost_connection(move || sink.push("lost"));
    join(&alice, port).await;

    host.stop();
    host.stop();
    assert!(!host.is_running());
    assert!(matches!(host.send_to_all("x", 0), Err(LanError::NotRunning)));

    eventually("peer notices", || lost.len() == 1).await;
    assert_eq!(alice.local_id(), PeerId::HOST);
    assert!(alice.directory().is_empty());
}

#[tokio::test]
async fn test_connect_after_stop_is_refused() {
    let (host, port) = start_host().await;
    host.stop();

    // The accept loop lets go of the listener once it sees the stop.
    let deadline = Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
        assert!(Instant::now() < deadline, "listener still bound after stop");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let alice = Peer::new("Alice");
    let result = alice.connect("127.0.0.1", port).await;
    assert!(matches!(result, Err(LanError::Transport(_))));
    assert_eq!(alice.state(), PeerState::Disconnected);
    assert_eq!(host.local_addr().unwrap().port(), port);
}

// =========================================================================
// Reconnection
// =========================================================================

#[tokio::test]
async fn test_connect_refused_returns_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let peer = Peer::new("Alice");
    let result = peer.connect("127.0.0.1", port).await;
    assert!(matches!(result, Err(LanError::Transport(_))));
    assert_eq!(peer.state(), PeerState::Disconnected);
}

#[tokio::test]
async fn test_peer_reconnects_after_host_restart() {
    let (host, port) = start_host().await;

    let alice = Peer::builder()
        .nickname("Alice")
        .reconnect_interval(Duration::from_millis(50))
        .build();
    let lost = Log::default();
    let attempts = Log::default();
    let lost_sink = lost.clone();
    let attempt_sink = attempts.clone();
    alice.on_lost_connection(move || lost_sink.push("lost"));
    alice.on_reconnection_attempt(move |n| attempt_sink.push(n.to_string()));
    join(&alice, port).await;

    drop(host);
    eventually("lost connection", || lost.len() == 1).await;
    eventually("a retry", || attempts.len() >= 1).await;

    // The old listener goes away once its accept loop has wound down.
    let deadline = Instant::now() + Duration::from_secs(5);
    let restarted = loop {
        match Host::builder().bind_address("127.0.0.1").start(port).await {
            Ok(host) => break host,
            Err(e) => {
                assert!(Instant::now() < deadline, "could not rebind: {e}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    };

    wait_for_state(&alice, PeerState::Joined).await;
    assert_eq!(alice.local_id(), PeerId(1));
    assert_eq!(attempts.entries().first().map(String::as_str), Some("1"));
    eventually("host sees alice", || restarted.peers().id_of("Alice").is_some()).await;
}

#[tokio::test]
async fn test_disconnect_stops_reconnection() {
    let (host, port) = start_host().await;

    let alice = Peer::builder()
        .nickname("Alice")
        .reconnect_interval(Duration::from_millis(20))
        .build();
    let attempts = Log::default();
    let sink = attempts.clone();
    alice.on_reconnection_attempt(move |n| sink.push(n.to_string()));
    join(&alice, port).await;

    drop(host);
    eventually("retrying", || attempts.len() >= 2).await;

    alice.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = attempts.len();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(attempts.len(), settled);
    assert_eq!(alice.state(), PeerState::Disconnected);
}

#[tokio::test]
async fn test_reconnection_gives_up_after_max_attempts() {
    let (host, port) = start_host().await;

    let alice = Peer::builder()
        .nickname("Alice")
        .reconnect_interval(Duration::from_millis(10))
        .max_reconnect_attempts(2)
        .build();
    let errors = Log::default();
    let sink = errors.clone();
    alice.on_error(move |e| sink.push(e.to_string()));
    join(&alice, port).await;

    drop(host);
    eventually("give up", || {
        errors.entries().iter().any(|e| e.contains("gave up reconnecting after 2"))
    })
    .await;
    assert_eq!(alice.state(), PeerState::Disconnected);
}
