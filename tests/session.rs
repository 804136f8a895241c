//! End-to-end tests: a real aggregator on a socket in a temp dir, driven by
//! raw line-level peers and by `ClientEndpoint`.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use catpipe::auth::{AUTHORIZED, MAX_AUTH_LINE, NOT_AUTHORIZED};
use catpipe::net::{self, LineReader};
use catpipe::{
    Aggregator, CancellationScope, ClientConfig, ClientEndpoint, EndpointAddress, InboundMessage,
    IpcError, MessageQueue, ServerConfig,
};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

fn address_in(dir: &TempDir) -> EndpointAddress {
    EndpointAddress::from_path(dir.path().join("cat.sock")).unwrap()
}

fn start_server(dir: &TempDir) -> Aggregator {
    let mut aggregator = Aggregator::new(ServerConfig::new(address_in(dir)));
    aggregator.start().unwrap();
    aggregator
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(10));
    }
}

struct RawPeer {
    writer: UnixStream,
    reader: LineReader<UnixStream>,
}

impl RawPeer {
    fn connect(address: &EndpointAddress) -> Self {
        let stream = net::connect(address).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        Self {
            writer: stream.try_clone().unwrap(),
            reader: LineReader::new(stream),
        }
    }

    fn send(&mut self, line: &str) {
        net::write_line(&mut self.writer, line).unwrap();
    }

    fn recv(&mut self) -> String {
        self.reader.read_line().unwrap()
    }

    fn handshake(address: &EndpointAddress, line: &str) -> (Self, String) {
        let mut peer = Self::connect(address);
        peer.send(line);
        let reply = peer.recv();
        (peer, reply)
    }

    fn authorized(address: &EndpointAddress, peer_id: i64) -> Self {
        let (peer, reply) = Self::handshake(address, &format!("auth_{peer_id}"));
        assert_eq!(reply, AUTHORIZED);
        peer
    }
}

fn read(aggregator: &Aggregator) -> InboundMessage {
    aggregator
        .read_timeout(TIMEOUT)
        .unwrap()
        .expect("no message before timeout")
}

#[test]
fn round_trip_hello() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let mut peer = RawPeer::authorized(aggregator.address(), 42);
    peer.send("hello");
    assert_eq!(read(&aggregator), InboundMessage::new(42, "hello"));
}

#[test]
fn well_formed_handshakes_tag_messages_with_peer_id() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    for peer_id in [0_i64, 1, 7, 4_194_304, i64::MAX] {
        let mut peer = RawPeer::authorized(aggregator.address(), peer_id);
        peer.send(&format!("from {peer_id}"));
        let msg = read(&aggregator);
        assert_eq!(msg.peer_id, peer_id);
        assert_eq!(msg.text, format!("from {peer_id}"));
    }
}

#[test]
fn malformed_handshakes_are_rejected_and_silenced() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    for line in ["", "hello", "auth_", "auth_x1", "auth_-3", "AUTH_5"] {
        let (mut peer, reply) = RawPeer::handshake(aggregator.address(), line);
        assert_eq!(reply, NOT_AUTHORIZED, "line {line:?}");
        // the server hangs up after rejecting
        assert!(matches!(peer.reader.read_line(), Err(IpcError::StreamEnded)));
        let _ = net::write_line(&mut peer.writer, "sneaky");
    }
    let mut good = RawPeer::authorized(aggregator.address(), 9);
    good.send("marker");
    assert_eq!(read(&aggregator), InboundMessage::new(9, "marker"));
    assert!(aggregator.read_timeout(Duration::from_millis(100)).unwrap().is_none());
    assert_eq!(aggregator.connected_peers(), vec![9]);
}

#[test]
fn concurrent_peers_lose_and_duplicate_nothing() {
    const PEERS: i64 = 4;
    const LINES: usize = 25;

    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let peers: Vec<RawPeer> = (0..PEERS)
        .map(|id| RawPeer::authorized(aggregator.address(), id))
        .collect();

    let senders: Vec<_> = peers
        .into_iter()
        .enumerate()
        .map(|(id, mut peer)| {
            thread::spawn(move || {
                for n in 0..LINES {
                    peer.send(&format!("{id}-{n}"));
                }
                peer
            })
        })
        .collect();

    let mut seen: HashMap<String, i64> = HashMap::new();
    for _ in 0..(PEERS as usize * LINES) {
        let msg = read(&aggregator);
        assert!(seen.insert(msg.text.clone(), msg.peer_id).is_none(), "duplicate {}", msg.text);
    }
    for sender in senders {
        drop(sender.join().unwrap());
    }
    assert_eq!(seen.len(), PEERS as usize * LINES);
    for (text, peer_id) in &seen {
        assert!(text.starts_with(&format!("{peer_id}-")));
    }
    assert!(aggregator.read_timeout(Duration::from_millis(100)).unwrap().is_none());
}

#[test]
fn per_connection_order_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let mut peer = RawPeer::authorized(aggregator.address(), 3);
    for n in 0..50 {
        peer.send(&n.to_string());
    }
    for n in 0..50 {
        assert_eq!(read(&aggregator).text, n.to_string());
    }
}

#[test]
fn write_reaches_every_authorized_peer_once() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let mut peers: Vec<RawPeer> = (1..=3)
        .map(|id| RawPeer::authorized(aggregator.address(), id))
        .collect();
    wait_until(|| aggregator.connected_peers().len() == 3);

    assert_eq!(aggregator.write("news"), 3);
    for peer in &mut peers {
        assert_eq!(peer.recv(), "news");
        peer.reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(peer.reader.read_line().is_err(), "news delivered twice");
    }
}

#[test]
fn send_to_targets_one_peer() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let mut alice = RawPeer::authorized(aggregator.address(), 1);
    let mut bob = RawPeer::authorized(aggregator.address(), 2);
    wait_until(|| aggregator.connected_peers().len() == 2);

    assert_eq!(aggregator.send_to(2, "just bob"), 1);
    assert_eq!(bob.recv(), "just bob");
    alice
        .reader
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    assert!(alice.reader.read_line().is_err());
    assert_eq!(aggregator.send_to(99, "nobody"), 0);
}

#[test]
fn dispose_releases_blocked_reader() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = Arc::new(start_server(&dir));
    let _peer = RawPeer::authorized(aggregator.address(), 5);

    let (tx, rx) = mpsc::channel();
    let blocked = {
        let aggregator = aggregator.clone();
        thread::spawn(move || {
            let _ = tx.send(aggregator.read());
        })
    };
    thread::sleep(Duration::from_millis(50));
    aggregator.dispose();

    let result = rx.recv_timeout(TIMEOUT).expect("read still blocked after dispose");
    assert!(matches!(result, Err(IpcError::QueueClosed)));
    blocked.join().unwrap();
    assert!(matches!(aggregator.read(), Err(IpcError::QueueClosed)));
    assert!(aggregator.connected_peers().is_empty());
    aggregator.dispose();
}

#[test]
fn dispose_hangs_up_on_peers() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let mut peer = RawPeer::authorized(aggregator.address(), 8);
    wait_until(|| aggregator.connected_peers().len() == 1);
    aggregator.dispose();
    assert!(matches!(peer.reader.read_line(), Err(IpcError::StreamEnded)));
    assert!(!aggregator.address().socket_path().exists());
}

#[test]
fn disconnect_is_pruned_and_new_peer_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);

    let mut first = RawPeer::authorized(aggregator.address(), 1);
    first.send("a1");
    assert_eq!(read(&aggregator), InboundMessage::new(1, "a1"));
    drop(first);
    wait_until(|| aggregator.connected_peers().is_empty());

    let mut second = RawPeer::authorized(aggregator.address(), 2);
    second.send("b1");
    assert_eq!(read(&aggregator), InboundMessage::new(2, "b1"));
    assert_eq!(aggregator.write("only b"), 1);
    assert_eq!(second.recv(), "only b");
}

#[test]
fn silent_peer_does_not_stall_acceptor() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new(address_in(&dir))
        .with_handshake_timeout(Duration::from_millis(100));
    let mut aggregator = Aggregator::new(config);
    aggregator.start().unwrap();

    let mut silent = RawPeer::connect(aggregator.address());
    let mut talker = RawPeer::authorized(aggregator.address(), 11);
    talker.send("ok");
    assert_eq!(read(&aggregator), InboundMessage::new(11, "ok"));
    assert_eq!(silent.recv(), NOT_AUTHORIZED);
}

#[test]
fn trickling_peer_does_not_stall_acceptor() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new(address_in(&dir))
        .with_handshake_timeout(Duration::from_millis(300));
    let mut aggregator = Aggregator::new(config);
    aggregator.start().unwrap();

    let mut trickler = RawPeer::connect(aggregator.address());
    let trickle = thread::spawn(move || {
        // a byte every 100 ms, never a newline, for up to 4 s
        for _ in 0..40 {
            if trickler.writer.write_all(b"a").is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        trickler.reader.read_line()
    });

    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    let mut talker = RawPeer::authorized(aggregator.address(), 7);
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "acceptor held for {:?}",
        started.elapsed()
    );
    talker.send("through");
    assert_eq!(read(&aggregator), InboundMessage::new(7, "through"));
    assert_eq!(trickle.join().unwrap().unwrap(), NOT_AUTHORIZED);
}

#[test]
fn oversized_handshake_line_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let (_peer, reply) = RawPeer::handshake(
        aggregator.address(),
        &format!("auth_{}", "1".repeat(MAX_AUTH_LINE)),
    );
    assert_eq!(reply, NOT_AUTHORIZED);

    let mut good = RawPeer::authorized(aggregator.address(), 3);
    good.send("fine");
    assert_eq!(read(&aggregator), InboundMessage::new(3, "fine"));
}

#[test]
fn on_connect_pushes_snapshot_to_new_peer() {
    let dir = tempfile::tempdir().unwrap();
    let mut aggregator = Aggregator::builder(ServerConfig::new(address_in(&dir)))
        .on_connect(|conn| {
            conn.send(&format!("welcome {}", conn.peer_id())).unwrap();
        })
        .build();
    aggregator.start().unwrap();

    let mut peer = RawPeer::authorized(aggregator.address(), 21);
    assert_eq!(peer.recv(), "welcome 21");
}

#[test]
fn panicking_callback_stops_acceptor() {
    let dir = tempfile::tempdir().unwrap();
    let mut aggregator = Aggregator::builder(ServerConfig::new(address_in(&dir)))
        .on_connect(|_| panic!("snapshot failed"))
        .build();
    aggregator.start().unwrap();

    let mut peer = RawPeer::authorized(aggregator.address(), 4);
    wait_until(|| !aggregator.is_accepting());
    // the already authorized peer keeps working
    peer.send("still here");
    assert_eq!(read(&aggregator), InboundMessage::new(4, "still here"));
}

#[test]
fn client_endpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let scope = CancellationScope::new();
    let endpoint = ClientEndpoint::new(
        ClientConfig::new(aggregator.address().clone(), 7),
        scope.clone(),
    );

    let outbound = Arc::new(MessageQueue::<String>::new());
    let (inbound_tx, inbound_rx) = mpsc::channel();
    let client = {
        let outbound = outbound.clone();
        thread::spawn(move || {
            endpoint.start(&outbound, move |line| {
                let _ = inbound_tx.send(line);
            })
        })
    };

    outbound.push("hi".to_string()).unwrap();
    assert_eq!(read(&aggregator), InboundMessage::new(7, "hi"));

    wait_until(|| aggregator.connected_peers() == vec![7]);
    assert_eq!(aggregator.write("back"), 1);
    assert_eq!(inbound_rx.recv_timeout(TIMEOUT).unwrap(), "back");

    scope.cancel();
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = done_tx.send(client.join().unwrap());
    });
    assert!(done_rx.recv_timeout(TIMEOUT).expect("client did not stop").is_ok());
}

#[test]
fn client_session_ends_when_server_disposes() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let endpoint = ClientEndpoint::new(
        ClientConfig::new(aggregator.address().clone(), 12),
        CancellationScope::new(),
    );
    let session = endpoint.connect().unwrap();
    assert_eq!(session.peer_id(), 12);

    let outbound = Arc::new(MessageQueue::<String>::new());
    let (done_tx, done_rx) = mpsc::channel();
    {
        let outbound = outbound.clone();
        thread::spawn(move || {
            let _ = done_tx.send(session.run(&outbound, |_| {}));
        });
    }
    wait_until(|| aggregator.connected_peers() == vec![12]);
    aggregator.dispose();
    assert!(done_rx.recv_timeout(TIMEOUT).expect("session still running").is_ok());
    assert!(outbound.is_completed());
}

#[test]
fn completing_outbound_ends_client_session() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let endpoint = ClientEndpoint::new(
        ClientConfig::new(aggregator.address().clone(), 13),
        CancellationScope::new(),
    );
    let outbound = MessageQueue::<String>::new();
    outbound.push("last words".to_string()).unwrap();
    outbound.complete();
    endpoint.start(&outbound, |_| {}).unwrap();

    assert_eq!(read(&aggregator), InboundMessage::new(13, "last words"));
    wait_until(|| aggregator.connected_peers().is_empty());
}

#[test]
fn panicking_handler_still_ends_client_session() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let endpoint = ClientEndpoint::new(
        ClientConfig::new(aggregator.address().clone(), 14),
        CancellationScope::new(),
    );
    let outbound = Arc::new(MessageQueue::<String>::new());
    let (done_tx, done_rx) = mpsc::channel();
    {
        let outbound = outbound.clone();
        thread::spawn(move || {
            let _ = done_tx.send(endpoint.start(&outbound, |line| panic!("handler failed on {line}")));
        });
    }
    wait_until(|| aggregator.connected_peers() == vec![14]);
    assert_eq!(aggregator.write("boom"), 1);

    let result = done_rx.recv_timeout(TIMEOUT).expect("session still running");
    assert!(matches!(result, Err(IpcError::TransportFault(_))));
    assert!(outbound.is_completed());
    wait_until(|| aggregator.connected_peers().is_empty());
}

#[test]
fn client_waits_for_late_server() {
    let dir = tempfile::tempdir().unwrap();
    let address = address_in(&dir);
    let config = ClientConfig::new(address.clone(), 30)
        .with_connect_retry_interval(Duration::from_millis(20))
        .with_connect_timeout(TIMEOUT);
    let connecting = thread::spawn(move || {
        ClientEndpoint::new(config, CancellationScope::new())
            .connect()
            .map(|session| session.peer_id())
    });

    thread::sleep(Duration::from_millis(100));
    let mut aggregator = Aggregator::new(ServerConfig::new(address));
    aggregator.start().unwrap();
    assert_eq!(connecting.join().unwrap().unwrap(), 30);
}

#[test]
fn client_connect_is_cancellable() {
    let dir = tempfile::tempdir().unwrap();
    let scope = CancellationScope::new();
    let endpoint = ClientEndpoint::new(
        ClientConfig::new(address_in(&dir), 1)
            .with_connect_retry_interval(Duration::from_secs(30)),
        scope.clone(),
    );
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(endpoint.connect().map(|_| ()));
    });
    thread::sleep(Duration::from_millis(50));
    scope.cancel();
    let result = rx.recv_timeout(TIMEOUT).expect("connect not cancelled");
    assert!(matches!(result, Err(IpcError::Cancelled)));
}

#[test]
fn client_with_negative_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = start_server(&dir);
    let endpoint = ClientEndpoint::new(
        ClientConfig::new(aggregator.address().clone(), -5),
        CancellationScope::new(),
    );
    assert!(matches!(
        endpoint.connect(),
        Err(IpcError::HandshakeRejected { .. })
    ));
    assert!(aggregator.connected_peers().is_empty());
}

#[test]
fn second_server_on_same_address_fails() {
    let dir = tempfile::tempdir().unwrap();
    let _first = start_server(&dir);
    let mut second = Aggregator::new(ServerConfig::new(address_in(&dir)));
    assert!(matches!(second.start(), Err(IpcError::TransportFault(_))));
}
