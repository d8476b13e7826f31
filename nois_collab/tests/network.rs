//! Loopback tests for the framed transport, join flow, liveness and
//! connection lifecycle.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};

use nois_collab::client::{ClientConfig, ClientEvent, CollabClient};
use nois_collab::peer::{ConnectionState, PeerRole};
use nois_collab::protocol::Payload;
use nois_collab::server::{CollabServer, ServerConfig};
use nois_collab::session::{Session, SessionEvent, SessionState};

fn start_server(
    password: Option<&str>,
    max_peers: usize,
    config: ServerConfig,
) -> (CollabServer, Receiver<SessionEvent>) {
    let (tx, rx) = bounded(1024);
    let session = Session::create("loop", "host", password.map(str::to_string), max_peers, tx);
    let session = Arc::new(Mutex::new(session));
    let server = CollabServer::start("127.0.0.1:0", session, config).expect("bind");
    (server, rx)
}

fn start_client(
    addr: SocketAddr,
    config: ClientConfig,
) -> (CollabClient, Receiver<ClientEvent>, Receiver<SessionEvent>) {
    let (session_tx, session_rx) = bounded(1024);
    let name = config.peer_name.clone();
    let session = Session::join(&name, config.role, config.color, session_tx);
    let (client_tx, client_rx) = bounded(1024);
    let client = CollabClient::connect(addr, config, Arc::new(Mutex::new(session)), client_tx);
    (client, client_rx, session_rx)
}

fn wait_for<F: FnMut() -> bool>(mut predicate: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn quick_client_config(name: &str) -> ClientConfig {
    ClientConfig {
        peer_name: name.to_string(),
        ping_interval: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(20),
        connect_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    }
}

#[test]
fn join_syncs_session_and_connects() {
    let (server, server_events) = start_server(None, 8, ServerConfig::default());
    let (client, _events, _session_events) =
        start_client(server.local_addr(), quick_client_config("ada"));

    assert!(wait_for(
        || client.state() == ConnectionState::Connected,
        Duration::from_secs(5)
    ));
    let session = client.session();
    {
        let session = session.lock().unwrap();
        assert_eq!(session.state(), SessionState::Active);
        // The host peer arrived with the sync response.
        assert!(session.peers().any(|p| p.role == PeerRole::Host));
    }
    assert!(server_events
        .try_iter()
        .any(|e| matches!(e, SessionEvent::PeerJoined(_))));

    client.disconnect();
    server.shutdown();
}

#[test]
fn wrong_password_is_fatal_and_suppresses_reconnect() {
    let (server, _server_events) = start_server(Some("secret"), 8, ServerConfig::default());
    let mut config = quick_client_config("eve");
    config.password = Some("wrong".to_string());
    let (client, _events, session_events) = start_client(server.local_addr(), config);

    assert!(wait_for(
        || client.state() == ConnectionState::Failed,
        Duration::from_secs(5)
    ));
    // The error surfaced with its code before the state settled.
    assert!(session_events.try_iter().any(|e| matches!(
        e,
        SessionEvent::ErrorSignal {
            code: nois_collab::protocol::ErrorCode::InvalidPassword,
            ..
        }
    )));
    client.disconnect();
    server.shutdown();
}

#[test]
fn session_full_rejects_third_peer() {
    // Host plus one: capacity 2.
    let (server, _server_events) = start_server(None, 2, ServerConfig::default());
    let (first, _e1, _s1) = start_client(server.local_addr(), quick_client_config("one"));
    assert!(wait_for(
        || first.state() == ConnectionState::Connected,
        Duration::from_secs(5)
    ));

    let (second, _e2, _s2) = start_client(server.local_addr(), quick_client_config("two"));
    assert!(wait_for(
        || second.state() == ConnectionState::Failed,
        Duration::from_secs(5)
    ));
    // The admitted peer is untouched.
    assert_eq!(first.state(), ConnectionState::Connected);

    first.disconnect();
    second.disconnect();
    server.shutdown();
}

#[test]
fn reconnect_attempts_are_capped() {
    // Bind a port, then drop the listener so connects are refused.
    let unreachable = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (session_tx, _session_rx) = bounded(64);
    let session = Session::join("lost", PeerRole::Editor, [0; 3], session_tx);
    let (client_tx, client_rx) = bounded(64);
    let client = CollabClient::connect(
        unreachable,
        quick_client_config("lost"),
        Arc::new(Mutex::new(session)),
        client_tx,
    );

    assert!(wait_for(
        || client.state() == ConnectionState::Failed,
        Duration::from_secs(10)
    ));
    let states: Vec<ClientEvent> = client_rx.try_iter().collect();
    assert!(states.contains(&ClientEvent::StateChanged(ConnectionState::Connecting)));
    assert!(states.contains(&ClientEvent::StateChanged(ConnectionState::Reconnecting)));
    assert_eq!(
        states.last(),
        Some(&ClientEvent::StateChanged(ConnectionState::Failed))
    );
    client.disconnect();
}

#[test]
fn zero_length_frame_closes_only_that_connection() {
    let (server, _server_events) = start_server(None, 8, ServerConfig::default());
    let (good, _e, _s) = start_client(server.local_addr(), quick_client_config("good"));
    assert!(wait_for(
        || good.state() == ConnectionState::Connected,
        Duration::from_secs(5)
    ));

    // A raw connection that speaks garbage.
    let mut raw = TcpStream::connect(server.local_addr()).unwrap();
    raw.write_all(&0u32.to_be_bytes()).unwrap();
    raw.flush().unwrap();

    // Server drops the offender; the good client stays connected.
    assert!(wait_for(|| server.connection_count() == 1, Duration::from_secs(5)));
    assert_eq!(good.state(), ConnectionState::Connected);

    good.disconnect();
    server.shutdown();
}

#[test]
fn ping_pong_measures_latency() {
    let (server, _server_events) = start_server(None, 8, ServerConfig::default());
    let (client, _events, _session_events) =
        start_client(server.local_addr(), quick_client_config("pinger"));
    assert!(wait_for(
        || client.state() == ConnectionState::Connected,
        Duration::from_secs(5)
    ));
    assert!(wait_for(
        || client.latency_ms().is_some(),
        Duration::from_secs(5)
    ));
    // Loopback latency is tiny but non-negative.
    assert!(client.latency_ms().unwrap() >= 0.0);
    client.disconnect();
    server.shutdown();
}

#[test]
fn silent_peer_is_evicted_exactly_once() {
    let config = ServerConfig {
        peer_timeout: Duration::from_millis(300),
        maintenance_interval: Duration::from_millis(50),
    };
    let (server, server_events) = start_server(None, 8, config);

    // Join by hand, then go silent.
    let (session_tx, _session_rx) = bounded(64);
    let session = Session::join("sloth", PeerRole::Editor, [0; 3], session_tx);
    let join = session.stamp(Payload::Join {
        peer_name: "sloth".into(),
        role: PeerRole::Editor,
        color: [0; 3],
        password: None,
    });
    let mut raw = TcpStream::connect(server.local_addr()).unwrap();
    let bytes = join.encode().unwrap();
    raw.write_all(&(bytes.len() as u32).to_be_bytes()).unwrap();
    raw.write_all(&bytes).unwrap();
    raw.flush().unwrap();

    assert!(wait_for(
        || server_events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::PeerJoined(_))),
        Duration::from_secs(5)
    ));
    assert!(wait_for(|| server.connection_count() == 0, Duration::from_secs(5)));

    let departures = server_events
        .try_iter()
        .filter(|e| matches!(e, SessionEvent::PeerLeft(_)))
        .count();
    assert_eq!(departures, 1);
    server.shutdown();
}

#[test]
fn chat_is_relayed_to_other_peers() {
    let (server, _server_events) = start_server(None, 8, ServerConfig::default());
    let (alice, _ae, _as) = start_client(server.local_addr(), quick_client_config("alice"));
    let (bob, _be, bob_session_events) =
        start_client(server.local_addr(), quick_client_config("bob"));
    assert!(wait_for(
        || alice.state() == ConnectionState::Connected && bob.state() == ConnectionState::Connected,
        Duration::from_secs(5)
    ));

    alice
        .send(Payload::Chat {
            text: "four on the floor".to_string(),
            target_peer_id: None,
        })
        .unwrap();

    assert!(wait_for(
        || bob_session_events.try_iter().any(|e| matches!(
            e,
            SessionEvent::ChatReceived { ref text, .. } if text == "four on the floor"
        )),
        Duration::from_secs(5)
    ));

    alice.disconnect();
    bob.disconnect();
    server.shutdown();
}
