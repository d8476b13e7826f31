//! The session client: dial, join, keep alive, reconnect.
//!
//! One control thread drives the connection state machine and owns the
//! read loop; a writer thread drains the outgoing queue and fires pings.
//! Fatal server errors disable auto-reconnect before surfacing.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};

use nois_shared::ids::MessageId;

use crate::error::CollabError;
use crate::framing::{read_frame, write_frame, BufferPool};
use crate::peer::{ConnectionState, LatencyWindow, PeerRole};
use crate::protocol::{
    now_ticks, Message, Payload, MAX_RECONNECT_ATTEMPTS, PEER_TIMEOUT, PING_INTERVAL,
    RECONNECT_DELAY,
};
use crate::session::Session;

/// How long an unacknowledged message keeps its pending slot.
const ACK_TIMEOUT_TICKS: i64 = 10 * 10_000_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_name: String,
    pub role: PeerRole,
    pub color: [u8; 3],
    pub password: Option<String>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_name: "peer".to_string(),
            role: PeerRole::Editor,
            color: [90, 140, 220],
            password: None,
            auto_reconnect: true,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            ping_interval: PING_INTERVAL,
            connect_timeout: Duration::from_secs(5),
            read_timeout: PEER_TIMEOUT,
        }
    }
}

/// Client-side connection notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
}

enum ConnectionEnd {
    /// Remote closed or I/O failed; reconnect may retry
    Lost,
    /// Fatal server error; never reconnect
    Fatal,
    /// Local shutdown requested
    Shutdown,
}

struct Shared {
    state: Mutex<ConnectionState>,
    latency: Mutex<LatencyWindow>,
    pings: Mutex<HashMap<u64, i64>>,
    pending_acks: Mutex<HashMap<MessageId, (Sender<Result<(), String>>, i64)>>,
    current: Mutex<Option<TcpStream>>,
    shutdown: AtomicBool,
    ping_seq: AtomicU64,
}

/// Connects to a session server and keeps the session synchronized.
pub struct CollabClient {
    shared: Arc<Shared>,
    outgoing: Sender<Message>,
    session: Arc<Mutex<Session>>,
    thread: Option<JoinHandle<()>>,
}

impl CollabClient {
    /// Starts the connection state machine in the background.
    pub fn connect(
        addr: SocketAddr,
        config: ClientConfig,
        session: Arc<Mutex<Session>>,
        events: Sender<ClientEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            latency: Mutex::new(LatencyWindow::new(LatencyWindow::DEFAULT_CAP)),
            pings: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            ping_seq: AtomicU64::new(0),
        });
        let (outgoing_tx, outgoing_rx) = bounded::<Message>(256);

        let thread = {
            let shared = Arc::clone(&shared);
            let session = Arc::clone(&session);
            thread::spawn(move || {
                run_state_machine(addr, config, session, shared, outgoing_rx, events)
            })
        };

        Self {
            shared,
            outgoing: outgoing_tx,
            session,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }

    /// Average one-way latency over the recent ping window.
    pub fn latency_ms(&self) -> Option<f64> {
        self.shared
            .latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .average_ms()
    }

    /// Stamps and queues a payload. Fails when the queue is full or the
    /// client is shut down.
    pub fn send(&self, payload: Payload) -> Result<MessageId, CollabError> {
        let message = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stamp(payload);
        let id = message.message_id;
        self.outgoing
            .try_send(message)
            .map_err(|_| CollabError::NotConnected)?;
        Ok(id)
    }

    /// Sends and hands back a slot that resolves on Acknowledge, or is
    /// dropped (cancelled) on teardown.
    pub fn send_with_ack(
        &self,
        payload: Payload,
    ) -> Result<Receiver<Result<(), String>>, CollabError> {
        let (tx, rx) = bounded(1);
        let message = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stamp(payload);
        self.shared
            .pending_acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message.message_id, (tx, now_ticks() + ACK_TIMEOUT_TICKS));
        self.outgoing
            .try_send(message)
            .map_err(|_| CollabError::NotConnected)?;
        Ok(rx)
    }

    /// Disconnects and joins the control thread. A Leave is queued first
    /// so the server can announce a clean departure.
    pub fn disconnect(mut self) {
        if self.state() == ConnectionState::Connected {
            let _ = self.send(Payload::Leave { reason: None });
            thread::sleep(Duration::from_millis(50));
        }
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(stream) = self
            .shared
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn set_state(
    shared: &Shared,
    events: &Sender<ClientEvent>,
    session: &Arc<Mutex<Session>>,
    next: ConnectionState,
) {
    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    if *state != next {
        debug!("client state {:?} -> {:?}", *state, next);
        *state = next;
        session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local_peer_mut()
            .state = next;
        let _ = events.try_send(ClientEvent::StateChanged(next));
    }
}

fn run_state_machine(
    addr: SocketAddr,
    config: ClientConfig,
    session: Arc<Mutex<Session>>,
    shared: Arc<Shared>,
    outgoing: Receiver<Message>,
    events: Sender<ClientEvent>,
) {
    let mut attempts: u32 = 0;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            set_state(&shared, &events, &session, ConnectionState::Disconnected);
            return;
        }
        let phase = if attempts == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        set_state(&shared, &events, &session, phase);

        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let _ = stream.set_read_timeout(Some(config.read_timeout));
                info!("connected to {addr}");
                attempts = 0;
                match run_connection(&config, &session, &shared, &outgoing, &events, stream) {
                    ConnectionEnd::Shutdown => {
                        set_state(&shared, &events, &session, ConnectionState::Disconnected);
                        return;
                    }
                    ConnectionEnd::Fatal => {
                        set_state(&shared, &events, &session, ConnectionState::Failed);
                        return;
                    }
                    ConnectionEnd::Lost => {}
                }
            }
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
            }
        }

        cancel_pending_acks(&shared);
        if !config.auto_reconnect {
            set_state(&shared, &events, &session, ConnectionState::Disconnected);
            return;
        }
        if attempts >= config.max_reconnect_attempts {
            warn!("reconnect attempts exhausted after {attempts} retries");
            set_state(&shared, &events, &session, ConnectionState::Failed);
            return;
        }
        attempts += 1;
        thread::sleep(config.reconnect_delay);
    }
}

fn run_connection(
    config: &ClientConfig,
    session: &Arc<Mutex<Session>>,
    shared: &Arc<Shared>,
    outgoing: &Receiver<Message>,
    events: &Sender<ClientEvent>,
    mut stream: TcpStream,
) -> ConnectionEnd {
    let writer = match stream.try_clone() {
        Ok(w) => Arc::new(Mutex::new(w)),
        Err(_) => return ConnectionEnd::Lost,
    };
    *shared.current.lock().unwrap_or_else(|e| e.into_inner()) =
        stream.try_clone().ok();

    // Handshake: Join is always the first frame.
    let join = session
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .stamp(Payload::Join {
            peer_name: config.peer_name.clone(),
            role: config.role,
            color: config.color,
            password: config.password.clone(),
        });
    if send_frame(&writer, &join).is_err() {
        return ConnectionEnd::Lost;
    }

    // Writer thread: outgoing queue plus the periodic ping.
    let writer_alive = Arc::new(AtomicBool::new(true));
    let writer_thread = {
        let writer = Arc::clone(&writer);
        let shared = Arc::clone(shared);
        let session = Arc::clone(session);
        let outgoing = outgoing.clone();
        let alive = Arc::clone(&writer_alive);
        let ping_interval = config.ping_interval;
        thread::spawn(move || {
            let ticker = crossbeam_channel::tick(ping_interval);
            while alive.load(Ordering::SeqCst) && !shared.shutdown.load(Ordering::SeqCst) {
                crossbeam_channel::select! {
                    recv(outgoing) -> message => {
                        let Ok(message) = message else { break };
                        if send_frame(&writer, &message).is_err() {
                            break;
                        }
                    }
                    recv(ticker) -> _ => {
                        let sequence = shared.ping_seq.fetch_add(1, Ordering::SeqCst) + 1;
                        shared
                            .pings
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(sequence, now_ticks());
                        let ping = session
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .stamp(Payload::Ping { sequence });
                        if send_frame(&writer, &ping).is_err() {
                            break;
                        }
                    }
                    default(Duration::from_millis(100)) => {
                        expire_pending_acks(&shared);
                    }
                }
            }
        })
    };

    let end = read_until_closed(session, shared, events, &mut stream);

    writer_alive.store(false, Ordering::SeqCst);
    {
        let stream = writer.lock().unwrap_or_else(|e| e.into_inner());
        let _ = stream.shutdown(Shutdown::Both);
    }
    let _ = writer_thread.join();
    *shared.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    end
}

fn read_until_closed(
    session: &Arc<Mutex<Session>>,
    shared: &Arc<Shared>,
    events: &Sender<ClientEvent>,
    stream: &mut TcpStream,
) -> ConnectionEnd {
    let pool = BufferPool::new();
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return ConnectionEnd::Shutdown;
        }
        let frame = match read_frame(stream, &pool) {
            Ok(frame) => frame,
            Err(CollabError::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                // Server silent past the read timeout: treat as lost.
                warn!("server silent past read timeout");
                return ConnectionEnd::Lost;
            }
            Err(e) => {
                debug!("connection ended: {e}");
                return if shared.shutdown.load(Ordering::SeqCst) {
                    ConnectionEnd::Shutdown
                } else {
                    ConnectionEnd::Lost
                };
            }
        };
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable frame from server: {e}");
                return ConnectionEnd::Lost;
            }
        };
        pool.release(frame);

        match &message.payload {
            Payload::Pong { sequence, .. } => {
                let sent = shared
                    .pings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(sequence);
                if let Some(sent) = sent {
                    // Round trip over two, in milliseconds from 100-ns ticks.
                    let one_way_ms = (now_ticks() - sent) as f64 / 10_000.0 / 2.0;
                    shared
                        .latency
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(one_way_ms);
                }
            }
            Payload::Acknowledge {
                acknowledged_message_id,
                success,
                error_message,
            } => {
                let slot = shared
                    .pending_acks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(acknowledged_message_id);
                if let Some((slot, _)) = slot {
                    let result = if *success {
                        Ok(())
                    } else {
                        Err(error_message.clone().unwrap_or_default())
                    };
                    let _ = slot.try_send(result);
                }
            }
            Payload::Error { error_code, .. } => {
                session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle_message(&message);
                if error_code.is_fatal() {
                    warn!("fatal server error {error_code:?}, reconnect disabled");
                    return ConnectionEnd::Fatal;
                }
            }
            Payload::SyncResponse { .. } => {
                session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle_message(&message);
                set_state(shared, events, session, ConnectionState::Connected);
            }
            Payload::Leave { .. } => {
                let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
                session.remove_peer(message.peer_id);
                if session.state() == crate::session::SessionState::Closed {
                    // Host departure ends the session everywhere.
                    return ConnectionEnd::Fatal;
                }
            }
            _ => {
                session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle_message(&message);
            }
        }
    }
}

/// Frees pending-ack slots whose deadline passed, failing their waiters.
fn expire_pending_acks(shared: &Shared) {
    let now = now_ticks();
    let mut acks = shared
        .pending_acks
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    acks.retain(|_, (slot, deadline)| {
        if *deadline < now {
            let _ = slot.try_send(Err("acknowledgement timed out".to_string()));
            false
        } else {
            true
        }
    });
}

fn cancel_pending_acks(shared: &Shared) {
    // Dropping the senders cancels every waiting receiver.
    shared
        .pending_acks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
    shared.pings.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

fn send_frame(writer: &Arc<Mutex<TcpStream>>, message: &Message) -> Result<(), CollabError> {
    let bytes = message.encode()?;
    let mut stream = writer.lock().unwrap_or_else(|e| e.into_inner());
    write_frame(&mut *stream, &bytes)
}
