//! The session server: accepts connections, fans out frames, enforces
//! join policy, and evicts silent peers.
//!
//! One reader thread per connection plus a maintenance thread for
//! liveness. Writes go through a per-connection mutex so frames never
//! interleave. Sockets are owned by their connection record and closed
//! exactly once, when the record is dropped from the table.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use nois_shared::ids::PeerId;

use crate::error::CollabError;
use crate::framing::{read_frame, write_frame, BufferPool};
use crate::peer::PeerRole;
use crate::protocol::{
    now_ticks, ErrorCode, Message, Payload, PEER_TIMEOUT, PROTOCOL_VERSION,
};
use crate::session::{Session, SessionState};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub peer_timeout: Duration,
    pub maintenance_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peer_timeout: PEER_TIMEOUT,
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

struct Connection {
    id: u64,
    peer_id: Option<PeerId>,
    writer: Arc<Mutex<TcpStream>>,
    addr: SocketAddr,
    last_active: Instant,
}

type ConnTable = Arc<Mutex<HashMap<u64, Connection>>>;

/// Hosting side of a collaboration session.
pub struct CollabServer {
    session: Arc<Mutex<Session>>,
    connections: ConnTable,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl CollabServer {
    /// Binds and starts serving. Bind to port 0 for an ephemeral port.
    pub fn start(
        bind: &str,
        session: Arc<Mutex<Session>>,
        config: ServerConfig,
    ) -> Result<Self, CollabError> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("collab server listening on {local_addr}");

        let connections: ConnTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let next_id = Arc::new(AtomicU64::new(1));

        let accept_thread = {
            let connections = Arc::clone(&connections);
            let session = Arc::clone(&session);
            let shutdown = Arc::clone(&shutdown);
            let config = config.clone();
            thread::spawn(move || {
                accept_loop(listener, connections, session, next_id, shutdown, config)
            })
        };

        let maintenance_thread = {
            let connections = Arc::clone(&connections);
            let session = Arc::clone(&session);
            let shutdown = Arc::clone(&shutdown);
            let config = config.clone();
            thread::spawn(move || maintenance_loop(connections, session, shutdown, config))
        };

        Ok(Self {
            session,
            connections,
            local_addr,
            shutdown,
            threads: vec![accept_thread, maintenance_thread],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }

    /// Stops the server: cancels the loops, closes every socket, joins
    /// the threads with a bounded wait.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        {
            let mut table = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            for (_, conn) in table.drain() {
                let stream = conn.writer.lock().unwrap_or_else(|e| e.into_inner());
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    connections: ConnTable,
    session: Arc<Mutex<Session>>,
    next_id: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    config: ServerConfig,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                debug!("connection {id} accepted from {addr}");
                if stream.set_nodelay(true).is_err() {
                    continue;
                }
                // The listener is nonblocking; the per-connection stream
                // must not be.
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_read_timeout(Some(config.peer_timeout));
                let writer = match stream.try_clone() {
                    Ok(w) => Arc::new(Mutex::new(w)),
                    Err(e) => {
                        warn!("could not clone stream for {addr}: {e}");
                        continue;
                    }
                };
                connections
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        id,
                        Connection {
                            id,
                            peer_id: None,
                            writer,
                            addr,
                            last_active: Instant::now(),
                        },
                    );
                let connections = Arc::clone(&connections);
                let session = Arc::clone(&session);
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || {
                    read_loop(id, stream, connections, session, shutdown);
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_loop(
    conn_id: u64,
    mut stream: TcpStream,
    connections: ConnTable,
    session: Arc<Mutex<Session>>,
    shutdown: Arc<AtomicBool>,
) {
    let pool = BufferPool::new();
    let mut close_reason: Option<String> = None;

    while !shutdown.load(Ordering::SeqCst) {
        let frame = match read_frame(&mut stream, &pool) {
            Ok(frame) => frame,
            Err(CollabError::Framing(len)) => {
                warn!("connection {conn_id}: bad frame length {len}, closing");
                close_reason = Some(format!("framing error ({len})"));
                break;
            }
            Err(CollabError::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                // Read timeout; eviction is the maintenance loop's call.
                continue;
            }
            Err(e) => {
                debug!("connection {conn_id} closed: {e}");
                break;
            }
        };

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("connection {conn_id}: undecodable frame: {e}");
                close_reason = Some("invalid message".into());
                break;
            }
        };
        pool.release(frame);

        touch(&connections, conn_id);

        if message.version != PROTOCOL_VERSION {
            let reply = stamp_error(
                &session,
                ErrorCode::VersionMismatch,
                &format!("server speaks version {PROTOCOL_VERSION}"),
                Some(message.message_id),
            );
            send_to(&connections, conn_id, &reply);
            close_reason = Some("version mismatch".into());
            break;
        }

        match &message.payload {
            Payload::Join {
                peer_name,
                role,
                color,
                password,
            } => {
                let admitted = session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .admit_peer(
                        message.peer_id,
                        peer_name,
                        *role,
                        *color,
                        password.as_deref(),
                    );
                match admitted {
                    Ok(_peer) => {
                        bind_peer(&connections, conn_id, message.peer_id);
                        let sync = {
                            let session = session.lock().unwrap_or_else(|e| e.into_inner());
                            let mut peers: Vec<_> = session.peers().cloned().collect();
                            peers.push(session.local_peer().clone());
                            let transport = session.transport().load().into();
                            session.stamp(Payload::SyncResponse {
                                project_state: session.encode_project().ok(),
                                peers: Some(peers),
                                transport: Some(transport),
                            })
                        };
                        send_to(&connections, conn_id, &sync);
                        broadcast(&connections, Some(conn_id), &message);
                        info!("peer {} joined as '{}'", message.peer_id, peer_name);
                    }
                    Err(code) => {
                        let reply = stamp_error(
                            &session,
                            code,
                            "join rejected",
                            Some(message.message_id),
                        );
                        send_to(&connections, conn_id, &reply);
                        close_reason = Some(format!("join rejected: {code:?}"));
                        break;
                    }
                }
            }
            Payload::Ping { sequence } => {
                let reply = {
                    let session = session.lock().unwrap_or_else(|e| e.into_inner());
                    session.stamp(Payload::Pong {
                        sequence: *sequence,
                        server_timestamp: now_ticks(),
                    })
                };
                send_to(&connections, conn_id, &reply);
            }
            Payload::Leave { .. } => {
                debug!("peer {} left", message.peer_id);
                break;
            }
            Payload::SyncRequest {
                include_project_data,
            } => {
                let reply = {
                    let session = session.lock().unwrap_or_else(|e| e.into_inner());
                    let mut peers: Vec<_> = session.peers().cloned().collect();
                    peers.push(session.local_peer().clone());
                    session.stamp(Payload::SyncResponse {
                        project_state: include_project_data
                            .then(|| session.encode_project().ok())
                            .flatten(),
                        peers: Some(peers),
                        transport: Some(session.transport().load().into()),
                    })
                };
                send_to(&connections, conn_id, &reply);
            }
            _ => {
                // Viewer writes are refused at the session boundary.
                let writer_role = session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .peer(message.peer_id)
                    .map(|p| p.role);
                let is_edit = matches!(
                    message.payload,
                    Payload::NoteOperation { .. }
                        | Payload::TrackOperation { .. }
                        | Payload::ClipOperation { .. }
                        | Payload::ParameterChange { .. }
                );
                if is_edit && writer_role == Some(PeerRole::Viewer) {
                    let reply = stamp_error(
                        &session,
                        ErrorCode::NotAuthorized,
                        "viewers cannot edit",
                        Some(message.message_id),
                    );
                    send_to(&connections, conn_id, &reply);
                    continue;
                }
                session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handle_message(&message);
                broadcast(&connections, Some(conn_id), &message);
            }
        }
    }

    drop_connection(&connections, &session, conn_id, close_reason.as_deref());
}

fn maintenance_loop(
    connections: ConnTable,
    session: Arc<Mutex<Session>>,
    shutdown: Arc<AtomicBool>,
    config: ServerConfig,
) {
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(config.maintenance_interval);
        let expired: Vec<u64> = {
            let table = connections.lock().unwrap_or_else(|e| e.into_inner());
            table
                .values()
                .filter(|c| c.last_active.elapsed() > config.peer_timeout)
                .map(|c| c.id)
                .collect()
        };
        for id in expired {
            info!("connection {id} timed out, evicting");
            drop_connection(&connections, &session, id, Some("peer timeout"));
        }
        if session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state()
            == SessionState::Closed
        {
            // Host is gone; nothing left to serve.
            let mut table = connections.lock().unwrap_or_else(|e| e.into_inner());
            for (_, conn) in table.drain() {
                let stream = conn.writer.lock().unwrap_or_else(|e| e.into_inner());
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Removes a connection, tells the session, and announces the departure.
/// Safe to call twice; only the first removal acts.
fn drop_connection(
    connections: &ConnTable,
    session: &Arc<Mutex<Session>>,
    conn_id: u64,
    reason: Option<&str>,
) {
    let removed = connections
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&conn_id);
    let Some(conn) = removed else { return };
    {
        let stream = conn.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _ = stream.shutdown(Shutdown::Both);
    }
    debug!("connection {} from {} dropped", conn.id, conn.addr);
    if let Some(peer_id) = conn.peer_id {
        let leave = {
            let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
            session.remove_peer(peer_id);
            let mut message = session.stamp(Payload::Leave {
                reason: reason.map(str::to_string),
            });
            message.peer_id = peer_id;
            message
        };
        broadcast(connections, None, &leave);
    }
}

fn touch(connections: &ConnTable, conn_id: u64) {
    if let Some(conn) = connections
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get_mut(&conn_id)
    {
        conn.last_active = Instant::now();
    }
}

fn bind_peer(connections: &ConnTable, conn_id: u64, peer: PeerId) {
    if let Some(conn) = connections
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get_mut(&conn_id)
    {
        conn.peer_id = Some(peer);
    }
}

fn send_to(connections: &ConnTable, conn_id: u64, message: &Message) {
    // Take the writer handle out of the table before doing I/O; the table
    // lock must not be held across a socket write.
    let writer = connections
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&conn_id)
        .map(|c| Arc::clone(&c.writer));
    if let Some(writer) = writer {
        if let Err(e) = send_on(&writer, message) {
            warn!("send to connection {conn_id} failed: {e}");
        }
    }
}

/// Sends to every joined connection except `skip`.
fn broadcast(connections: &ConnTable, skip: Option<u64>, message: &Message) {
    let writers: Vec<(u64, Arc<Mutex<TcpStream>>)> = {
        let table = connections.lock().unwrap_or_else(|e| e.into_inner());
        table
            .values()
            .filter(|c| Some(c.id) != skip && c.peer_id.is_some())
            .map(|c| (c.id, Arc::clone(&c.writer)))
            .collect()
    };
    for (id, writer) in writers {
        if let Err(e) = send_on(&writer, message) {
            warn!("broadcast to connection {id} failed: {e}");
        }
    }
}

fn send_on(writer: &Arc<Mutex<TcpStream>>, message: &Message) -> Result<(), CollabError> {
    let bytes = message.encode()?;
    let mut stream = writer.lock().unwrap_or_else(|e| e.into_inner());
    write_frame(&mut *stream, &bytes)
}

fn stamp_error(
    session: &Arc<Mutex<Session>>,
    code: ErrorCode,
    description: &str,
    related: Option<nois_shared::ids::MessageId>,
) -> Message {
    session
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .stamp(Payload::Error {
            error_code: code,
            error_description: description.to_string(),
            related_message_id: related,
        })
}
