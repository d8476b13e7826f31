//! Session state: peers, roles, the shared project, and OT integration.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use serde_json::Value;

use nois_engine::{SharedTransport, TransportState};
use nois_shared::ids::{EntityId, PeerId, SessionId};
use nois_shared::project::{Clip, Note, Project, Track};

use crate::clock::VectorClock;
use crate::error::CollabError;
use crate::history::OpHistory;
use crate::op::{OpDomain, Operation, OperationKind};
use crate::ot;
use crate::peer::{ConnectionState, Peer, PeerRole};
use crate::protocol::{
    now_ticks, operation_from_message, ErrorCode, Message, Payload, TransportWire,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Creating,
    Connecting,
    Active,
    Closed,
}

/// Typed notifications for observers (UI, tests). Pushed with `try_send`;
/// a full channel drops rather than blocking the control plane.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    PeerJoined(Peer),
    PeerLeft(PeerId),
    ChatReceived {
        from: PeerId,
        text: String,
    },
    CursorUpdated {
        from: PeerId,
        view_type: String,
        x: f64,
        y: f64,
    },
    OperationApplied(Operation),
    ConflictDetected {
        winner: Operation,
        loser: Operation,
    },
    TransportChanged(TransportState),
    ErrorSignal {
        code: ErrorCode,
        description: String,
    },
}

pub struct Session {
    pub id: SessionId,
    pub name: String,
    password: Option<String>,
    pub max_peers: usize,
    state: SessionState,
    local: Peer,
    host: Option<PeerId>,
    peers: HashMap<PeerId, Peer>,
    clock: VectorClock,
    history: OpHistory,
    pub project: Project,
    transport: Arc<SharedTransport>,
    events: Sender<SessionEvent>,
}

impl Session {
    /// Creates a session with the local peer as host.
    pub fn create(
        name: &str,
        local_name: &str,
        password: Option<String>,
        max_peers: usize,
        events: Sender<SessionEvent>,
    ) -> Self {
        let mut local = Peer::new(local_name, PeerRole::Host, [240, 160, 40]);
        local.state = ConnectionState::Connected;
        let mut session = Self {
            id: SessionId::new(),
            name: name.to_string(),
            password,
            max_peers: max_peers.max(1),
            state: SessionState::Inactive,
            host: Some(local.id),
            local,
            peers: HashMap::new(),
            clock: VectorClock::new(),
            history: OpHistory::with_default_cap(),
            project: Project::default(),
            transport: Arc::new(SharedTransport::new()),
            events,
        };
        session.set_state(SessionState::Creating);
        session.set_state(SessionState::Active);
        info!("session '{}' created by {}", session.name, session.local.id);
        session
    }

    /// Prepares a session for joining a remote host.
    pub fn join(
        local_name: &str,
        role: PeerRole,
        color: [u8; 3],
        events: Sender<SessionEvent>,
    ) -> Self {
        let mut local = Peer::new(local_name, role, color);
        local.state = ConnectionState::Connecting;
        let mut session = Self {
            id: SessionId::new(), // replaced by the server's id on sync
            name: String::new(),
            password: None,
            max_peers: usize::MAX,
            state: SessionState::Inactive,
            host: None,
            local,
            peers: HashMap::new(),
            clock: VectorClock::new(),
            history: OpHistory::with_default_cap(),
            project: Project::default(),
            transport: Arc::new(SharedTransport::new()),
            events,
        };
        session.set_state(SessionState::Connecting);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    pub fn local_peer_mut(&mut self) -> &mut Peer {
        &mut self.local
    }

    pub fn host(&self) -> Option<PeerId> {
        self.host
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn history(&self) -> &OpHistory {
        &self.history
    }

    pub fn transport(&self) -> Arc<SharedTransport> {
        Arc::clone(&self.transport)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len() + 1 // remote peers plus the local one
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    /// First successful frame exchange on the client side.
    pub fn activate(&mut self) {
        self.set_state(SessionState::Active);
    }

    pub fn close(&mut self) {
        self.peers.clear();
        self.set_state(SessionState::Closed);
    }

    /// Server-side join validation. On success the peer is registered.
    pub fn admit_peer(
        &mut self,
        id: PeerId,
        name: &str,
        role: PeerRole,
        color: [u8; 3],
        password: Option<&str>,
    ) -> Result<Peer, ErrorCode> {
        if self.state != SessionState::Active {
            return Err(ErrorCode::SessionNotFound);
        }
        if let Some(required) = &self.password {
            if password != Some(required.as_str()) {
                return Err(ErrorCode::InvalidPassword);
            }
        }
        if self.peer_count() >= self.max_peers {
            return Err(ErrorCode::SessionFull);
        }
        let mut peer = Peer::new(name, role, color);
        peer.id = id;
        peer.state = ConnectionState::Connected;
        peer.touch();
        self.peers.insert(peer.id, peer.clone());
        self.emit(SessionEvent::PeerJoined(peer.clone()));
        Ok(peer)
    }

    /// Removes a peer; closing the whole session when the host leaves.
    pub fn remove_peer(&mut self, id: PeerId) {
        if self.peers.remove(&id).is_some() {
            self.emit(SessionEvent::PeerLeft(id));
        }
        if self.host == Some(id) {
            info!("host {} left, closing session", id);
            self.close();
        }
    }

    /// Stamps and applies a local edit. Returns the operation ready to be
    /// framed and sent.
    pub fn submit_operation(&mut self, mut op: Operation) -> Result<Operation, CollabError> {
        if self.state != SessionState::Active {
            return Err(CollabError::SessionClosed);
        }
        if !self.local.role.can_edit() {
            return Err(CollabError::NotAuthorized);
        }
        self.clock.increment(self.local.id);
        op.author = self.local.id;
        op.clock = self.clock.clone();
        op.timestamp = now_ticks();
        op.applied = true;
        self.apply_operation(&op);
        self.history.push(op.clone());
        self.emit(SessionEvent::OperationApplied(op.clone()));
        Ok(op)
    }

    /// Integrates a remote operation: transforms it against concurrent
    /// history entries, applies the survivor, and records it.
    pub fn integrate_remote(&mut self, op: Operation) {
        let mut incoming = op;
        for applied in self.history.concurrent_with(&incoming) {
            if incoming.is_noop() {
                break;
            }
            let result = ot::transform(&applied, &incoming);
            incoming = result.b;
            if let Some(conflict) = result.conflict {
                debug!(
                    "conflict: winner {} loser {}",
                    conflict.winner.id, conflict.loser.id
                );
                self.emit(SessionEvent::ConflictDetected {
                    winner: conflict.winner,
                    loser: conflict.loser,
                });
            }
        }
        self.clock.merge(&incoming.clock);
        let mut survivor = incoming;
        survivor.applied = true;
        self.apply_operation(&survivor);
        self.history.push(survivor.clone());
        self.emit(SessionEvent::OperationApplied(survivor));
    }

    /// Routes a received wire message into session state.
    pub fn handle_message(&mut self, message: &Message) {
        if let Some(peer) = self.peers.get_mut(&message.peer_id) {
            peer.touch();
            peer.clock.merge(&message.vector_clock);
        }
        match &message.payload {
            Payload::NoteOperation { .. }
            | Payload::TrackOperation { .. }
            | Payload::ClipOperation { .. }
            | Payload::ParameterChange { .. } => {
                if let Some(op) = operation_from_message(message) {
                    self.integrate_remote(op);
                }
            }
            Payload::Chat { text, .. } => {
                self.emit(SessionEvent::ChatReceived {
                    from: message.peer_id,
                    text: text.clone(),
                });
            }
            Payload::Cursor {
                view_type, x, y, ..
            } => {
                self.emit(SessionEvent::CursorUpdated {
                    from: message.peer_id,
                    view_type: view_type.clone(),
                    x: *x,
                    y: *y,
                });
            }
            Payload::TransportSync {
                state,
                position_beats,
                tempo,
                time_sig,
                loop_enabled,
                loop_start,
                loop_end,
            } => {
                let snapshot = TransportState {
                    state: *state,
                    position_beats: *position_beats,
                    tempo: *tempo,
                    time_sig_numerator: time_sig.numerator,
                    time_sig_denominator: time_sig.denominator,
                    loop_enabled: *loop_enabled,
                    loop_start: *loop_start,
                    loop_end: *loop_end,
                };
                self.transport.store(snapshot);
                self.transport.mark_synced(message.timestamp);
                self.emit(SessionEvent::TransportChanged(snapshot));
            }
            Payload::SyncResponse {
                project_state,
                peers,
                transport,
            } => {
                self.id = message.session_id;
                if let Some(encoded) = project_state {
                    match Self::decode_project(encoded) {
                        Ok(project) => self.project = project,
                        Err(e) => warn!("undecodable project state: {e}"),
                    }
                }
                if let Some(list) = peers {
                    for peer in list {
                        if peer.id != self.local.id {
                            if peer.role == PeerRole::Host {
                                self.host = Some(peer.id);
                            }
                            self.peers.insert(peer.id, peer.clone());
                        }
                    }
                }
                if let Some(wire) = transport {
                    self.transport.store(TransportState::from(*wire));
                }
                self.local.state = ConnectionState::Connected;
                self.activate();
            }
            Payload::Error {
                error_code,
                error_description,
                ..
            } => {
                self.emit(SessionEvent::ErrorSignal {
                    code: *error_code,
                    description: error_description.clone(),
                });
            }
            _ => {}
        }
    }

    /// Builds an envelope stamped with the current clock.
    pub fn stamp(&self, payload: Payload) -> Message {
        Message::new(self.local.id, self.id, self.clock.clone(), payload)
    }

    pub fn encode_project(&self) -> Result<String, CollabError> {
        let bytes = bincode::serialize(&self.project)
            .map_err(|e| CollabError::Server {
                code: ErrorCode::InternalError,
                description: e.to_string(),
            })?;
        Ok(BASE64.encode(bytes))
    }

    pub fn decode_project(encoded: &str) -> Result<Project, CollabError> {
        let bytes = BASE64.decode(encoded).map_err(|e| CollabError::Server {
            code: ErrorCode::InvalidMessage,
            description: e.to_string(),
        })?;
        bincode::deserialize(&bytes).map_err(|e| CollabError::Server {
            code: ErrorCode::InvalidMessage,
            description: e.to_string(),
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.try_send(event);
    }

    // --- project application -------------------------------------------

    fn apply_operation(&mut self, op: &Operation) {
        if op.is_noop() {
            return;
        }
        match op.domain {
            OpDomain::Note => self.apply_note(op),
            OpDomain::Track => self.apply_track(op),
            OpDomain::Clip => self.apply_clip(op),
            OpDomain::Parameter => self.apply_parameter(op),
        }
    }

    fn apply_note(&mut self, op: &Operation) {
        let Some(note_id) = op.item else { return };
        match op.kind {
            OperationKind::Insert => {
                let Some(clip) = self.project.clip_mut(op.target) else {
                    warn!("note insert into unknown clip {}", op.target);
                    return;
                };
                let mut note = Note::new(
                    prop_f64(op, "startBeat").unwrap_or(0.0),
                    prop_f64(op, "duration").unwrap_or(1.0),
                    prop_u8(op, "noteNumber").unwrap_or(60),
                    prop_u8(op, "velocity").unwrap_or(100),
                );
                note.id = note_id;
                note.channel = prop_u8(op, "channel").unwrap_or(0);
                clip.notes.push(note);
            }
            OperationKind::Update | OperationKind::Move => {
                if let Some(note) = self.project.note_mut(note_id) {
                    if let Some(v) = prop_f64(op, "startBeat") {
                        note.start = v;
                    }
                    if let Some(v) = prop_f64(op, "duration") {
                        note.duration = v;
                    }
                    if let Some(v) = prop_u8(op, "noteNumber") {
                        note.key = v;
                    }
                    if let Some(v) = prop_u8(op, "velocity") {
                        note.velocity = v;
                    }
                    if let Some(v) = prop_u8(op, "channel") {
                        note.channel = v;
                    }
                }
            }
            OperationKind::Delete => {
                for track in &mut self.project.tracks {
                    for clip in &mut track.clips {
                        clip.notes.retain(|n| n.id != note_id);
                    }
                }
            }
            OperationKind::NoOp => {}
        }
    }

    fn apply_track(&mut self, op: &Operation) {
        match op.kind {
            OperationKind::Insert => {
                let mut track = Track {
                    id: op.target,
                    ..Track::default()
                };
                if let Some(name) = op.properties.get("name").and_then(Value::as_str) {
                    track.name = name.to_string();
                }
                let at = op
                    .position
                    .map(|p| (p.max(0) as usize).min(self.project.tracks.len()))
                    .unwrap_or(self.project.tracks.len());
                self.project.tracks.insert(at, track);
            }
            OperationKind::Update => {
                if let Some(track) = self.project.track_mut(op.target) {
                    if let Some(name) = op.properties.get("name").and_then(Value::as_str) {
                        track.name = name.to_string();
                    }
                    if let Some(v) = prop_f64(op, "volume") {
                        track.volume = v as f32;
                    }
                    if let Some(v) = prop_f64(op, "pan") {
                        track.pan = v as f32;
                    }
                }
            }
            OperationKind::Delete => {
                self.project.tracks.retain(|t| t.id != op.target);
            }
            OperationKind::Move | OperationKind::NoOp => {}
        }
    }

    fn apply_clip(&mut self, op: &Operation) {
        match op.kind {
            OperationKind::Insert => {
                let track_id = op
                    .properties
                    .get("trackId")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .map(EntityId);
                let Some(track) = track_id.and_then(|id| self.project.track_mut(id)) else {
                    warn!("clip insert into unknown track");
                    return;
                };
                let mut clip = Clip {
                    id: op.target,
                    ..Clip::default()
                };
                if let Some(v) = prop_f64(op, "startBeat") {
                    clip.start = v;
                }
                if let Some(v) = prop_f64(op, "length") {
                    clip.length = v;
                }
                track.clips.push(clip);
            }
            OperationKind::Update | OperationKind::Move => {
                if let Some(clip) = self.project.clip_mut(op.target) {
                    if let Some(v) = prop_f64(op, "startBeat") {
                        clip.start = v;
                    }
                    if let Some(v) = prop_f64(op, "length") {
                        clip.length = v;
                    }
                }
            }
            OperationKind::Delete => {
                for track in &mut self.project.tracks {
                    track.clips.retain(|c| c.id != op.target);
                }
            }
            OperationKind::NoOp => {}
        }
    }

    fn apply_parameter(&mut self, op: &Operation) {
        let Some(name) = op.parameter_name().map(str::to_string) else {
            return;
        };
        let Some(value) = prop_f64(op, "value") else {
            return;
        };
        if let Some(track) = self.project.track_mut(op.target) {
            track.parameters.insert(name, value);
        }
    }
}

fn prop_f64(op: &Operation, key: &str) -> Option<f64> {
    op.properties.get(key).and_then(Value::as_f64)
}

fn prop_u8(op: &Operation, key: &str) -> Option<u8> {
    op.properties.get(key).and_then(Value::as_u64).map(|v| v as u8)
}
