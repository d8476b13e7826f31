//! The collaboration wire protocol.
//!
//! Frames carry UTF-8 JSON with camelCase keys; enums serialize as
//! strings and absent optionals are omitted. Every message shares the
//! envelope fields; the `type` tag selects the payload.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use nois_engine::{TransportRunState, TransportState};
use nois_shared::ids::{EntityId, MessageId, OperationId, PeerId, SessionId};

use crate::clock::VectorClock;
use crate::op::{OpDomain, Operation, OperationKind};
use crate::peer::{Peer, PeerRole};

pub const DEFAULT_PORT: u16 = 22420;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PING_INTERVAL: Duration = Duration::from_secs(5);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Largest legal frame body.
pub const MAX_FRAME_BYTES: u32 = 10 * 1024 * 1024;

/// 100-ns ticks since the Unix epoch, the protocol's timestamp unit.
pub fn now_ticks() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    InvalidPassword,
    SessionFull,
    NotAuthorized,
    InvalidMessage,
    VersionMismatch,
    ConflictDetected,
    InternalError,
}

impl ErrorCode {
    /// Fatal codes suppress client auto-reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidPassword
                | ErrorCode::SessionFull
                | ErrorCode::NotAuthorized
                | ErrorCode::VersionMismatch
        )
    }
}

/// Transport snapshot as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSig {
    pub numerator: u16,
    pub denominator: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename_all = "camelCase")]
    Join {
        peer_name: String,
        role: PeerRole,
        color: [u8; 3],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Ping { sequence: u64 },
    #[serde(rename_all = "camelCase")]
    Pong {
        sequence: u64,
        server_timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    NoteOperation {
        action: OperationKind,
        operation_id: OperationId,
        pattern_id: EntityId,
        note_id: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note_number: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_beat: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        velocity: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_values: Option<HashMap<String, Value>>,
    },
    #[serde(rename_all = "camelCase")]
    TrackOperation {
        action: OperationKind,
        operation_id: OperationId,
        track_id: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_values: Option<HashMap<String, Value>>,
    },
    #[serde(rename_all = "camelCase")]
    ClipOperation {
        action: OperationKind,
        operation_id: OperationId,
        clip_id: EntityId,
        track_id: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_beat: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_values: Option<HashMap<String, Value>>,
    },
    #[serde(rename_all = "camelCase")]
    ParameterChange {
        operation_id: OperationId,
        target_id: EntityId,
        target_type: String,
        parameter_name: String,
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_value: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    TransportSync {
        state: TransportRunState,
        position_beats: f64,
        tempo: f64,
        time_sig: TimeSig,
        loop_enabled: bool,
        loop_start: f64,
        loop_end: f64,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
    },
    #[serde(rename_all = "camelCase")]
    Cursor {
        view_type: String,
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        track_id: Option<EntityId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection_start: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection_end: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Acknowledge {
        acknowledged_message_id: MessageId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SyncRequest { include_project_data: bool },
    #[serde(rename_all = "camelCase")]
    SyncResponse {
        /// Opaque project state: bincode, base64-encoded
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_state: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peers: Option<Vec<Peer>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<TransportWire>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_code: ErrorCode,
        error_description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        related_message_id: Option<MessageId>,
    },
}

/// Transport fields shared by TransportSync and SyncResponse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportWire {
    pub state: TransportRunState,
    pub position_beats: f64,
    pub tempo: f64,
    pub time_sig: TimeSig,
    pub loop_enabled: bool,
    pub loop_start: f64,
    pub loop_end: f64,
}

impl From<TransportState> for TransportWire {
    fn from(s: TransportState) -> Self {
        Self {
            state: s.state,
            position_beats: s.position_beats,
            tempo: s.tempo,
            time_sig: TimeSig {
                numerator: s.time_sig_numerator,
                denominator: s.time_sig_denominator,
            },
            loop_enabled: s.loop_enabled,
            loop_start: s.loop_start,
            loop_end: s.loop_end,
        }
    }
}

impl From<TransportWire> for TransportState {
    fn from(w: TransportWire) -> Self {
        Self {
            state: w.state,
            position_beats: w.position_beats,
            tempo: w.tempo,
            time_sig_numerator: w.time_sig.numerator,
            time_sig_denominator: w.time_sig.denominator,
            loop_enabled: w.loop_enabled,
            loop_start: w.loop_start,
            loop_end: w.loop_end,
        }
    }
}

/// Envelope common to every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: MessageId,
    pub peer_id: PeerId,
    /// 100-ns ticks
    pub timestamp: i64,
    pub session_id: SessionId,
    pub vector_clock: VectorClock,
    pub version: u32,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    pub fn new(peer_id: PeerId, session_id: SessionId, clock: VectorClock, payload: Payload) -> Self {
        Self {
            message_id: MessageId::new(),
            peer_id,
            timestamp: now_ticks(),
            session_id,
            vector_clock: clock,
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Wire payload for an edit operation.
pub fn payload_from_operation(op: &Operation) -> Payload {
    let get_f64 = |k: &str| op.properties.get(k).and_then(Value::as_f64);
    let get_u8 = |k: &str| {
        op.properties
            .get(k)
            .and_then(Value::as_u64)
            .map(|v| v as u8)
    };
    let previous = op
        .properties
        .get("previousValues")
        .and_then(Value::as_object)
        .map(|m| m.clone().into_iter().collect());
    match op.domain {
        OpDomain::Note => Payload::NoteOperation {
            action: op.kind,
            operation_id: op.id,
            pattern_id: op.target,
            note_id: op.item.unwrap_or_else(EntityId::nil),
            note_number: get_u8("noteNumber"),
            start_beat: get_f64("startBeat"),
            duration: get_f64("duration"),
            velocity: get_u8("velocity"),
            channel: get_u8("channel"),
            previous_values: previous,
        },
        OpDomain::Track => Payload::TrackOperation {
            action: op.kind,
            operation_id: op.id,
            track_id: op.target,
            name: op
                .properties
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            position: op.position,
            previous_values: previous,
        },
        OpDomain::Clip => Payload::ClipOperation {
            action: op.kind,
            operation_id: op.id,
            clip_id: op.target,
            track_id: op
                .properties
                .get("trackId")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .map(EntityId)
                .unwrap_or_else(EntityId::nil),
            start_beat: get_f64("startBeat"),
            length: get_f64("length"),
            previous_values: previous,
        },
        OpDomain::Parameter => Payload::ParameterChange {
            operation_id: op.id,
            target_id: op.target,
            target_type: op
                .properties
                .get("targetType")
                .and_then(Value::as_str)
                .unwrap_or("track")
                .to_string(),
            parameter_name: op.parameter_name().unwrap_or_default().to_string(),
            value: get_f64("value").unwrap_or(0.0),
            previous_value: get_f64("previousValue"),
        },
    }
}

/// Rebuilds an `Operation` from a received message, stamped with the
/// sender's envelope clock and timestamp.
pub fn operation_from_message(message: &Message) -> Option<Operation> {
    let mut op = match &message.payload {
        Payload::NoteOperation {
            action,
            operation_id,
            pattern_id,
            note_id,
            note_number,
            start_beat,
            duration,
            velocity,
            channel,
            previous_values,
        } => {
            let mut op = Operation::new(message.peer_id, *action, OpDomain::Note, *pattern_id)
                .with_item(*note_id);
            op.id = *operation_id;
            if let Some(v) = note_number {
                op.properties.insert("noteNumber".into(), json!(v));
            }
            if let Some(v) = start_beat {
                op.properties.insert("startBeat".into(), json!(v));
            }
            if let Some(v) = duration {
                op.properties.insert("duration".into(), json!(v));
            }
            if let Some(v) = velocity {
                op.properties.insert("velocity".into(), json!(v));
            }
            if let Some(v) = channel {
                op.properties.insert("channel".into(), json!(v));
            }
            if let Some(prev) = previous_values {
                op.properties.insert("previousValues".into(), json!(prev));
            }
            op
        }
        Payload::TrackOperation {
            action,
            operation_id,
            track_id,
            name,
            position,
            previous_values,
        } => {
            let mut op = Operation::new(message.peer_id, *action, OpDomain::Track, *track_id);
            op.id = *operation_id;
            op.position = *position;
            if let Some(v) = name {
                op.properties.insert("name".into(), json!(v));
            }
            if let Some(prev) = previous_values {
                op.properties.insert("previousValues".into(), json!(prev));
            }
            op
        }
        Payload::ClipOperation {
            action,
            operation_id,
            clip_id,
            track_id,
            start_beat,
            length,
            previous_values,
        } => {
            let mut op = Operation::new(message.peer_id, *action, OpDomain::Clip, *clip_id);
            op.id = *operation_id;
            op.properties
                .insert("trackId".into(), json!(track_id.to_string()));
            if let Some(v) = start_beat {
                op.properties.insert("startBeat".into(), json!(v));
            }
            if let Some(v) = length {
                op.properties.insert("length".into(), json!(v));
            }
            if let Some(prev) = previous_values {
                op.properties.insert("previousValues".into(), json!(prev));
            }
            op
        }
        Payload::ParameterChange {
            operation_id,
            target_id,
            target_type,
            parameter_name,
            value,
            previous_value,
        } => {
            let mut op = Operation::new(
                message.peer_id,
                OperationKind::Update,
                OpDomain::Parameter,
                *target_id,
            );
            op.id = *operation_id;
            op.properties
                .insert("targetType".into(), json!(target_type));
            op.properties
                .insert("parameterName".into(), json!(parameter_name));
            op.properties.insert("value".into(), json!(value));
            if let Some(v) = previous_value {
                op.properties.insert("previousValue".into(), json!(v));
            }
            op
        }
        _ => return None,
    };
    op.clock = message.vector_clock.clone();
    op.timestamp = message.timestamp;
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: Payload) -> Message {
        Message::new(PeerId::new(), SessionId::new(), VectorClock::new(), payload)
    }

    #[test]
    fn json_is_camel_case_with_string_enums() {
        let message = envelope(Payload::Join {
            peer_name: "ada".into(),
            role: PeerRole::Editor,
            color: [1, 2, 3],
            password: None,
        });
        let text = String::from_utf8(message.encode().unwrap()).unwrap();
        assert!(text.contains("\"type\":\"Join\""));
        assert!(text.contains("\"peerName\":\"ada\""));
        assert!(text.contains("\"Editor\""));
        assert!(text.contains("\"messageId\""));
        // Omitted optional leaves no null behind.
        assert!(!text.contains("password"));
        assert!(!text.contains("null"));
    }

    #[test]
    fn envelope_roundtrip() {
        let message = envelope(Payload::Ping { sequence: 42 });
        let bytes = message.encode().unwrap();
        let back = Message::decode(&bytes).unwrap();
        assert_eq!(message, back);
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let text = serde_json::to_string(&ErrorCode::InvalidPassword).unwrap();
        assert_eq!(text, "\"INVALID_PASSWORD\"");
        assert!(ErrorCode::InvalidPassword.is_fatal());
        assert!(!ErrorCode::InternalError.is_fatal());
    }

    #[test]
    fn note_operation_roundtrips_through_wire() {
        let author = PeerId::new();
        let pattern = EntityId::new();
        let note = EntityId::new();
        let mut op = Operation::new(author, OperationKind::Update, OpDomain::Note, pattern)
            .with_item(note);
        op.properties.insert("velocity".into(), json!(96));
        op.clock.increment(author);

        let mut message = envelope(payload_from_operation(&op));
        message.peer_id = author;
        message.vector_clock = op.clock.clone();
        message.timestamp = op.timestamp;

        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        let back = operation_from_message(&decoded).unwrap();
        assert_eq!(back.id, op.id);
        assert_eq!(back.kind, op.kind);
        assert_eq!(back.domain, op.domain);
        assert_eq!(back.target, op.target);
        assert_eq!(back.item, op.item);
        assert_eq!(back.properties.get("velocity"), Some(&json!(96)));
        assert_eq!(back.clock, op.clock);
    }

    #[test]
    fn transport_wire_roundtrip() {
        let state = TransportState {
            state: TransportRunState::Playing,
            position_beats: 16.0,
            tempo: 140.0,
            time_sig_numerator: 6,
            time_sig_denominator: 8,
            loop_enabled: true,
            loop_start: 0.0,
            loop_end: 8.0,
        };
        let wire: TransportWire = state.into();
        let back: TransportState = wire.into();
        assert_eq!(back, state);
    }
}
