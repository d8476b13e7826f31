//! Control-rate events flowing from MIDI ingest into the voice allocator.

use serde::{Deserialize, Serialize};

use crate::expression::NoteId;

/// Which expression dimension an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionKind {
    /// Per-note pitch bend, bipolar -1.0 to 1.0 of the zone bend range
    PitchBend,
    /// CC74, normalized 0.0-1.0
    Slide,
    /// Channel or poly pressure, normalized 0.0-1.0
    Pressure,
}

/// A classified note event, ready for voice allocation.
///
/// These are produced by the router at control rate and either applied
/// inline on the audio thread or marshaled across the SPSC event queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NoteEvent {
    NoteTriggered {
        id: NoteId,
        /// Normalized strike velocity, 0.0-1.0
        velocity: f32,
        /// Bend range in semitones inherited from the zone
        bend_range: f32,
    },
    NoteReleased {
        id: NoteId,
        /// Normalized lift velocity, 0.0-1.0
        velocity: f32,
    },
    Expression {
        id: NoteId,
        kind: ExpressionKind,
        value: f32,
    },
    /// Release every sounding voice.
    AllNotesOff,
}
