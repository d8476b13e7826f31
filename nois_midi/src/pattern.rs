//! Pattern events: the in-memory form of a MIDI file track.

use serde::{Deserialize, Serialize};

/// Default resolution when a file declares SMPTE timing instead of PPQ.
pub const DEFAULT_PPQ: u16 = 96;
/// 120 BPM in microseconds per quarter note.
pub const DEFAULT_TEMPO: u32 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternEventKind {
    ChannelVoice,
    Meta,
    SysEx,
}

/// One event in a pattern, positioned by absolute and delta ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternEvent {
    /// Absolute position in ticks from the pattern start
    pub tick: u64,
    /// Ticks since the previous event
    pub delta: u32,
    pub kind: PatternEventKind,
    /// Channel for channel-voice events, 0 otherwise
    pub channel: u8,
    /// Status byte for channel voice, meta type for meta, 0xF0/0xF7 for SysEx
    pub status: u8,
    /// Data bytes following the status
    pub data: Vec<u8>,
}

/// A track's worth of time-sorted events plus the captured meta context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    /// Ticks per quarter note
    pub ppq: u16,
    /// Total length in ticks, set by EndOfTrack
    pub length_ticks: u64,
    /// Microseconds per quarter note, from SetTempo
    pub tempo: u32,
    pub time_sig_numerator: u8,
    pub time_sig_denominator: u8,
    pub events: Vec<PatternEvent>,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            name: String::new(),
            ppq: DEFAULT_PPQ,
            length_ticks: 0,
            tempo: DEFAULT_TEMPO,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            events: Vec::new(),
        }
    }
}

impl Pattern {
    /// Tempo in beats per minute.
    pub fn bpm(&self) -> f64 {
        60_000_000.0 / self.tempo as f64
    }

    /// Pattern length in beats.
    pub fn length_beats(&self) -> f64 {
        self.length_ticks as f64 / self.ppq as f64
    }
}

// Meta event types this engine captures.
pub const META_TRACK_NAME: u8 = 0x03;
pub const META_END_OF_TRACK: u8 = 0x2F;
pub const META_SET_TEMPO: u8 = 0x51;
pub const META_TIME_SIGNATURE: u8 = 0x58;
