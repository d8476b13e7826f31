//! The normalized MIDI 1.0 message domain.

use serde::{Deserialize, Serialize};

// Channel voice status nibbles
pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_POLY_PRESSURE: u8 = 0xA0;
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;
pub const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const STATUS_CHANNEL_PRESSURE: u8 = 0xD0;
pub const STATUS_PITCH_BEND: u8 = 0xE0;

// Controllers with routing significance
pub const CC_BANK_SELECT: u8 = 0;
pub const CC_MOD_WHEEL: u8 = 1;
pub const CC_DATA_ENTRY_MSB: u8 = 6;
pub const CC_VOLUME: u8 = 7;
pub const CC_EXPRESSION: u8 = 11;
pub const CC_SUSTAIN: u8 = 64;
pub const CC_SLIDE: u8 = 74; // MPE "timbre"/"brightness" dimension
pub const CC_RPN_LSB: u8 = 100;
pub const CC_RPN_MSB: u8 = 101;
pub const CC_RESET_ALL_CONTROLLERS: u8 = 121;
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// Center value of a 14-bit pitch bend.
pub const BEND_CENTER: u16 = 0x2000;

/// A complete MIDI 1.0 message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit value, center 0x2000
    PitchBend { channel: u8, value: u16 },
    SystemExclusive(Vec<u8>),
    MtcQuarterFrame(u8),
    SongPosition(u16),
    SongSelect(u8),
    TuneRequest,
    TimingClock,
    Start,
    Continue,
    Stop,
    ActiveSensing,
    SystemReset,
}

impl MidiMessage {
    /// Channel of a channel-voice message, if it has one.
    pub fn channel(&self) -> Option<u8> {
        match self {
            MidiMessage::NoteOff { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::PolyPressure { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::ChannelPressure { channel, .. }
            | MidiMessage::PitchBend { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// Pitch bend as a bipolar -1.0 to 1.0 value.
    pub fn bend_normalized(value: u16) -> f32 {
        (value as f32 - BEND_CENTER as f32) / BEND_CENTER as f32
    }
}
