//! MIDI 2.0 Universal MIDI Packet parsing and MIDI-1 interchange scaling.
//!
//! Packets arrive as whole 32/64/128-bit words; the top nibble of the first
//! word selects the message group and fixes the word count. Unknown message
//! types are discarded without error, per the UMP spec.

use crate::message::MidiMessage;

/// A whole universal MIDI packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmpPacket {
    Word(u32),
    DWord(u64),
    QWord([u32; 4]),
}

impl UmpPacket {
    pub fn first_word(&self) -> u32 {
        match self {
            UmpPacket::Word(w) => *w,
            UmpPacket::DWord(d) => (*d >> 32) as u32,
            UmpPacket::QWord(q) => q[0],
        }
    }

    /// Message type: top nibble of the first word.
    pub fn message_type(&self) -> u8 {
        (self.first_word() >> 28) as u8
    }

    pub fn group(&self) -> u8 {
        ((self.first_word() >> 24) & 0x0F) as u8
    }

    /// Words a packet of the given message type occupies.
    pub fn words_for_type(mt: u8) -> usize {
        match mt {
            0x0..=0x2 | 0x6 | 0x7 => 1,
            0x3 | 0x4 | 0x8..=0xA => 2,
            0xB | 0xC => 3,
            _ => 4, // 0x5, 0xD, 0xE, 0xF
        }
    }
}

/// Per-note management option bits (MIDI 2.0 status 0xF).
pub const PNM_RESET: u8 = 0x01;
pub const PNM_DETACH: u8 = 0x02;

/// A decoded UMP message in the subset this engine routes.
#[derive(Debug, Clone, PartialEq)]
pub enum UmpMessage {
    /// MIDI 1.0 channel voice carried in a 32-bit packet (MT 0x2)
    Midi1 { group: u8, message: MidiMessage },
    /// System common / real time (MT 0x1)
    System { group: u8, message: MidiMessage },
    /// MIDI 2.0 channel voice (MT 0x4)
    Midi2(Midi2Message),
    /// SysEx7 payload chunk (MT 0x3); reassembly is left to the caller
    Data64 { group: u8, bytes: [u8; 6], len: u8 },
    /// SysEx8 / mixed data (MT 0x5)
    Data128 { group: u8, words: [u32; 4] },
    /// Utility (MT 0x0): NOOP and jitter-reduction timestamps
    Utility { group: u8, status: u8, data: u16 },
}

/// MIDI 2.0 channel-voice messages (MT 0x4, 64-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midi2Message {
    pub group: u8,
    pub channel: u8,
    pub kind: Midi2Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Midi2Kind {
    NoteOff {
        note: u8,
        velocity: u16,
        attribute_type: u8,
        attribute: u16,
    },
    NoteOn {
        note: u8,
        velocity: u16,
        attribute_type: u8,
        attribute: u16,
    },
    PolyPressure {
        note: u8,
        value: u32,
    },
    /// Registered (0x0) or assignable (0x1) per-note controller
    PerNoteController {
        note: u8,
        index: u8,
        value: u32,
    },
    RegisteredController {
        bank: u8,
        index: u8,
        value: u32,
    },
    AssignableController {
        bank: u8,
        index: u8,
        value: u32,
    },
    PerNotePitchBend {
        note: u8,
        value: u32,
    },
    ControlChange {
        index: u8,
        value: u32,
    },
    ProgramChange {
        program: u8,
        bank: Option<u16>,
    },
    ChannelPressure {
        value: u32,
    },
    PitchBend {
        value: u32,
    },
    PerNoteManagement {
        note: u8,
        flags: u8,
    },
}

/// Parses one whole packet. `None` means an unknown or unrouted message
/// type, discarded silently.
pub fn parse_packet(packet: UmpPacket) -> Option<UmpMessage> {
    let w0 = packet.first_word();
    let group = packet.group();
    match (packet.message_type(), packet) {
        (0x0, UmpPacket::Word(w)) => Some(UmpMessage::Utility {
            group,
            status: ((w >> 16) & 0xFF) as u8,
            data: (w & 0xFFFF) as u16,
        }),
        (0x1, UmpPacket::Word(w)) => parse_system(group, w),
        (0x2, UmpPacket::Word(w)) => parse_midi1_voice(group, w).map(|message| UmpMessage::Midi1 {
            group,
            message,
        }),
        (0x3, UmpPacket::DWord(d)) => {
            let len = ((w0 >> 16) & 0x0F).min(6) as u8;
            let mut bytes = [0u8; 6];
            let payload = ((w0 as u64 & 0xFFFF) << 32) | (d & 0xFFFF_FFFF);
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = ((payload >> (40 - i * 8)) & 0xFF) as u8;
            }
            Some(UmpMessage::Data64 { group, bytes, len })
        }
        (0x4, UmpPacket::DWord(d)) => parse_midi2_voice(group, d).map(UmpMessage::Midi2),
        (0x5, UmpPacket::QWord(q)) => Some(UmpMessage::Data128 { group, words: q }),
        _ => None, // Flex Data, UMP Stream, reserved types: discarded
    }
}

fn parse_system(group: u8, w: u32) -> Option<UmpMessage> {
    let status = ((w >> 16) & 0xFF) as u8;
    let d1 = ((w >> 8) & 0x7F) as u8;
    let d2 = (w & 0x7F) as u8;
    let message = match status {
        0xF1 => MidiMessage::MtcQuarterFrame(d1),
        0xF2 => MidiMessage::SongPosition(((d2 as u16) << 7) | d1 as u16),
        0xF3 => MidiMessage::SongSelect(d1),
        0xF6 => MidiMessage::TuneRequest,
        0xF8 => MidiMessage::TimingClock,
        0xFA => MidiMessage::Start,
        0xFB => MidiMessage::Continue,
        0xFC => MidiMessage::Stop,
        0xFE => MidiMessage::ActiveSensing,
        0xFF => MidiMessage::SystemReset,
        _ => return None,
    };
    Some(UmpMessage::System { group, message })
}

fn parse_midi1_voice(_group: u8, w: u32) -> Option<MidiMessage> {
    let status = ((w >> 20) & 0x0F) as u8;
    let channel = ((w >> 16) & 0x0F) as u8;
    let d1 = ((w >> 8) & 0x7F) as u8;
    let d2 = (w & 0x7F) as u8;
    Some(match status {
        0x8 => MidiMessage::NoteOff {
            channel,
            note: d1,
            velocity: d2,
        },
        0x9 => MidiMessage::NoteOn {
            channel,
            note: d1,
            velocity: d2,
        },
        0xA => MidiMessage::PolyPressure {
            channel,
            note: d1,
            pressure: d2,
        },
        0xB => MidiMessage::ControlChange {
            channel,
            controller: d1,
            value: d2,
        },
        0xC => MidiMessage::ProgramChange {
            channel,
            program: d1,
        },
        0xD => MidiMessage::ChannelPressure {
            channel,
            pressure: d1,
        },
        0xE => MidiMessage::PitchBend {
            channel,
            value: ((d2 as u16) << 7) | d1 as u16,
        },
        _ => return None,
    })
}

fn parse_midi2_voice(group: u8, d: u64) -> Option<Midi2Message> {
    let w0 = (d >> 32) as u32;
    let w1 = (d & 0xFFFF_FFFF) as u32;
    let status = ((w0 >> 20) & 0x0F) as u8;
    let channel = ((w0 >> 16) & 0x0F) as u8;
    let b2 = ((w0 >> 8) & 0xFF) as u8;
    let b3 = (w0 & 0xFF) as u8;
    let kind = match status {
        0x0 => Midi2Kind::PerNoteController {
            note: b2 & 0x7F,
            index: b3,
            value: w1,
        },
        0x1 => Midi2Kind::PerNoteController {
            note: b2 & 0x7F,
            index: b3,
            value: w1,
        },
        0x2 => Midi2Kind::RegisteredController {
            bank: b2 & 0x7F,
            index: b3 & 0x7F,
            value: w1,
        },
        0x3 => Midi2Kind::AssignableController {
            bank: b2 & 0x7F,
            index: b3 & 0x7F,
            value: w1,
        },
        0x6 => Midi2Kind::PerNotePitchBend {
            note: b2 & 0x7F,
            value: w1,
        },
        0x8 => Midi2Kind::NoteOff {
            note: b2 & 0x7F,
            velocity: (w1 >> 16) as u16,
            attribute_type: b3,
            attribute: (w1 & 0xFFFF) as u16,
        },
        0x9 => Midi2Kind::NoteOn {
            note: b2 & 0x7F,
            velocity: (w1 >> 16) as u16,
            attribute_type: b3,
            attribute: (w1 & 0xFFFF) as u16,
        },
        0xA => Midi2Kind::PolyPressure {
            note: b2 & 0x7F,
            value: w1,
        },
        0xB => Midi2Kind::ControlChange {
            index: b2 & 0x7F,
            value: w1,
        },
        0xC => {
            let bank_valid = w1 & 0x1 != 0;
            Midi2Kind::ProgramChange {
                program: ((w1 >> 24) & 0x7F) as u8,
                bank: bank_valid
                    .then(|| (((w1 >> 8) & 0x7F) << 7 | (w1 & 0x7F)) as u16),
            }
        }
        0xD => Midi2Kind::ChannelPressure { value: w1 },
        0xE => Midi2Kind::PitchBend { value: w1 },
        0xF => Midi2Kind::PerNoteManagement {
            note: b2 & 0x7F,
            flags: b3,
        },
        _ => return None,
    };
    Some(Midi2Message {
        group,
        channel,
        kind,
    })
}

// --- MIDI-1 <-> MIDI-2 scaling ------------------------------------------
// Widening conversions are exact; narrowing truncates low bits.

pub fn velocity_7_to_16(v: u8) -> u16 {
    (v as u16) << 9
}

pub fn velocity_16_to_7(v: u16) -> u8 {
    (v >> 9) as u8
}

pub fn controller_7_to_32(v: u8) -> u32 {
    (v as u32) << 25
}

pub fn controller_32_to_7(v: u32) -> u8 {
    (v >> 25) as u8
}

/// 14-bit bend `(MSB << 7) | LSB` widened to 32 bits.
pub fn bend_14_to_32(v: u16) -> u32 {
    (v as u32) << 18
}

pub fn bend_32_to_14(v: u32) -> u16 {
    (v >> 18) as u16
}

/// 32-bit unsigned value (center 0x8000_0000) to bipolar -1.0 to 1.0.
pub fn unipolar_32_to_bipolar(v: u32) -> f32 {
    ((v as f64 - 0x8000_0000u32 as f64) / 0x8000_0000u32 as f64) as f32
}

/// 32-bit unsigned value to normalized 0.0-1.0.
pub fn normalized_32(v: u32) -> f32 {
    (v as f64 / u32::MAX as f64) as f32
}

/// 16-bit velocity to normalized 0.0-1.0.
pub fn normalized_16(v: u16) -> f32 {
    v as f32 / u16::MAX as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_scaling_roundtrip() {
        // vel 100 << 9 = 51200, and back
        assert_eq!(velocity_7_to_16(100), 51200);
        assert_eq!(velocity_16_to_7(51200), 100);
        for v in 0..128u8 {
            assert_eq!(velocity_16_to_7(velocity_7_to_16(v)), v);
        }
    }

    #[test]
    fn controller_scaling_roundtrip() {
        for v in 0..128u8 {
            assert_eq!(controller_32_to_7(controller_7_to_32(v)), v);
        }
    }

    #[test]
    fn bend_widening() {
        assert_eq!(bend_14_to_32(0x2000), 0x2000 << 18);
        assert_eq!(bend_32_to_14(bend_14_to_32(0x1234)), 0x1234);
    }

    #[test]
    fn word_counts_match_message_type() {
        for (mt, words) in [
            (0x0u8, 1usize),
            (0x1, 1),
            (0x2, 1),
            (0x3, 2),
            (0x4, 2),
            (0x5, 4),
            (0xD, 4),
            (0xF, 4),
        ] {
            assert_eq!(UmpPacket::words_for_type(mt), words);
        }
    }

    #[test]
    fn parses_midi1_note_on_packet() {
        // MT 2, group 0, 0x90 note 60 vel 100
        let w = 0x2090_3C64;
        let msg = parse_packet(UmpPacket::Word(w)).unwrap();
        assert_eq!(
            msg,
            UmpMessage::Midi1 {
                group: 0,
                message: MidiMessage::NoteOn {
                    channel: 0,
                    note: 60,
                    velocity: 100,
                },
            }
        );
    }

    #[test]
    fn parses_midi2_note_on_packet() {
        // MT 4, group 1, status 9 channel 2, note 60, vel 0xC800
        let w0: u32 = 0x4192_3C00;
        let w1: u32 = 0xC800_0000;
        let d = ((w0 as u64) << 32) | w1 as u64;
        match parse_packet(UmpPacket::DWord(d)).unwrap() {
            UmpMessage::Midi2(m) => {
                assert_eq!(m.group, 1);
                assert_eq!(m.channel, 2);
                assert_eq!(
                    m.kind,
                    Midi2Kind::NoteOn {
                        note: 60,
                        velocity: 0xC800,
                        attribute_type: 0,
                        attribute: 0,
                    }
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_types_discarded() {
        // Flex Data (0xD) is consumed but unrouted
        assert_eq!(parse_packet(UmpPacket::QWord([0xD000_0000, 0, 0, 0])), None);
        // Reserved 32-bit type
        assert_eq!(parse_packet(UmpPacket::Word(0x6000_0000)), None);
    }
}
