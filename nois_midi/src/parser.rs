//! Streaming MIDI 1.0 byte parser with running-status support.

use crate::message::*;

/// Push parser for a raw MIDI 1.0 byte stream.
///
/// Feed bytes one at a time; a completed message is returned on the byte
/// that finishes it. Running status is honored for channel-voice messages
/// and cleared by system common and SysEx bytes. System real-time bytes
/// may interleave anywhere and do not disturb the parse state.
#[derive(Debug, Default)]
pub struct Midi1Parser {
    status: Option<u8>,
    channel: u8,
    d0: Option<u8>,
    sysex: Vec<u8>,
    in_sysex: bool,
}

impl Midi1Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Running status currently in effect, if any.
    pub fn running_status(&self) -> Option<u8> {
        self.status
    }

    /// Feeds a whole buffer, appending completed messages to `out`.
    ///
    /// Returns false when the buffer was empty (nothing to process).
    pub fn parse_bytes(&mut self, bytes: &[u8], out: &mut Vec<MidiMessage>) -> bool {
        if bytes.is_empty() {
            return false;
        }
        for &b in bytes {
            if let Some(msg) = self.parse(b) {
                out.push(msg);
            }
        }
        true
    }

    /// Feeds one byte, returning a message if this byte completed one.
    pub fn parse(&mut self, byte: u8) -> Option<MidiMessage> {
        if byte & 0x80 != 0 {
            if byte >= 0xF8 {
                self.parse_realtime(byte)
            } else if byte >= 0xF0 {
                self.parse_system(byte)
            } else {
                self.parse_status(byte);
                None
            }
        } else {
            self.parse_data(byte)
        }
    }

    fn parse_status(&mut self, byte: u8) {
        self.in_sysex = false;
        self.status = Some(byte & 0xF0);
        self.channel = byte & 0x0F;
        self.d0 = None;
    }

    fn parse_realtime(&mut self, byte: u8) -> Option<MidiMessage> {
        // Real-time bytes never touch running status or the data buffer.
        match byte {
            0xF8 => Some(MidiMessage::TimingClock),
            0xFA => Some(MidiMessage::Start),
            0xFB => Some(MidiMessage::Continue),
            0xFC => Some(MidiMessage::Stop),
            0xFE => Some(MidiMessage::ActiveSensing),
            0xFF => Some(MidiMessage::SystemReset),
            _ => None, // 0xF9 / 0xFD undefined
        }
    }

    fn parse_system(&mut self, byte: u8) -> Option<MidiMessage> {
        // System common clears running status.
        self.status = None;
        self.d0 = None;
        match byte {
            0xF0 => {
                self.in_sysex = true;
                self.sysex.clear();
                None
            }
            0xF7 => {
                if self.in_sysex {
                    self.in_sysex = false;
                    Some(MidiMessage::SystemExclusive(std::mem::take(&mut self.sysex)))
                } else {
                    None
                }
            }
            0xF1 => {
                self.in_sysex = false;
                self.status = Some(0xF1);
                None
            }
            0xF2 => {
                self.in_sysex = false;
                self.status = Some(0xF2);
                None
            }
            0xF3 => {
                self.in_sysex = false;
                self.status = Some(0xF3);
                None
            }
            0xF6 => {
                self.in_sysex = false;
                Some(MidiMessage::TuneRequest)
            }
            _ => None, // 0xF4 / 0xF5 undefined
        }
    }

    fn parse_data(&mut self, byte: u8) -> Option<MidiMessage> {
        if self.in_sysex {
            self.sysex.push(byte);
            return None;
        }
        let status = self.status?;
        let channel = self.channel;
        match status {
            STATUS_NOTE_OFF => match self.d0.take() {
                Some(note) => Some(MidiMessage::NoteOff {
                    channel,
                    note,
                    velocity: byte,
                }),
                None => {
                    self.d0 = Some(byte);
                    None
                }
            },
            STATUS_NOTE_ON => match self.d0.take() {
                Some(note) => Some(MidiMessage::NoteOn {
                    channel,
                    note,
                    velocity: byte,
                }),
                None => {
                    self.d0 = Some(byte);
                    None
                }
            },
            STATUS_POLY_PRESSURE => match self.d0.take() {
                Some(note) => Some(MidiMessage::PolyPressure {
                    channel,
                    note,
                    pressure: byte,
                }),
                None => {
                    self.d0 = Some(byte);
                    None
                }
            },
            STATUS_CONTROL_CHANGE => match self.d0.take() {
                Some(controller) => Some(MidiMessage::ControlChange {
                    channel,
                    controller,
                    value: byte,
                }),
                None => {
                    self.d0 = Some(byte);
                    None
                }
            },
            STATUS_PROGRAM_CHANGE => Some(MidiMessage::ProgramChange {
                channel,
                program: byte,
            }),
            STATUS_CHANNEL_PRESSURE => Some(MidiMessage::ChannelPressure {
                channel,
                pressure: byte,
            }),
            STATUS_PITCH_BEND => match self.d0.take() {
                Some(lsb) => Some(MidiMessage::PitchBend {
                    channel,
                    value: ((byte as u16) << 7) | (lsb as u16),
                }),
                None => {
                    self.d0 = Some(byte);
                    None
                }
            },
            0xF1 => {
                self.status = None;
                Some(MidiMessage::MtcQuarterFrame(byte))
            }
            0xF2 => match self.d0.take() {
                Some(lsb) => {
                    self.status = None;
                    Some(MidiMessage::SongPosition(((byte as u16) << 7) | (lsb as u16)))
                }
                None => {
                    self.d0 = Some(byte);
                    None
                }
            },
            0xF3 => {
                self.status = None;
                Some(MidiMessage::SongSelect(byte))
            }
            _ => None,
        }
    }
}
