//! MIDI ingest and routing.
//!
//! Accepts MIDI 1.0 byte streams, MIDI 2.0 Universal MIDI Packets, and
//! standard MIDI files, and normalizes all of them into the event types the
//! voice allocator consumes. Also hosts the stream transformers: split
//! zones, chord memory, and MPE expression routing.

pub mod chords;
pub mod error;
pub mod message;
pub mod mpe;
pub mod parser;
pub mod pattern;
pub mod router;
pub mod smf;
pub mod splits;
pub mod ump;

pub use chords::{ChordMemory, ChordNote};
pub use error::FileError;
pub use message::MidiMessage;
pub use mpe::{MpeLayout, MpeZone, RpnTracker, ZoneRole};
pub use parser::Midi1Parser;
pub use pattern::{Pattern, PatternEvent, PatternEventKind};
pub use router::{MidiRouter, RouterConfig};
pub use smf::{SmfReader, SmfWriter};
pub use splits::{SplitOutput, SplitProcessor};
pub use ump::{UmpMessage, UmpPacket};
