//! Per-note expression state.
//!
//! Every sounding note owns one `NoteExpression` record from NoteOn until the
//! voice that played it finishes its release. The record carries the full MPE
//! expression set (strike, lift, slide, pressure, per-note pitch bend) in
//! normalized form, plus the lifecycle flags the voice allocator keys off.

use serde::{Deserialize, Serialize};

/// Default per-note pitch bend range in semitones (MPE convention).
pub const DEFAULT_BEND_RANGE: f32 = 48.0;

/// Identifies a note within one MPE zone or processor instance.
///
/// Derived as `channel * 128 + note`, so it is unique per (channel, note)
/// pair and cheap to use as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(pub u16);

impl NoteId {
    pub fn new(channel: u8, note: u8) -> Self {
        Self((channel as u16) * 128 + (note as u16))
    }

    pub fn channel(&self) -> u8 {
        (self.0 / 128) as u8
    }

    pub fn note(&self) -> u8 {
        (self.0 % 128) as u8
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel(), self.note())
    }
}

/// Expression state for one sounding note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteExpression {
    /// MIDI channel (0-15)
    pub channel: u8,
    /// MIDI note number (0-127)
    pub note: u8,
    /// Equal-tempered frequency of the note number, bend excluded
    pub base_frequency: f64,
    /// Note-on velocity, normalized 0.0-1.0
    pub strike: f32,
    /// Note-off velocity, normalized 0.0-1.0
    pub lift: f32,
    /// CC74 / per-note controller 74, normalized (0.5 = neutral)
    pub slide: f32,
    /// Channel or poly pressure, normalized 0.0-1.0
    pub pressure: f32,
    /// Current per-note bend in semitones, bounded by `bend_range`
    pub bend_semitones: f32,
    /// Bend range in semitones for this note's zone
    pub bend_range: f32,
    /// Microseconds since the Unix epoch of the last update
    pub last_updated_us: u64,
    pub active: bool,
    pub releasing: bool,
}

impl NoteExpression {
    pub fn new(channel: u8, note: u8, strike: f32) -> Self {
        Self {
            channel,
            note,
            base_frequency: note_to_frequency(note),
            strike,
            lift: 0.0,
            slide: 0.5,
            pressure: 0.0,
            bend_semitones: 0.0,
            bend_range: DEFAULT_BEND_RANGE,
            last_updated_us: now_us(),
            active: true,
            releasing: false,
        }
    }

    pub fn id(&self) -> NoteId {
        NoteId::new(self.channel, self.note)
    }

    /// Sounding frequency: base frequency shifted by the current bend.
    pub fn frequency(&self) -> f64 {
        self.base_frequency * 2f64.powf(self.bend_semitones as f64 / 12.0)
    }

    /// Sets the bend from a normalized bipolar value (-1.0 to 1.0).
    pub fn set_bend_normalized(&mut self, bend: f32) {
        self.bend_semitones = (bend * self.bend_range).clamp(-self.bend_range, self.bend_range);
        self.touch();
    }

    pub fn set_slide(&mut self, slide: f32) {
        self.slide = slide.clamp(0.0, 1.0);
        self.touch();
    }

    pub fn set_pressure(&mut self, pressure: f32) {
        self.pressure = pressure.clamp(0.0, 1.0);
        self.touch();
    }

    /// Marks the note released. The record stays alive until the owning
    /// voice reports envelope completion.
    pub fn release(&mut self, lift: f32) {
        self.lift = lift.clamp(0.0, 1.0);
        self.releasing = true;
        self.touch();
    }

    /// Returns per-note controllers to their neutral values.
    pub fn reset_controllers(&mut self) {
        self.slide = 0.5;
        self.pressure = 0.0;
        self.bend_semitones = 0.0;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_updated_us = now_us();
    }
}

/// `440 * 2^((note - 69) / 12)`
pub fn note_to_frequency(note: u8) -> f64 {
    440.0 * 2f64.powf((note as f64 - 69.0) / 12.0)
}

/// Microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_id_packs_channel_and_note() {
        let id = NoteId::new(2, 60);
        assert_eq!(id.0, 2 * 128 + 60);
        assert_eq!(id.channel(), 2);
        assert_eq!(id.note(), 60);
    }

    #[test]
    fn a4_is_440() {
        let e = NoteExpression::new(0, 69, 1.0);
        assert!((e.base_frequency - 440.0).abs() < 1e-9);
    }

    #[test]
    fn frequency_follows_bend() {
        let mut e = NoteExpression::new(0, 69, 1.0);
        e.bend_semitones = 12.0;
        let rel = (e.frequency() - 880.0).abs() / 880.0;
        assert!(rel < 1e-9);
    }

    #[test]
    fn bend_is_clamped_to_range() {
        let mut e = NoteExpression::new(0, 60, 1.0);
        e.bend_range = 2.0;
        e.set_bend_normalized(1.5);
        assert_eq!(e.bend_semitones, 2.0);
        e.set_bend_normalized(-1.5);
        assert_eq!(e.bend_semitones, -2.0);
    }

    #[test]
    fn release_keeps_record_active() {
        let mut e = NoteExpression::new(0, 60, 0.8);
        e.release(0.4);
        assert!(e.active);
        assert!(e.releasing);
        assert_eq!(e.lift, 0.4);
    }
}
