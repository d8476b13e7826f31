//! Chord memory: expands single notes into stored voicings with strum.

use std::collections::HashMap;

use nois_shared::voicing::{ChordVoicing, StrumDirection};

/// One note of an expanded chord.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChordNote {
    pub note: u8,
    pub velocity: u8,
    /// Onset delay from the trigger, for strumming
    pub delay_ms: f32,
}

/// Maps incoming notes to chord voicings by pitch class.
pub struct ChordMemory {
    /// Pitch class (0-11) to voicing
    voicings: HashMap<u8, ChordVoicing>,
    /// Added to each voicing's default inversion
    pub global_inversion: i32,
    /// Notes emitted per sounding root, released together
    active: HashMap<u8, Vec<u8>>,
    alternate_up: bool,
    rng: fastrand::Rng,
}

impl Default for ChordMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChordMemory {
    pub fn new() -> Self {
        Self {
            voicings: HashMap::new(),
            global_inversion: 0,
            active: HashMap::new(),
            alternate_up: true,
            rng: fastrand::Rng::new(),
        }
    }

    /// Test hook: a deterministic RNG makes Random strums repeatable.
    pub fn with_seed(seed: u64) -> Self {
        let mut memory = Self::new();
        memory.rng = fastrand::Rng::with_seed(seed);
        memory
    }

    /// Binds a voicing to the pitch class of `note` (note mod 12).
    pub fn map_voicing(&mut self, note: u8, voicing: ChordVoicing) {
        self.voicings.insert(note % 12, voicing);
    }

    pub fn unmap(&mut self, note: u8) {
        self.voicings.remove(&(note % 12));
    }

    pub fn voicing_for(&self, note: u8) -> Option<&ChordVoicing> {
        self.voicings.get(&(note % 12))
    }

    /// Expands a NoteOn. Unmapped pitch classes pass the note through.
    pub fn note_on(&mut self, note: u8, velocity: u8) -> Vec<ChordNote> {
        let Some(voicing) = self.voicings.get(&(note % 12)).cloned() else {
            return vec![ChordNote {
                note,
                velocity,
                delay_ms: 0.0,
            }];
        };

        // Work on (interval, velocity scale) pairs so the scale follows
        // its interval through inversion.
        let mut intervals: Vec<(i16, f32)> = voicing
            .intervals
            .iter()
            .enumerate()
            .map(|(i, &interval)| (interval, voicing.scale_at(i)))
            .collect();
        if intervals.is_empty() {
            return Vec::new();
        }

        let inversions = voicing.default_inversion as i32 + self.global_inversion;
        for _ in 0..inversions.max(0) {
            // Each inversion wraps the current lowest interval up an octave.
            if let Some(lowest) = intervals
                .iter_mut()
                .min_by_key(|(interval, _)| *interval)
            {
                lowest.0 += 12;
            }
        }

        let mut notes: Vec<ChordNote> = intervals
            .iter()
            .filter_map(|&(interval, scale)| {
                let pitch = note as i32 + interval as i32;
                if !(0..=127).contains(&pitch) {
                    return None;
                }
                let scaled = (velocity as f32 * scale).round() as i32;
                Some(ChordNote {
                    note: pitch as u8,
                    velocity: scaled.clamp(1, 127) as u8,
                    delay_ms: 0.0,
                })
            })
            .collect();
        notes.sort_by_key(|n| n.note);

        self.assign_delays(&mut notes, voicing.strum, voicing.strum_ms);
        self.active
            .insert(note, notes.iter().map(|n| n.note).collect());
        notes
    }

    /// Notes to release when the root is released.
    pub fn note_off(&mut self, note: u8) -> Vec<u8> {
        self.active
            .remove(&note)
            .unwrap_or_else(|| vec![note])
    }

    fn assign_delays(&mut self, notes: &mut [ChordNote], strum: StrumDirection, strum_ms: f32) {
        let n = notes.len();
        if n < 2 || strum_ms <= 0.0 {
            return;
        }
        let step = strum_ms / (n - 1) as f32;
        match strum {
            StrumDirection::None => {}
            StrumDirection::Up => {
                for (i, cn) in notes.iter_mut().enumerate() {
                    cn.delay_ms = i as f32 * step;
                }
            }
            StrumDirection::Down => {
                for (i, cn) in notes.iter_mut().enumerate() {
                    cn.delay_ms = (n - 1 - i) as f32 * step;
                }
            }
            StrumDirection::Alternate => {
                let up = self.alternate_up;
                self.alternate_up = !self.alternate_up;
                for (i, cn) in notes.iter_mut().enumerate() {
                    let slot = if up { i } else { n - 1 - i };
                    cn.delay_ms = slot as f32 * step;
                }
            }
            StrumDirection::Random => {
                let mut slots: Vec<usize> = (0..n).collect();
                self.rng.shuffle(&mut slots);
                for (cn, slot) in notes.iter_mut().zip(slots) {
                    cn.delay_ms = slot as f32 * step;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nois_shared::voicing::ChordVoicing;

    fn major(strum: StrumDirection, strum_ms: f32) -> ChordVoicing {
        ChordVoicing {
            intervals: vec![0, 4, 7],
            strum,
            strum_ms,
            ..ChordVoicing::default()
        }
    }

    #[test]
    fn maps_by_pitch_class() {
        let mut memory = ChordMemory::new();
        memory.map_voicing(60, major(StrumDirection::None, 0.0));
        // C5 triggers the voicing mapped at C4: same pitch class.
        let notes = memory.note_on(72, 100);
        assert_eq!(
            notes.iter().map(|n| n.note).collect::<Vec<_>>(),
            vec![72, 76, 79]
        );
    }

    #[test]
    fn unmapped_note_passes_through() {
        let mut memory = ChordMemory::new();
        memory.map_voicing(60, major(StrumDirection::None, 0.0));
        let notes = memory.note_on(61, 100);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].note, 61);
    }

    #[test]
    fn up_strum_delays_are_even_in_note_order() {
        let mut memory = ChordMemory::new();
        memory.map_voicing(60, major(StrumDirection::Up, 100.0));
        let notes = memory.note_on(60, 100);
        let delays: Vec<f32> = notes.iter().map(|n| n.delay_ms).collect();
        assert_eq!(delays, vec![0.0, 50.0, 100.0]);
        // Ascending note order matches ascending delay.
        assert!(notes.windows(2).all(|w| w[0].note < w[1].note));
    }

    #[test]
    fn down_strum_reverses_delays() {
        let mut memory = ChordMemory::new();
        memory.map_voicing(60, major(StrumDirection::Down, 100.0));
        let notes = memory.note_on(60, 100);
        let delays: Vec<f32> = notes.iter().map(|n| n.delay_ms).collect();
        assert_eq!(delays, vec![100.0, 50.0, 0.0]);
    }

    #[test]
    fn alternate_strum_toggles() {
        let mut memory = ChordMemory::new();
        memory.map_voicing(60, major(StrumDirection::Alternate, 100.0));
        let first = memory.note_on(60, 100);
        memory.note_off(60);
        let second = memory.note_on(60, 100);
        assert_eq!(first[0].delay_ms, 0.0);
        assert_eq!(second[0].delay_ms, 100.0);
    }

    #[test]
    fn random_strum_permutes_same_delay_set() {
        let mut memory = ChordMemory::with_seed(7);
        memory.map_voicing(60, major(StrumDirection::Random, 100.0));
        let notes = memory.note_on(60, 100);
        let mut delays: Vec<f32> = notes.iter().map(|n| n.delay_ms).collect();
        delays.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(delays, vec![0.0, 50.0, 100.0]);
    }

    #[test]
    fn inversion_wraps_lowest_interval() {
        let mut memory = ChordMemory::new();
        let mut voicing = major(StrumDirection::None, 0.0);
        voicing.default_inversion = 1;
        memory.map_voicing(60, voicing);
        // First inversion of C major on 60: E G C -> 64, 67, 72
        let notes = memory.note_on(60, 100);
        assert_eq!(
            notes.iter().map(|n| n.note).collect::<Vec<_>>(),
            vec![64, 67, 72]
        );
    }

    #[test]
    fn velocity_scale_follows_interval_through_inversion() {
        let mut memory = ChordMemory::new();
        let mut voicing = major(StrumDirection::None, 0.0);
        voicing.velocity_scale = vec![1.0, 0.5, 1.0];
        voicing.default_inversion = 1;
        memory.map_voicing(60, voicing);
        let notes = memory.note_on(60, 100);
        // The third (interval 4 -> note 64) keeps its 0.5 multiplier.
        let third = notes.iter().find(|n| n.note == 64).unwrap();
        assert_eq!(third.velocity, 50);
    }

    #[test]
    fn note_off_returns_chord_notes() {
        let mut memory = ChordMemory::new();
        memory.map_voicing(60, major(StrumDirection::None, 0.0));
        memory.note_on(60, 100);
        let released = memory.note_off(60);
        assert_eq!(released, vec![60, 64, 67]);
    }

    #[test]
    fn global_inversion_adds_to_default() {
        let mut memory = ChordMemory::new();
        memory.map_voicing(60, major(StrumDirection::None, 0.0));
        memory.global_inversion = 2;
        // Second inversion: G C E -> 67, 72, 76
        let notes = memory.note_on(60, 100);
        assert_eq!(
            notes.iter().map(|n| n.note).collect::<Vec<_>>(),
            vec![67, 72, 76]
        );
    }
}
