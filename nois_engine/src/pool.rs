//! Fixed-size voice pool with stealing and O(1) expression routing.

use std::collections::HashMap;

use log::trace;

use nois_shared::events::ExpressionKind;
use nois_shared::expression::{NoteExpression, NoteId};

use crate::voice::{Voice, VoiceParams};

/// Allocates voices for incoming notes and routes expression updates to
/// the voice bound to each note.
///
/// Voice memory is allocated once at construction; note handling in
/// steady state reuses voices and never allocates beyond the binding map.
pub struct VoicePool {
    voices: Vec<Voice>,
    bindings: HashMap<NoteId, usize>,
    trigger_counter: u64,
}

impl VoicePool {
    pub fn new(voice_count: usize) -> Self {
        let voice_count = voice_count.max(1);
        Self {
            voices: vec![Voice::default(); voice_count],
            bindings: HashMap::with_capacity(voice_count),
            trigger_counter: 0,
        }
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn active_count(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }

    /// Voice currently bound to a note, if any.
    pub fn voice_for(&self, id: NoteId) -> Option<&Voice> {
        self.bindings.get(&id).map(|&i| &self.voices[i])
    }

    /// Triggers a note, stealing if the pool is exhausted.
    ///
    /// Selection order: an inactive voice, else the oldest releasing
    /// voice, else the oldest active voice.
    pub fn note_on(&mut self, expression: NoteExpression, params: VoiceParams) -> usize {
        let index = self.select_voice();
        let id = expression.id();

        // A stolen voice leaves its old note unbound: a later NoteOff for
        // that note is a no-op.
        if let Some(old) = self.voices[index].note_id() {
            self.bindings.remove(&old);
            trace!("voice {} stolen from {}", index, old);
        }

        self.trigger_counter += 1;
        self.voices[index].trigger(expression, params, self.trigger_counter);
        self.bindings.insert(id, index);
        index
    }

    fn select_voice(&self) -> usize {
        if let Some(i) = self.voices.iter().position(|v| !v.is_active()) {
            return i;
        }
        if let Some(i) = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_releasing())
            .min_by_key(|(_, v)| v.age())
            .map(|(i, _)| i)
        {
            return i;
        }
        self.voices
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.age())
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Releases the voice bound to `id`. Returns false when the note is
    /// not bound (already stolen or never triggered).
    pub fn note_off(&mut self, id: NoteId, lift: f32) -> bool {
        match self.bindings.remove(&id) {
            Some(index) => {
                self.voices[index].release(lift);
                true
            }
            None => false,
        }
    }

    /// Routes an expression update to the bound voice, O(1).
    pub fn update_expression(&mut self, id: NoteId, kind: ExpressionKind, value: f32) -> bool {
        match self.bindings.get(&id) {
            Some(&index) => {
                self.voices[index].update_expression(kind, value);
                true
            }
            None => false,
        }
    }

    /// Releases every active voice. Returns the notes that were released
    /// so the caller can emit NoteReleased events.
    pub fn all_notes_off(&mut self) -> Vec<NoteId> {
        let mut released = Vec::new();
        for voice in self.voices.iter_mut() {
            if voice.is_active() && !voice.is_releasing() {
                if let Some(id) = voice.note_id() {
                    released.push(id);
                }
                voice.release(0.5);
            }
        }
        self.bindings.clear();
        released
    }

    /// Hard stop: silences everything synchronously.
    pub fn reset(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.kill();
        }
        self.bindings.clear();
        self.trigger_counter = 0;
    }

    /// Advances every voice one sample. Voices whose envelope completed
    /// this sample are unbound and reported through `finished`.
    pub fn process(&mut self, dt: f32, mut finished: impl FnMut(NoteId)) {
        for voice in self.voices.iter_mut() {
            if !voice.is_active() {
                continue;
            }
            let id = voice.note_id();
            if !voice.process(dt) {
                if let Some(id) = id {
                    self.bindings.remove(&id);
                    finished(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 48_000.0;

    fn expr(channel: u8, note: u8) -> NoteExpression {
        NoteExpression::new(channel, note, 0.8)
    }

    #[test]
    fn inactive_voice_preferred() {
        let mut pool = VoicePool::new(2);
        let a = pool.note_on(expr(0, 60), VoiceParams::default());
        let b = pool.note_on(expr(0, 61), VoiceParams::default());
        assert_ne!(a, b);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn steals_oldest_active_when_full() {
        let mut pool = VoicePool::new(2);
        let a = pool.note_on(expr(0, 60), VoiceParams::default());
        pool.note_on(expr(0, 61), VoiceParams::default());
        let c = pool.note_on(expr(0, 62), VoiceParams::default());
        // A was oldest, so C landed on A's voice.
        assert_eq!(a, c);
        // NoteOff for the stolen note is now a no-op.
        assert!(!pool.note_off(NoteId::new(0, 60), 0.5));
        assert!(pool.note_off(NoteId::new(0, 62), 0.5));
    }

    #[test]
    fn prefers_releasing_over_active_steal() {
        let mut pool = VoicePool::new(2);
        pool.note_on(expr(0, 60), VoiceParams::default());
        let b = pool.note_on(expr(0, 61), VoiceParams::default());
        pool.note_off(NoteId::new(0, 61), 0.5);
        // Voice B is releasing; it is taken before stealing the older
        // but still-held A.
        let c = pool.note_on(expr(0, 62), VoiceParams::default());
        assert_eq!(b, c);
        assert!(pool.note_off(NoteId::new(0, 60), 0.5));
    }

    #[test]
    fn pool_never_exceeds_capacity() {
        let mut pool = VoicePool::new(4);
        for note in 0..16 {
            pool.note_on(expr(0, note), VoiceParams::default());
            assert!(pool.active_count() <= 4);
        }
        for note in 0..16 {
            pool.note_off(NoteId::new(0, note), 0.5);
        }
        // The four surviving bindings released; the rest were stolen.
        assert!(pool.voices().iter().all(|v| !v.is_active() || v.is_releasing()));
    }

    #[test]
    fn expression_routes_to_bound_voice() {
        let mut pool = VoicePool::new(4);
        pool.note_on(expr(0, 60), VoiceParams::default());
        pool.note_on(expr(0, 64), VoiceParams::default());
        assert!(pool.update_expression(
            NoteId::new(0, 60),
            ExpressionKind::PitchBend,
            2.0
        ));
        let bent = pool.voice_for(NoteId::new(0, 60)).unwrap();
        let straight = pool.voice_for(NoteId::new(0, 64)).unwrap();
        assert_eq!(bent.expression.bend_semitones, 2.0);
        assert_eq!(straight.expression.bend_semitones, 0.0);
    }

    #[test]
    fn all_notes_off_releases_everything_once() {
        let mut pool = VoicePool::new(4);
        pool.note_on(expr(0, 60), VoiceParams::default());
        pool.note_on(expr(0, 61), VoiceParams::default());
        pool.note_off(NoteId::new(0, 61), 0.5); // already releasing
        let released = pool.all_notes_off();
        assert_eq!(released, vec![NoteId::new(0, 60)]);
    }

    #[test]
    fn finished_voices_are_reported_and_unbound() {
        let mut pool = VoicePool::new(2);
        let params = VoiceParams {
            amp_envelope: crate::envelope::EnvelopeParams {
                attack_s: 0.0,
                decay_s: 0.0,
                sustain: 1.0,
                release_s: 0.001,
            },
            ..VoiceParams::default()
        };
        pool.note_on(expr(0, 60), params);
        pool.note_off(NoteId::new(0, 60), 0.5);
        let mut finished = Vec::new();
        for _ in 0..480 {
            pool.process(DT, |id| finished.push(id));
        }
        assert_eq!(finished, vec![NoteId::new(0, 60)]);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn reset_clears_synchronously() {
        let mut pool = VoicePool::new(4);
        pool.note_on(expr(0, 60), VoiceParams::default());
        pool.reset();
        assert_eq!(pool.active_count(), 0);
        assert!(pool.voice_for(NoteId::new(0, 60)).is_none());
    }
}
