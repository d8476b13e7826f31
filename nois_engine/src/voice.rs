//! A single synth voice: one expression record bound to a pair of
//! envelopes and the per-sample parameter smoothers.

use nois_shared::events::ExpressionKind;
use nois_shared::expression::{NoteExpression, NoteId};

use crate::envelope::{AdsrEnvelope, EnvelopeParams};

/// Parameters copied from the owning synth at trigger time. Later changes
/// on the owner do not retroactively alter a sounding voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub amp_envelope: EnvelopeParams,
    pub filter_envelope: EnvelopeParams,
    /// Portamento time in seconds; 0 disables glide
    pub glide_time: f32,
    /// One-pole time constant for slide/pressure smoothing, seconds
    pub smoothing_tau: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            amp_envelope: EnvelopeParams::default(),
            filter_envelope: EnvelopeParams {
                attack_s: 0.002,
                decay_s: 0.1,
                sustain: 0.4,
                release_s: 0.15,
            },
            glide_time: 0.0,
            smoothing_tau: 0.01,
        }
    }
}

/// Smoothed per-sample outputs the DSP stage consumes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VoiceFrame {
    pub frequency: f64,
    /// Amplitude envelope level scaled by strike velocity
    pub amplitude: f32,
    pub filter_env: f32,
    pub slide: f32,
    pub pressure: f32,
}

#[derive(Debug, Clone)]
pub struct Voice {
    /// The expression record this voice is playing, copied at trigger
    pub expression: NoteExpression,
    note_id: Option<NoteId>,
    /// Trigger ordinal; smaller is older
    age: u64,
    params: VoiceParams,
    amp_env: AdsrEnvelope,
    filter_env: AdsrEnvelope,
    frequency: f64,
    target_frequency: f64,
    slide: f32,
    pressure: f32,
    ever_triggered: bool,
    frame: VoiceFrame,
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            expression: NoteExpression::new(0, 0, 0.0),
            note_id: None,
            age: 0,
            params: VoiceParams::default(),
            amp_env: AdsrEnvelope::default(),
            filter_env: AdsrEnvelope::default(),
            frequency: 0.0,
            target_frequency: 0.0,
            slide: 0.5,
            pressure: 0.0,
            ever_triggered: false,
            frame: VoiceFrame::default(),
        }
    }
}

impl Voice {
    pub fn note_id(&self) -> Option<NoteId> {
        self.note_id
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    /// Voice is sounding (or releasing) until its amplitude envelope
    /// reaches Idle.
    pub fn is_active(&self) -> bool {
        !self.amp_env.is_idle()
    }

    pub fn is_releasing(&self) -> bool {
        self.amp_env.is_releasing()
    }

    pub fn frame(&self) -> VoiceFrame {
        self.frame
    }

    /// Starts the voice on a fresh expression record.
    pub fn trigger(&mut self, expression: NoteExpression, params: VoiceParams, age: u64) {
        let glide_disabled = params.glide_time <= 0.0 || !self.ever_triggered;
        self.target_frequency = expression.frequency();
        if glide_disabled {
            self.frequency = self.target_frequency;
        }
        self.slide = expression.slide;
        self.pressure = expression.pressure;
        self.note_id = Some(expression.id());
        self.expression = expression;
        self.params = params;
        self.age = age;
        self.amp_env.trigger(params.amp_envelope);
        self.filter_env.trigger(params.filter_envelope);
        self.ever_triggered = true;
    }

    /// Begins the release phase. The expression record stays releasing
    /// until the envelope completes.
    pub fn release(&mut self, lift: f32) {
        self.expression.release(lift);
        self.amp_env.release();
        self.filter_env.release();
    }

    /// Applies an expression update routed by the allocator.
    pub fn update_expression(&mut self, kind: ExpressionKind, value: f32) {
        match kind {
            ExpressionKind::PitchBend => {
                self.expression.bend_semitones = value;
                self.target_frequency = self.expression.frequency();
            }
            ExpressionKind::Slide => self.expression.set_slide(value),
            ExpressionKind::Pressure => self.expression.set_pressure(value),
        }
    }

    /// Stops the voice immediately, without a release tail.
    pub fn kill(&mut self) {
        self.amp_env.reset();
        self.filter_env.reset();
        self.note_id = None;
        self.expression.active = false;
        self.frame = VoiceFrame::default();
    }

    /// Advances one sample: smooths parameters toward their targets and
    /// steps both envelopes. Returns true while the voice stays active.
    pub fn process(&mut self, dt: f32) -> bool {
        // One-pole coefficient for slide and pressure.
        let alpha = 1.0 - (-dt / self.params.smoothing_tau.max(1e-6)).exp();
        self.slide += (self.expression.slide - self.slide) * alpha;
        self.pressure += (self.expression.pressure - self.pressure) * alpha;

        // Glide uses its own time constant; zero glide steps directly.
        if self.params.glide_time > 0.0 {
            let glide_alpha = 1.0 - (-(dt as f64) / self.params.glide_time as f64).exp();
            self.frequency += (self.target_frequency - self.frequency) * glide_alpha;
        } else {
            self.frequency = self.target_frequency;
        }

        let amp = self.amp_env.process(dt);
        let filter = self.filter_env.process(dt);

        if self.amp_env.is_idle() {
            // Envelope completed: the record's lifecycle ends here.
            self.expression.active = false;
            self.note_id = None;
            self.frame = VoiceFrame::default();
            return false;
        }

        self.frame = VoiceFrame {
            frequency: self.frequency,
            amplitude: amp * self.expression.strike,
            filter_env: filter,
            slide: self.slide,
            pressure: self.pressure,
        };
        true
    }
}
