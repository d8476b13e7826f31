//! ADSR envelope generator.

/// Envelope stage. `Idle` is terminal: a voice whose amplitude envelope is
/// idle is free for reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Envelope timing, copied into the voice at trigger time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeParams {
    pub attack_s: f32,
    pub decay_s: f32,
    /// Sustain level, 0.0-1.0
    pub sustain: f32,
    pub release_s: f32,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self {
            attack_s: 0.005,
            decay_s: 0.05,
            sustain: 0.7,
            release_s: 0.2,
        }
    }
}

/// Linear-segment ADSR. All processing is per sample and total: no
/// allocation, no branching beyond the stage switch.
#[derive(Debug, Clone, Copy)]
pub struct AdsrEnvelope {
    params: EnvelopeParams,
    stage: EnvelopeStage,
    level: f32,
    /// Level when release began, for a constant-time release ramp
    release_from: f32,
}

impl Default for AdsrEnvelope {
    fn default() -> Self {
        Self {
            params: EnvelopeParams::default(),
            stage: EnvelopeStage::Idle,
            level: 0.0,
            release_from: 0.0,
        }
    }
}

impl AdsrEnvelope {
    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn is_idle(&self) -> bool {
        self.stage == EnvelopeStage::Idle
    }

    pub fn is_releasing(&self) -> bool {
        self.stage == EnvelopeStage::Release
    }

    /// Restarts the envelope with freshly copied parameters.
    ///
    /// The level is not reset to zero, so retriggering a stolen voice
    /// ramps from its current output without a click.
    pub fn trigger(&mut self, params: EnvelopeParams) {
        self.params = params;
        self.stage = EnvelopeStage::Attack;
    }

    pub fn release(&mut self) {
        if self.stage != EnvelopeStage::Idle && self.stage != EnvelopeStage::Release {
            self.release_from = self.level;
            self.stage = EnvelopeStage::Release;
        }
    }

    pub fn reset(&mut self) {
        self.stage = EnvelopeStage::Idle;
        self.level = 0.0;
        self.release_from = 0.0;
    }

    /// Advances one sample and returns the new level.
    pub fn process(&mut self, dt: f32) -> f32 {
        match self.stage {
            EnvelopeStage::Idle => {}
            EnvelopeStage::Attack => {
                if self.params.attack_s <= 0.0 {
                    self.level = 1.0;
                } else {
                    self.level += dt / self.params.attack_s;
                }
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvelopeStage::Decay;
                }
            }
            EnvelopeStage::Decay => {
                let sustain = self.params.sustain.clamp(0.0, 1.0);
                if self.params.decay_s <= 0.0 {
                    self.level = sustain;
                } else {
                    self.level -= dt * (1.0 - sustain) / self.params.decay_s;
                }
                if self.level <= sustain {
                    self.level = sustain;
                    self.stage = EnvelopeStage::Sustain;
                }
            }
            EnvelopeStage::Sustain => {
                self.level = self.params.sustain.clamp(0.0, 1.0);
                if self.level <= 0.0 {
                    // Sustain at zero decays straight to silence.
                    self.stage = EnvelopeStage::Idle;
                }
            }
            EnvelopeStage::Release => {
                if self.params.release_s <= 0.0 {
                    self.level = 0.0;
                } else {
                    self.level -= dt * self.release_from.max(1e-6) / self.params.release_s;
                }
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = EnvelopeStage::Idle;
                }
            }
        }
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 48_000.0;

    fn run(env: &mut AdsrEnvelope, seconds: f32) {
        let samples = (seconds / DT) as usize;
        for _ in 0..samples {
            env.process(DT);
        }
    }

    #[test]
    fn full_cycle_reaches_idle() {
        let mut env = AdsrEnvelope::default();
        env.trigger(EnvelopeParams {
            attack_s: 0.01,
            decay_s: 0.01,
            sustain: 0.5,
            release_s: 0.01,
        });
        run(&mut env, 0.05);
        assert_eq!(env.stage(), EnvelopeStage::Sustain);
        assert!((env.level() - 0.5).abs() < 1e-3);

        env.release();
        run(&mut env, 0.05);
        assert!(env.is_idle());
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn zero_attack_snaps_to_peak() {
        let mut env = AdsrEnvelope::default();
        env.trigger(EnvelopeParams {
            attack_s: 0.0,
            ..EnvelopeParams::default()
        });
        env.process(DT);
        assert!(env.level() >= 1.0 - 1e-6 || env.stage() == EnvelopeStage::Decay);
    }

    #[test]
    fn release_from_attack_is_allowed() {
        let mut env = AdsrEnvelope::default();
        env.trigger(EnvelopeParams::default());
        run(&mut env, 0.001);
        let mid = env.level();
        assert!(mid > 0.0 && mid < 1.0);
        env.release();
        assert!(env.is_releasing());
        run(&mut env, 1.0);
        assert!(env.is_idle());
    }

    #[test]
    fn idle_stays_at_zero() {
        let mut env = AdsrEnvelope::default();
        assert_eq!(env.process(DT), 0.0);
        assert!(env.is_idle());
    }
}
