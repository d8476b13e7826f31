//! Split-zone and chord-voicing configuration.
//!
//! Pure data plus derivation rules. The processors that consume these live
//! in the MIDI crate; the types live here so projects can persist them and
//! collaboration can sync them.

use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// Velocity response applied by a split zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityCurve {
    Linear,
    /// sqrt(v), lifts quiet playing
    Soft,
    /// v^2, needs harder playing
    Hard,
    /// Smoothstep between the extremes
    SCurve,
    /// (e^v - 1) / (e - 1)
    Exponential,
    /// ln(1 + v * (e - 1))
    Logarithmic,
    /// Ignores input, always the zone's fixed velocity
    Fixed,
}

impl Default for VelocityCurve {
    fn default() -> Self {
        Self::Linear
    }
}

impl VelocityCurve {
    /// Applies the curve to a normalized velocity (0.0-1.0).
    ///
    /// `Fixed` is handled by the caller; here it passes through.
    pub fn apply(&self, v: f32) -> f32 {
        let v = v.clamp(0.0, 1.0);
        match self {
            VelocityCurve::Linear | VelocityCurve::Fixed => v,
            VelocityCurve::Soft => v.sqrt(),
            VelocityCurve::Hard => v * v,
            VelocityCurve::SCurve => v * v * (3.0 - 2.0 * v),
            VelocityCurve::Exponential => (v.exp() - 1.0) / (std::f32::consts::E - 1.0),
            VelocityCurve::Logarithmic => (1.0 + v * (std::f32::consts::E - 1.0)).ln(),
        }
    }
}

/// One keyboard split zone.
///
/// Note and velocity ranges are half-open: `low <= x < high`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitZone {
    pub id: EntityId,
    pub name: String,
    pub low_note: u8,
    pub high_note: u8,
    pub low_velocity: u8,
    pub high_velocity: u8,
    /// Semitones added to matched notes
    pub transpose: i16,
    /// Cents, applied downstream by the synth
    pub fine_tune: f32,
    /// Forces output onto this channel when set
    pub output_channel: Option<u8>,
    pub curve: VelocityCurve,
    /// Output velocity when `curve` is `Fixed`
    pub fixed_velocity: u8,
    /// Higher priority zones are processed first
    pub priority: i32,
    /// When false, a match stops zones below this one from firing
    pub pass_through: bool,
}

impl Default for SplitZone {
    fn default() -> Self {
        Self {
            id: EntityId::new(),
            name: "Zone".to_string(),
            low_note: 0,
            high_note: 128,
            low_velocity: 1,
            high_velocity: 128,
            transpose: 0,
            fine_tune: 0.0,
            output_channel: None,
            curve: VelocityCurve::default(),
            fixed_velocity: 100,
            priority: 0,
            pass_through: true,
        }
    }
}

impl SplitZone {
    pub fn matches(&self, note: u8, velocity: u8) -> bool {
        note >= self.low_note
            && (note as u16) < (self.high_note as u16)
            && velocity >= self.low_velocity
            && (velocity as u16) < (self.high_velocity as u16)
    }

    /// Curved, clamped output velocity for a matched input.
    pub fn shape_velocity(&self, velocity: u8) -> u8 {
        if let VelocityCurve::Fixed = self.curve {
            return self.fixed_velocity;
        }
        let normalized = velocity as f32 / 127.0;
        let shaped = self.curve.apply(normalized) * 127.0;
        (shaped.round() as i32).clamp(1, 127) as u8
    }
}

/// Strum behavior for chord memory playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrumDirection {
    None,
    /// Low note first
    Up,
    /// High note first
    Down,
    /// Toggles between Up and Down per chord
    Alternate,
    /// Shuffles the delay assignment per chord
    Random,
}

impl Default for StrumDirection {
    fn default() -> Self {
        Self::None
    }
}

/// A stored chord shape, applied above an incoming root note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordVoicing {
    pub id: EntityId,
    pub name: String,
    /// Semitone offsets from the root, 0 included for the root itself
    pub intervals: Vec<i16>,
    /// Per-interval velocity multiplier, padded with 1.0 when shorter
    pub velocity_scale: Vec<f32>,
    /// Inversions applied before the global inversion offset
    pub default_inversion: u8,
    pub strum: StrumDirection,
    /// Total strum spread in milliseconds
    pub strum_ms: f32,
}

impl Default for ChordVoicing {
    fn default() -> Self {
        Self {
            id: EntityId::new(),
            name: "Major".to_string(),
            intervals: vec![0, 4, 7],
            velocity_scale: Vec::new(),
            default_inversion: 0,
            strum: StrumDirection::default(),
            strum_ms: 0.0,
        }
    }
}

impl ChordVoicing {
    /// Velocity multiplier for the interval at `index` (1.0 when absent).
    pub fn scale_at(&self, index: usize) -> f32 {
        self.velocity_scale.get(index).copied().unwrap_or(1.0)
    }
}
