//! Transport state shared between the collaboration layer, the engine and
//! observers. Lock-free: plain atomic loads and stores, safe to read from
//! the audio thread.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Transport run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportRunState {
    Stopped,
    Playing,
    Recording,
}

impl Default for TransportRunState {
    fn default() -> Self {
        Self::Stopped
    }
}

/// Plain value snapshot, cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportState {
    pub state: TransportRunState,
    pub position_beats: f64,
    pub tempo: f64,
    pub time_sig_numerator: u16,
    pub time_sig_denominator: u16,
    pub loop_enabled: bool,
    pub loop_start: f64,
    pub loop_end: f64,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            state: TransportRunState::Stopped,
            position_beats: 0.0,
            tempo: 120.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            loop_enabled: false,
            loop_start: 0.0,
            loop_end: 4.0,
        }
    }
}

/// Atomic cell for the transport. Share with `Arc`.
#[derive(Debug)]
pub struct SharedTransport {
    run_state: AtomicU32,
    tempo_bits: AtomicU64,
    position_bits: AtomicU64,
    loop_start_bits: AtomicU64,
    loop_end_bits: AtomicU64,
    /// packed: loop_enabled << 31 | num << 16 | denom
    flags_and_sig: AtomicU32,
    /// 100-ns ticks of the last sync, for staleness checks
    last_sync_ticks: AtomicI64,
}

impl Default for SharedTransport {
    fn default() -> Self {
        let cell = Self {
            run_state: AtomicU32::new(0),
            tempo_bits: AtomicU64::new(0),
            position_bits: AtomicU64::new(0),
            loop_start_bits: AtomicU64::new(0),
            loop_end_bits: AtomicU64::new(0),
            flags_and_sig: AtomicU32::new(0),
            last_sync_ticks: AtomicI64::new(0),
        };
        cell.store(TransportState::default());
        cell
    }
}

impl SharedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a whole snapshot. Atomic per field, not across fields;
    /// readers tolerate one-field tearing between samples.
    pub fn store(&self, state: TransportState) {
        let run = match state.state {
            TransportRunState::Stopped => 0u32,
            TransportRunState::Playing => 1,
            TransportRunState::Recording => 2,
        };
        self.run_state.store(run, Ordering::Relaxed);
        self.tempo_bits.store(state.tempo.to_bits(), Ordering::Relaxed);
        self.position_bits
            .store(state.position_beats.to_bits(), Ordering::Relaxed);
        self.loop_start_bits
            .store(state.loop_start.to_bits(), Ordering::Relaxed);
        self.loop_end_bits
            .store(state.loop_end.to_bits(), Ordering::Relaxed);
        let packed = ((state.loop_enabled as u32) << 31)
            | ((state.time_sig_numerator as u32 & 0x7FFF) << 16)
            | state.time_sig_denominator as u32;
        self.flags_and_sig.store(packed, Ordering::Relaxed);
    }

    pub fn load(&self) -> TransportState {
        let packed = self.flags_and_sig.load(Ordering::Relaxed);
        TransportState {
            state: match self.run_state.load(Ordering::Relaxed) {
                1 => TransportRunState::Playing,
                2 => TransportRunState::Recording,
                _ => TransportRunState::Stopped,
            },
            position_beats: f64::from_bits(self.position_bits.load(Ordering::Relaxed)),
            tempo: f64::from_bits(self.tempo_bits.load(Ordering::Relaxed)),
            time_sig_numerator: ((packed >> 16) & 0x7FFF) as u16,
            time_sig_denominator: (packed & 0xFFFF) as u16,
            loop_enabled: packed & 0x8000_0000 != 0,
            loop_start: f64::from_bits(self.loop_start_bits.load(Ordering::Relaxed)),
            loop_end: f64::from_bits(self.loop_end_bits.load(Ordering::Relaxed)),
        }
    }

    pub fn mark_synced(&self, ticks: i64) {
        self.last_sync_ticks.store(ticks, Ordering::Relaxed);
    }

    pub fn last_sync_ticks(&self) -> i64 {
        self.last_sync_ticks.load(Ordering::Relaxed)
    }
}
