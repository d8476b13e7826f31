//! Keyboard split processing.

use nois_shared::ids::EntityId;
use nois_shared::voicing::SplitZone;

/// One emission from the split stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOutput {
    pub zone: EntityId,
    pub note: u8,
    pub velocity: u8,
    pub channel: u8,
}

/// Matches incoming notes against zones in priority order.
#[derive(Debug, Default)]
pub struct SplitProcessor {
    /// Kept sorted by descending priority.
    zones: Vec<SplitZone>,
}

impl SplitProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zones(&self) -> &[SplitZone] {
        &self.zones
    }

    pub fn add_zone(&mut self, zone: SplitZone) {
        let at = self
            .zones
            .iter()
            .position(|z| z.priority < zone.priority)
            .unwrap_or(self.zones.len());
        self.zones.insert(at, zone);
    }

    pub fn remove_zone(&mut self, id: EntityId) -> bool {
        let before = self.zones.len();
        self.zones.retain(|z| z.id != id);
        self.zones.len() != before
    }

    pub fn clear(&mut self) {
        self.zones.clear();
    }

    /// Runs `(note, velocity)` through the zones, highest priority first.
    ///
    /// Each match emits one output; a match on a zone without
    /// `pass_through` stops the scan. Transpositions that leave the MIDI
    /// note range emit nothing but still count as the match.
    pub fn process(&self, note: u8, velocity: u8, channel: u8) -> Vec<SplitOutput> {
        let mut outputs = Vec::new();
        for zone in &self.zones {
            if !zone.matches(note, velocity) {
                continue;
            }
            let transposed = note as i32 + zone.transpose as i32;
            if (0..=127).contains(&transposed) {
                outputs.push(SplitOutput {
                    zone: zone.id,
                    note: transposed as u8,
                    velocity: zone.shape_velocity(velocity),
                    channel: zone.output_channel.unwrap_or(channel),
                });
            }
            if !zone.pass_through {
                break;
            }
        }
        outputs
    }
}
