//! Classifies normalized MIDI into per-note expression updates.
//!
//! The router owns the active-notes table and the channel bindings that MPE
//! needs to route member-channel messages to the right note. It emits
//! `NoteEvent`s into a caller-supplied buffer so the hot path never
//! allocates once the table has warmed up.

use std::collections::HashMap;

use log::trace;

use nois_shared::events::{ExpressionKind, NoteEvent};
use nois_shared::expression::{NoteExpression, NoteId, DEFAULT_BEND_RANGE};

use crate::message::*;
use crate::mpe::{MpeLayout, RpnEvent, RpnTracker, ZoneRole};
use crate::parser::Midi1Parser;
use crate::ump::{self, Midi2Kind, UmpMessage, UmpPacket};

/// Zone-global state accumulated from master-channel messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneState {
    /// CC 7, normalized
    pub volume: f32,
    /// CC 11, normalized
    pub expression: f32,
    /// CC 64
    pub sustain: bool,
    /// Master pitch bend, bipolar
    pub master_bend: f32,
}

impl Default for ZoneState {
    fn default() -> Self {
        Self {
            volume: 1.0,
            expression: 1.0,
            sustain: false,
            master_bend: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub default_bend_range: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_bend_range: DEFAULT_BEND_RANGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ActiveKey {
    group: u8,
    channel: u8,
    note: u8,
}

/// MIDI ingest front end: byte streams, UMP packets, MPE state.
pub struct MidiRouter {
    config: RouterConfig,
    layout: MpeLayout,
    rpn: RpnTracker,
    parser: Midi1Parser,
    notes: HashMap<ActiveKey, NoteExpression>,
    /// Most recent note started per (group, channel); member-channel
    /// messages route here.
    bound: HashMap<(u8, u8), NoteId>,
    lower_state: ZoneState,
    upper_state: ZoneState,
    bend_range: [f32; 16],
    scratch: Vec<MidiMessage>,
}

impl Default for MidiRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl MidiRouter {
    pub fn new(config: RouterConfig) -> Self {
        let bend_range = [config.default_bend_range; 16];
        Self {
            config,
            layout: MpeLayout::disabled(),
            rpn: RpnTracker::new(),
            parser: Midi1Parser::new(),
            notes: HashMap::new(),
            bound: HashMap::new(),
            lower_state: ZoneState::default(),
            upper_state: ZoneState::default(),
            bend_range,
            scratch: Vec::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn layout(&self) -> MpeLayout {
        self.layout
    }

    pub fn set_layout(&mut self, layout: MpeLayout) {
        self.layout = layout;
    }

    /// Zone state for the zone whose master channel is `master` (0 or 15).
    pub fn zone_state(&self, master: u8) -> &ZoneState {
        if master == 15 {
            &self.upper_state
        } else {
            &self.lower_state
        }
    }

    pub fn active_note_count(&self) -> usize {
        self.notes.len()
    }

    /// Expression record for a sounding note, if any.
    pub fn expression(&self, channel: u8, note: u8) -> Option<&NoteExpression> {
        self.notes.get(&ActiveKey {
            group: 0,
            channel,
            note,
        })
    }

    pub fn expression_in_group(&self, group: u8, channel: u8, note: u8) -> Option<&NoteExpression> {
        self.notes.get(&ActiveKey {
            group,
            channel,
            note,
        })
    }

    /// Feeds a raw MIDI 1.0 byte buffer (group 0).
    ///
    /// Returns false when the buffer was empty.
    pub fn process_bytes(&mut self, bytes: &[u8], out: &mut Vec<NoteEvent>) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        self.parser.parse_bytes(bytes, &mut scratch);
        for msg in &scratch {
            self.process_message(0, msg, out);
        }
        self.scratch = scratch;
        true
    }

    /// Feeds one whole UMP packet. Unknown message types are discarded
    /// silently and report false.
    pub fn process_ump(&mut self, packet: UmpPacket, out: &mut Vec<NoteEvent>) -> bool {
        let Some(message) = ump::parse_packet(packet) else {
            return false;
        };
        match message {
            UmpMessage::Midi1 { group, message } => {
                self.process_message(group, &message, out);
                true
            }
            UmpMessage::Midi2(m) => {
                self.process_midi2(m, out);
                true
            }
            // Timing, sysex chunks and stream config do not carry
            // per-note expression.
            UmpMessage::System { .. }
            | UmpMessage::Data64 { .. }
            | UmpMessage::Data128 { .. }
            | UmpMessage::Utility { .. } => true,
        }
    }

    /// Routes one normalized MIDI 1.0 message.
    pub fn process_message(&mut self, group: u8, msg: &MidiMessage, out: &mut Vec<NoteEvent>) {
        match *msg {
            MidiMessage::NoteOn { channel, note, velocity } => {
                if velocity == 0 {
                    // Note On with velocity 0 is a Note Off.
                    self.note_off(group, channel, note, 0.5, out);
                } else {
                    self.note_on(group, channel, note, velocity as f32 / 127.0, out);
                }
            }
            MidiMessage::NoteOff { channel, note, velocity } => {
                self.note_off(group, channel, note, velocity as f32 / 127.0, out);
            }
            MidiMessage::PolyPressure { channel, note, pressure } => {
                let key = ActiveKey { group, channel, note };
                if let Some(e) = self.notes.get_mut(&key) {
                    let value = pressure as f32 / 127.0;
                    e.set_pressure(value);
                    out.push(NoteEvent::Expression {
                        id: e.id(),
                        kind: ExpressionKind::Pressure,
                        value,
                    });
                }
            }
            MidiMessage::ControlChange { channel, controller, value } => {
                self.control_change(group, channel, controller, value, out);
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                self.channel_pressure(group, channel, pressure as f32 / 127.0, out);
            }
            MidiMessage::PitchBend { channel, value } => {
                self.pitch_bend(group, channel, MidiMessage::bend_normalized(value), out);
            }
            // Program changes and system messages carry no expression.
            _ => {}
        }
    }

    fn process_midi2(&mut self, m: crate::ump::Midi2Message, out: &mut Vec<NoteEvent>) {
        let group = m.group;
        let channel = m.channel;
        match m.kind {
            Midi2Kind::NoteOn { note, velocity, .. } => {
                if velocity == 0 {
                    self.note_off(group, channel, note, 0.5, out);
                } else {
                    self.note_on(group, channel, note, ump::normalized_16(velocity), out);
                }
            }
            Midi2Kind::NoteOff { note, velocity, .. } => {
                self.note_off(group, channel, note, ump::normalized_16(velocity), out);
            }
            Midi2Kind::PolyPressure { note, value } => {
                let key = ActiveKey { group, channel, note };
                if let Some(e) = self.notes.get_mut(&key) {
                    let value = ump::normalized_32(value);
                    e.set_pressure(value);
                    out.push(NoteEvent::Expression {
                        id: e.id(),
                        kind: ExpressionKind::Pressure,
                        value,
                    });
                }
            }
            Midi2Kind::PerNotePitchBend { note, value } => {
                let key = ActiveKey { group, channel, note };
                if let Some(e) = self.notes.get_mut(&key) {
                    e.set_bend_normalized(ump::unipolar_32_to_bipolar(value));
                    out.push(NoteEvent::Expression {
                        id: e.id(),
                        kind: ExpressionKind::PitchBend,
                        value: e.bend_semitones,
                    });
                }
            }
            Midi2Kind::PerNoteController { note, index, value } => {
                // The numeric controller index is authoritative; 74 is the
                // slide dimension whatever a profile names it.
                if index == CC_SLIDE {
                    let key = ActiveKey { group, channel, note };
                    if let Some(e) = self.notes.get_mut(&key) {
                        let value = ump::normalized_32(value);
                        e.set_slide(value);
                        out.push(NoteEvent::Expression {
                            id: e.id(),
                            kind: ExpressionKind::Slide,
                            value,
                        });
                    }
                }
            }
            Midi2Kind::RegisteredController { bank, index, value } => {
                // MIDI 2.0 form of the RPNs the MIDI 1.0 path tracks.
                if bank == 0 && index == 6 {
                    self.layout.apply_mcm(channel, ump::controller_32_to_7(value).min(15));
                } else if bank == 0 && index == 0 {
                    self.set_bend_range(channel, ump::controller_32_to_7(value) as f32);
                }
            }
            Midi2Kind::AssignableController { .. } => {}
            Midi2Kind::ControlChange { index, value } => {
                self.control_change(group, channel, index, ump::controller_32_to_7(value), out);
            }
            Midi2Kind::ProgramChange { .. } => {}
            Midi2Kind::ChannelPressure { value } => {
                self.channel_pressure(group, channel, ump::normalized_32(value), out);
            }
            Midi2Kind::PitchBend { value } => {
                self.pitch_bend(group, channel, ump::unipolar_32_to_bipolar(value), out);
            }
            Midi2Kind::PerNoteManagement { note, flags } => {
                let key = ActiveKey { group, channel, note };
                if flags & ump::PNM_DETACH != 0 {
                    if let Some(e) = self.notes.get(&key) {
                        let id = e.id();
                        self.bound.retain(|_, bound| *bound != id);
                    }
                }
                if flags & ump::PNM_RESET != 0 {
                    if let Some(e) = self.notes.get_mut(&key) {
                        e.reset_controllers();
                        let id = e.id();
                        out.push(NoteEvent::Expression {
                            id,
                            kind: ExpressionKind::Slide,
                            value: 0.5,
                        });
                        out.push(NoteEvent::Expression {
                            id,
                            kind: ExpressionKind::Pressure,
                            value: 0.0,
                        });
                        out.push(NoteEvent::Expression {
                            id,
                            kind: ExpressionKind::PitchBend,
                            value: 0.0,
                        });
                    }
                }
            }
        }
    }

    fn note_on(&mut self, group: u8, channel: u8, note: u8, strike: f32, out: &mut Vec<NoteEvent>) {
        let bend_range = self.bend_range[(channel & 0x0F) as usize];
        let mut record = NoteExpression::new(channel, note, strike);
        record.bend_range = bend_range;
        let id = record.id();
        self.notes.insert(ActiveKey { group, channel, note }, record);
        self.bound.insert((group, channel), id);
        trace!("note on {} strike {:.3}", id, strike);
        out.push(NoteEvent::NoteTriggered {
            id,
            velocity: strike,
            bend_range,
        });
    }

    fn note_off(&mut self, group: u8, channel: u8, note: u8, lift: f32, out: &mut Vec<NoteEvent>) {
        let key = ActiveKey { group, channel, note };
        if let Some(mut record) = self.notes.remove(&key) {
            record.release(lift);
            let id = record.id();
            if self.bound.get(&(group, channel)) == Some(&id) {
                self.bound.remove(&(group, channel));
            }
            trace!("note off {} lift {:.3}", id, lift);
            out.push(NoteEvent::NoteReleased { id, velocity: lift });
        }
    }

    fn control_change(
        &mut self,
        group: u8,
        channel: u8,
        controller: u8,
        value: u8,
        out: &mut Vec<NoteEvent>,
    ) {
        // RPN bookkeeping first: the MCM sequence is itself plain CCs.
        match self.rpn.control_change(channel, controller, value) {
            Some(RpnEvent::McmReceived { channel, member_count }) => {
                self.layout.apply_mcm(channel, member_count);
                return;
            }
            Some(RpnEvent::BendRange { channel, semitones }) => {
                self.set_bend_range(channel, semitones as f32);
                return;
            }
            None => {}
        }

        let role = self.layout.zone_for(channel);
        match role {
            Some((zone, ZoneRole::Master)) => {
                let normalized = value as f32 / 127.0;
                match controller {
                    CC_VOLUME => self.zone_state_mut(zone.master_channel).volume = normalized,
                    CC_EXPRESSION => {
                        self.zone_state_mut(zone.master_channel).expression = normalized
                    }
                    CC_SUSTAIN => {
                        self.zone_state_mut(zone.master_channel).sustain = value >= 64
                    }
                    CC_SLIDE => {
                        // Master-channel slide broadcasts to the whole zone.
                        self.for_zone_notes(group, zone, out, |e| {
                            e.set_slide(normalized);
                            Some((ExpressionKind::Slide, normalized))
                        });
                    }
                    CC_RESET_ALL_CONTROLLERS => {
                        *self.zone_state_mut(zone.master_channel) = ZoneState::default();
                    }
                    CC_ALL_NOTES_OFF => {
                        self.release_zone(group, zone, out);
                    }
                    _ => {}
                }
            }
            _ => {
                // Member channel, or MPE disabled: per-note semantics.
                match controller {
                    CC_SLIDE => {
                        let normalized = value as f32 / 127.0;
                        if let Some(e) = self.bound_note_mut(group, channel) {
                            e.set_slide(normalized);
                            out.push(NoteEvent::Expression {
                                id: e.id(),
                                kind: ExpressionKind::Slide,
                                value: normalized,
                            });
                        }
                    }
                    CC_RESET_ALL_CONTROLLERS => {
                        if let Some(e) = self.bound_note_mut(group, channel) {
                            e.reset_controllers();
                            let id = e.id();
                            out.push(NoteEvent::Expression {
                                id,
                                kind: ExpressionKind::Slide,
                                value: 0.5,
                            });
                            out.push(NoteEvent::Expression {
                                id,
                                kind: ExpressionKind::Pressure,
                                value: 0.0,
                            });
                            out.push(NoteEvent::Expression {
                                id,
                                kind: ExpressionKind::PitchBend,
                                value: 0.0,
                            });
                        }
                    }
                    CC_ALL_NOTES_OFF => {
                        self.release_channel(group, channel, out);
                    }
                    _ => {}
                }
            }
        }
    }

    fn channel_pressure(&mut self, group: u8, channel: u8, value: f32, out: &mut Vec<NoteEvent>) {
        match self.layout.zone_for(channel) {
            Some((zone, ZoneRole::Master)) => {
                self.for_zone_notes(group, zone, out, |e| {
                    e.set_pressure(value);
                    Some((ExpressionKind::Pressure, value))
                });
            }
            _ => {
                if let Some(e) = self.bound_note_mut(group, channel) {
                    e.set_pressure(value);
                    out.push(NoteEvent::Expression {
                        id: e.id(),
                        kind: ExpressionKind::Pressure,
                        value,
                    });
                }
            }
        }
    }

    fn pitch_bend(&mut self, group: u8, channel: u8, bend: f32, out: &mut Vec<NoteEvent>) {
        match self.layout.zone_for(channel) {
            Some((zone, ZoneRole::Master)) => {
                // Zone-global bend is kept as zone state; member notes keep
                // their own per-note bend.
                self.zone_state_mut(zone.master_channel).master_bend = bend;
            }
            _ => {
                if let Some(e) = self.bound_note_mut(group, channel) {
                    e.set_bend_normalized(bend);
                    out.push(NoteEvent::Expression {
                        id: e.id(),
                        kind: ExpressionKind::PitchBend,
                        value: e.bend_semitones,
                    });
                }
            }
        }
    }

    fn set_bend_range(&mut self, channel: u8, semitones: f32) {
        let semitones = semitones.max(1.0);
        match self.layout.zone_for(channel) {
            Some((zone, ZoneRole::Master)) => {
                // Master-channel sensitivity configures the whole zone.
                for ch in zone.member_channels() {
                    self.bend_range[ch as usize] = semitones;
                }
                self.bend_range[zone.master_channel as usize] = semitones;
            }
            _ => self.bend_range[(channel & 0x0F) as usize] = semitones,
        }
    }

    fn zone_state_mut(&mut self, master: u8) -> &mut ZoneState {
        if master == 15 {
            &mut self.upper_state
        } else {
            &mut self.lower_state
        }
    }

    fn bound_note_mut(&mut self, group: u8, channel: u8) -> Option<&mut NoteExpression> {
        let id = *self.bound.get(&(group, channel))?;
        self.notes.get_mut(&ActiveKey {
            group,
            channel: id.channel(),
            note: id.note(),
        })
    }

    /// Applies `f` to every active note in the zone's member channels,
    /// emitting the expression event it returns.
    fn for_zone_notes<F>(&mut self, group: u8, zone: crate::mpe::MpeZone, out: &mut Vec<NoteEvent>, mut f: F)
    where
        F: FnMut(&mut NoteExpression) -> Option<(ExpressionKind, f32)>,
    {
        for (key, e) in self.notes.iter_mut() {
            if key.group == group && zone.is_member(key.channel) {
                if let Some((kind, value)) = f(e) {
                    out.push(NoteEvent::Expression {
                        id: e.id(),
                        kind,
                        value,
                    });
                }
            }
        }
    }

    fn release_zone(&mut self, group: u8, zone: crate::mpe::MpeZone, out: &mut Vec<NoteEvent>) {
        let keys: Vec<ActiveKey> = self
            .notes
            .keys()
            .filter(|k| k.group == group && zone.is_member(k.channel))
            .copied()
            .collect();
        for key in keys {
            self.note_off(group, key.channel, key.note, 0.5, out);
        }
    }

    fn release_channel(&mut self, group: u8, channel: u8, out: &mut Vec<NoteEvent>) {
        let keys: Vec<ActiveKey> = self
            .notes
            .keys()
            .filter(|k| k.group == group && k.channel == channel)
            .copied()
            .collect();
        for key in keys {
            self.note_off(group, key.channel, key.note, 0.5, out);
        }
    }

    /// Releases everything and emits a single AllNotesOff for the pool.
    pub fn panic(&mut self, out: &mut Vec<NoteEvent>) {
        self.notes.clear();
        self.bound.clear();
        out.push(NoteEvent::AllNotesOff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on_bytes(channel: u8, note: u8, vel: u8) -> [u8; 3] {
        [0x90 | channel, note, vel]
    }

    #[test]
    fn mpe_autodetect_and_member_routing() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();

        // MCM: CC 101=0, 100=6, 6=4 on channel 0
        router.process_bytes(&[0xB0, 101, 0, 100, 6, 6, 4], &mut out);
        let layout = router.layout();
        let lower = layout.lower.expect("lower zone enabled");
        assert_eq!(lower.member_count, 4);
        assert!(out.is_empty());

        // Note on member channel 2
        router.process_bytes(&note_on_bytes(2, 60, 100), &mut out);
        assert_eq!(out.len(), 1);
        assert!(router.expression(2, 60).is_some());

        // Bend on channel 2 updates only that note
        router.process_bytes(&note_on_bytes(3, 64, 100), &mut out);
        out.clear();
        router.process_bytes(&[0xE2, 0x7F, 0x7F], &mut out);
        assert_eq!(out.len(), 1);
        let e2 = router.expression(2, 60).unwrap();
        let e3 = router.expression(3, 64).unwrap();
        assert!(e2.bend_semitones > 40.0); // near +48 at full deflection
        assert_eq!(e3.bend_semitones, 0.0);
    }

    #[test]
    fn note_on_velocity_zero_is_note_off() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        router.process_bytes(&note_on_bytes(0, 60, 100), &mut out);
        router.process_bytes(&note_on_bytes(0, 60, 0), &mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], NoteEvent::NoteReleased { .. }));
        assert_eq!(router.active_note_count(), 0);
    }

    #[test]
    fn master_slide_broadcasts_to_zone() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        router.set_layout(MpeLayout {
            lower: Some(crate::mpe::MpeZone::lower(4)),
            upper: None,
        });
        router.process_bytes(&note_on_bytes(1, 60, 100), &mut out);
        router.process_bytes(&note_on_bytes(2, 64, 100), &mut out);
        out.clear();

        // CC74 on master channel 0
        router.process_bytes(&[0xB0, 74, 127], &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| matches!(
            e,
            NoteEvent::Expression {
                kind: ExpressionKind::Slide,
                ..
            }
        )));
        assert!((router.expression(1, 60).unwrap().slide - 1.0).abs() < 1e-6);
    }

    #[test]
    fn master_pressure_hits_all_member_notes() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        router.set_layout(MpeLayout {
            lower: Some(crate::mpe::MpeZone::lower(7)),
            upper: None,
        });
        router.process_bytes(&note_on_bytes(1, 60, 100), &mut out);
        router.process_bytes(&note_on_bytes(2, 64, 100), &mut out);
        out.clear();
        router.process_bytes(&[0xD0, 100], &mut out);
        assert_eq!(out.len(), 2);
        assert!((router.expression(2, 64).unwrap().pressure - 100.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn member_pressure_hits_only_bound_note() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        router.set_layout(MpeLayout {
            lower: Some(crate::mpe::MpeZone::lower(7)),
            upper: None,
        });
        router.process_bytes(&note_on_bytes(2, 60, 100), &mut out);
        router.process_bytes(&note_on_bytes(3, 64, 100), &mut out);
        out.clear();
        router.process_bytes(&[0xD2, 90], &mut out);
        assert_eq!(out.len(), 1);
        assert!(router.expression(2, 60).unwrap().pressure > 0.0);
        assert_eq!(router.expression(3, 64).unwrap().pressure, 0.0);
    }

    #[test]
    fn note_off_drops_table_entry_and_binding() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        router.process_bytes(&note_on_bytes(0, 60, 100), &mut out);
        router.process_bytes(&[0x80, 60, 80], &mut out);
        assert_eq!(router.active_note_count(), 0);
        out.clear();
        // Bend now routes nowhere.
        router.process_bytes(&[0xE0, 0x00, 0x7F], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn midi2_note_on_scaled_velocity() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        // MIDI 2 note on, group 0 channel 0 note 60, velocity 100 << 9
        let vel16 = ump::velocity_7_to_16(100);
        let w0: u32 = 0x4090_3C00;
        let d = ((w0 as u64) << 32) | ((vel16 as u64) << 16);
        assert!(router.process_ump(UmpPacket::DWord(d), &mut out));
        match out[0] {
            NoteEvent::NoteTriggered { velocity, .. } => {
                assert!((velocity - vel16 as f32 / u16::MAX as f32).abs() < 1e-6);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn ump_unknown_type_not_processed() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        assert!(!router.process_ump(UmpPacket::Word(0x7000_0000), &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn empty_buffer_reports_not_processed() {
        let mut router = MidiRouter::default();
        let mut out = Vec::new();
        assert!(!router.process_bytes(&[], &mut out));
    }
}
