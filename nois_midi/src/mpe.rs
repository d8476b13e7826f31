//! MPE zone configuration and RPN-based zone autodetection.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::message::{CC_DATA_ENTRY_MSB, CC_RPN_LSB, CC_RPN_MSB};

/// RPN 0:6, the MPE Configuration Message.
pub const RPN_MCM: (u8, u8) = (0, 6);
/// RPN 0:0, pitch bend sensitivity.
pub const RPN_BEND_RANGE: (u8, u8) = (0, 0);

/// How a channel participates in a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneRole {
    Master,
    Member,
}

/// One MPE zone: a master channel plus a run of member channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpeZone {
    /// 0 for the Lower zone, 15 for the Upper zone
    pub master_channel: u8,
    pub first_member: u8,
    /// 1-15
    pub member_count: u8,
}

impl MpeZone {
    /// Lower zone: master channel 0, members ascending from 1.
    pub fn lower(member_count: u8) -> Self {
        Self {
            master_channel: 0,
            first_member: 1,
            member_count: member_count.clamp(1, 15),
        }
    }

    /// Upper zone: master channel 15, members descending from 14.
    pub fn upper(member_count: u8) -> Self {
        let member_count = member_count.clamp(1, 15);
        Self {
            master_channel: 15,
            first_member: 15 - member_count,
            member_count,
        }
    }

    pub fn is_master(&self, channel: u8) -> bool {
        channel == self.master_channel
    }

    pub fn is_member(&self, channel: u8) -> bool {
        channel >= self.first_member && channel < self.first_member + self.member_count
    }

    pub fn contains(&self, channel: u8) -> bool {
        self.is_master(channel) || self.is_member(channel)
    }

    pub fn member_channels(&self) -> impl Iterator<Item = u8> {
        self.first_member..self.first_member + self.member_count
    }
}

/// Active zone layout. Either zone may be absent; both absent means MPE off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpeLayout {
    pub lower: Option<MpeZone>,
    pub upper: Option<MpeZone>,
}

impl MpeLayout {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.lower.is_some() || self.upper.is_some()
    }

    /// Zone a channel belongs to, with its role in that zone.
    pub fn zone_for(&self, channel: u8) -> Option<(MpeZone, ZoneRole)> {
        for zone in [self.lower, self.upper].into_iter().flatten() {
            if zone.is_master(channel) {
                return Some((zone, ZoneRole::Master));
            }
            if zone.is_member(channel) {
                return Some((zone, ZoneRole::Member));
            }
        }
        None
    }

    /// Applies an MPE Configuration Message received on `channel`.
    ///
    /// Channel 0 configures the Lower zone, channel 15 the Upper zone,
    /// a member count of 0 disables that zone. Other channels are ignored.
    pub fn apply_mcm(&mut self, channel: u8, member_count: u8) {
        match channel {
            0 => {
                self.lower = (member_count > 0).then(|| MpeZone::lower(member_count));
                debug!("MCM: lower zone -> {:?}", self.lower);
            }
            15 => {
                self.upper = (member_count > 0).then(|| MpeZone::upper(member_count));
                debug!("MCM: upper zone -> {:?}", self.upper);
            }
            _ => {}
        }
    }
}

/// What an RPN data-entry resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpnEvent {
    /// MCM on a zone master channel
    McmReceived { channel: u8, member_count: u8 },
    /// Pitch bend sensitivity in semitones
    BendRange { channel: u8, semitones: u8 },
}

#[derive(Debug, Clone, Copy, Default)]
struct RpnState {
    msb: Option<u8>,
    lsb: Option<u8>,
}

/// Tracks the CC 101/100/6 sequence per channel and resolves data entry
/// against the selected registered parameter.
#[derive(Debug, Default)]
pub struct RpnTracker {
    channels: [RpnState; 16],
}

impl RpnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a control change; returns a resolved RPN event when CC 6
    /// lands on a parameter this engine understands.
    pub fn control_change(&mut self, channel: u8, controller: u8, value: u8) -> Option<RpnEvent> {
        let state = &mut self.channels[(channel & 0x0F) as usize];
        match controller {
            CC_RPN_MSB => {
                state.msb = Some(value);
                None
            }
            CC_RPN_LSB => {
                state.lsb = Some(value);
                None
            }
            CC_DATA_ENTRY_MSB => {
                let selected = (state.msb?, state.lsb?);
                if selected == RPN_MCM {
                    Some(RpnEvent::McmReceived {
                        channel,
                        member_count: value.min(15),
                    })
                } else if selected == RPN_BEND_RANGE {
                    Some(RpnEvent::BendRange {
                        channel,
                        semitones: value,
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
