//! The shared project model that collaboration sessions edit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::EntityId;
use crate::voicing::{ChordVoicing, SplitZone};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: EntityId,
    /// Start time in beats
    pub start: f64,
    /// Duration in beats
    pub duration: f64,
    /// MIDI note number
    pub key: u8,
    /// 0-127
    pub velocity: u8,
    pub channel: u8,
}

impl Note {
    pub fn new(start: f64, duration: f64, key: u8, velocity: u8) -> Self {
        Self {
            id: EntityId::new(),
            start,
            duration,
            key,
            velocity,
            channel: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: EntityId,
    pub name: String,
    pub notes: Vec<Note>,
    /// Length in beats
    pub length: f64,
    /// Start within the arrangement, in beats
    pub start: f64,
    pub color: [u8; 3],
}

impl Default for Clip {
    fn default() -> Self {
        Self {
            id: EntityId::new(),
            name: "New Clip".to_string(),
            notes: Vec::new(),
            length: 4.0, // 1 bar of 4/4
            start: 0.0,
            color: [100, 100, 100],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: EntityId,
    pub name: String,
    pub volume: f32,
    pub pan: f32,
    pub mute: bool,
    pub solo: bool,
    pub clips: Vec<Clip>,
    pub parameters: HashMap<String, f64>,
}

impl Default for Track {
    fn default() -> Self {
        Self {
            id: EntityId::new(),
            name: "New Track".to_string(),
            volume: 1.0,
            pan: 0.0,
            mute: false,
            solo: false,
            clips: Vec::new(),
            parameters: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub bpm: f32,
    pub time_sig_numerator: u16,
    pub time_sig_denominator: u16,
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub split_zones: Vec<SplitZone>,
    #[serde(default)]
    pub chord_voicings: Vec<ChordVoicing>,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: "New Project".to_string(),
            bpm: 120.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            tracks: Vec::new(),
            split_zones: Vec::new(),
            chord_voicings: Vec::new(),
        }
    }
}

impl Project {
    pub fn track(&self, id: EntityId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn track_mut(&mut self, id: EntityId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    pub fn clip_mut(&mut self, id: EntityId) -> Option<&mut Clip> {
        self.tracks
            .iter_mut()
            .flat_map(|t| t.clips.iter_mut())
            .find(|c| c.id == id)
    }

    pub fn note_mut(&mut self, id: EntityId) -> Option<&mut Note> {
        self.tracks
            .iter_mut()
            .flat_map(|t| t.clips.iter_mut())
            .flat_map(|c| c.notes.iter_mut())
            .find(|n| n.id == id)
    }
}
