//! Peers and their connection bookkeeping.

use std::collections::VecDeque;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use nois_shared::ids::PeerId;

use crate::clock::VectorClock;
use crate::protocol::now_ticks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Host,
    Editor,
    Viewer,
}

impl PeerRole {
    /// Only hosts and editors may submit edit operations.
    pub fn can_edit(&self) -> bool {
        !matches!(self, PeerRole::Viewer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted or a fatal error arrived
    Failed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Ring of recent one-way latency samples.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    cap: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP)
    }
}

impl LatencyWindow {
    pub const DEFAULT_CAP: usize = 16;

    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap.max(1)),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn average_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A session participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub role: PeerRole,
    /// Display color, RGB
    pub color: [u8; 3],
    #[serde(skip)]
    pub endpoint: Option<SocketAddr>,
    #[serde(default)]
    pub state: ConnectionState,
    #[serde(default)]
    pub clock: VectorClock,
    /// 100-ns ticks of the last frame seen from this peer
    #[serde(default)]
    pub last_seen: i64,
    #[serde(skip)]
    pub latency: LatencyWindow,
}

impl Peer {
    pub fn new(name: &str, role: PeerRole, color: [u8; 3]) -> Self {
        Self {
            id: PeerId::new(),
            name: name.to_string(),
            role,
            color,
            endpoint: None,
            state: ConnectionState::Disconnected,
            clock: VectorClock::new(),
            last_seen: now_ticks(),
            latency: LatencyWindow::new(LatencyWindow::DEFAULT_CAP),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = now_ticks();
    }

    /// Seconds since the peer was last heard from.
    pub fn idle_seconds(&self, now: i64) -> f64 {
        (now - self.last_seen).max(0) as f64 / 10_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_cannot_edit() {
        assert!(PeerRole::Host.can_edit());
        assert!(PeerRole::Editor.can_edit());
        assert!(!PeerRole::Viewer.can_edit());
    }

    #[test]
    fn latency_window_is_bounded_and_averaged() {
        let mut window = LatencyWindow::new(4);
        for i in 0..8 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), 4);
        // Last four samples: 4, 5, 6, 7
        assert_eq!(window.average_ms(), Some(5.5));
    }

    #[test]
    fn idle_seconds_from_ticks() {
        let mut peer = Peer::new("a", PeerRole::Editor, [0, 0, 0]);
        peer.last_seen = 0;
        assert!((peer.idle_seconds(150_000_000) - 15.0).abs() < 1e-9);
    }
}
