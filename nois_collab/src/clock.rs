//! Vector clocks for causal ordering of distributed edits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use nois_shared::ids::PeerId;

/// Relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
    Equal,
    /// Self happened before other
    Before,
    /// Self happened after other
    After,
    /// Neither precedes the other
    Concurrent,
}

/// Map of peer to monotone counter. Missing entries count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: HashMap<PeerId, i64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: PeerId) -> i64 {
        self.counters.get(&peer).copied().unwrap_or(0)
    }

    /// Advances `peer`'s counter and returns the new value.
    pub fn increment(&mut self, peer: PeerId) -> i64 {
        let counter = self.counters.entry(peer).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Element-wise maximum, applied on message receipt.
    pub fn merge(&mut self, other: &VectorClock) {
        for (&peer, &count) in &other.counters {
            let entry = self.counters.entry(peer).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrder {
        let mut less = false;
        let mut greater = false;
        for (&peer, &count) in &self.counters {
            let theirs = other.get(peer);
            if count < theirs {
                less = true;
            } else if count > theirs {
                greater = true;
            }
        }
        for (&peer, &theirs) in &other.counters {
            if self.get(peer) < theirs {
                less = true;
            }
        }
        match (less, greater) {
            (false, false) => ClockOrder::Equal,
            (true, false) => ClockOrder::Before,
            (false, true) => ClockOrder::After,
            (true, true) => ClockOrder::Concurrent,
        }
    }

    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrder::Concurrent
    }

    /// True when every entry of `other` is covered by this clock.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrder::Equal | ClockOrder::After)
    }

    pub fn counters(&self) -> &HashMap<PeerId, i64> {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entries_are_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get(PeerId::new()), 0);
    }

    #[test]
    fn increment_and_compare() {
        let a = PeerId::new();
        let b = PeerId::new();
        let mut va = VectorClock::new();
        let mut vb = VectorClock::new();

        va.increment(a);
        assert_eq!(va.compare(&vb), ClockOrder::After);
        assert_eq!(vb.compare(&va), ClockOrder::Before);

        vb.increment(b);
        assert_eq!(va.compare(&vb), ClockOrder::Concurrent);
        assert!(va.concurrent_with(&vb));
    }

    #[test]
    fn merge_takes_elementwise_max() {
        let a = PeerId::new();
        let b = PeerId::new();
        let mut va = VectorClock::new();
        let mut vb = VectorClock::new();
        va.increment(a);
        va.increment(a);
        vb.increment(b);

        va.merge(&vb);
        assert_eq!(va.get(a), 2);
        assert_eq!(va.get(b), 1);
        assert!(va.dominates(&vb));
    }

    #[test]
    fn equal_clocks() {
        let a = PeerId::new();
        let mut va = VectorClock::new();
        let mut vb = VectorClock::new();
        va.increment(a);
        vb.increment(a);
        assert_eq!(va.compare(&vb), ClockOrder::Equal);
    }
}
