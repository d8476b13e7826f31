//! Bounded operation history for replay and concurrency detection.

use std::collections::VecDeque;

use crate::clock::VectorClock;
use crate::op::Operation;

/// Default history depth.
pub const DEFAULT_HISTORY_CAP: usize = 10_000;

/// Ring of applied operations plus the running element-wise-max clock.
#[derive(Debug)]
pub struct OpHistory {
    ops: VecDeque<Operation>,
    cap: usize,
    clock: VectorClock,
}

impl OpHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            ops: VecDeque::with_capacity(cap.min(1024)),
            cap: cap.max(1),
            clock: VectorClock::new(),
        }
    }

    pub fn with_default_cap() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Clock covering every operation ever pushed.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Appends an applied operation, trimming from the head when full so
    /// recent operations survive.
    pub fn push(&mut self, op: Operation) {
        self.clock.merge(&op.clock);
        if self.ops.len() == self.cap {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Operations a lagging peer has not yet seen: everything whose clock
    /// the peer's clock does not dominate.
    pub fn ops_since(&self, peer_clock: &VectorClock) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|op| !peer_clock.dominates(&op.clock))
            .cloned()
            .collect()
    }

    /// Recent operations concurrent with `op`, for transforming an
    /// incoming remote edit.
    pub fn concurrent_with(&self, op: &Operation) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|applied| applied.concurrent_with(op))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{OpDomain, OperationKind};
    use nois_shared::ids::{EntityId, PeerId};

    fn op_with_clock(author: PeerId, counter: i64) -> Operation {
        let mut op = Operation::new(
            author,
            OperationKind::Update,
            OpDomain::Note,
            EntityId::new(),
        );
        for _ in 0..counter {
            op.clock.increment(author);
        }
        op
    }

    #[test]
    fn trims_from_head_at_capacity() {
        let author = PeerId::new();
        let mut history = OpHistory::new(3);
        let first = op_with_clock(author, 1);
        let first_id = first.id;
        history.push(first);
        for i in 2..=4 {
            history.push(op_with_clock(author, i));
        }
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|op| op.id != first_id));
    }

    #[test]
    fn clock_is_elementwise_max_of_all_seen() {
        let p1 = PeerId::new();
        let p2 = PeerId::new();
        let mut history = OpHistory::with_default_cap();
        history.push(op_with_clock(p1, 3));
        history.push(op_with_clock(p2, 1));
        assert_eq!(history.clock().get(p1), 3);
        assert_eq!(history.clock().get(p2), 1);
    }

    #[test]
    fn replay_returns_unseen_ops() {
        let p1 = PeerId::new();
        let mut history = OpHistory::with_default_cap();
        history.push(op_with_clock(p1, 1));
        history.push(op_with_clock(p1, 2));

        let mut lagging = VectorClock::new();
        lagging.increment(p1); // has seen counter 1 only
        let missing = history.ops_since(&lagging);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].clock.get(p1), 2);
    }
}
