//! Operational transform for concurrent edits.
//!
//! `transform` rewrites a pair of concurrent operations so that each
//! side can apply its own operation followed by the transformed remote
//! one and converge on identical state. Winner selection is strict and
//! deterministic so every peer resolves a conflict the same way.

use log::debug;

use crate::op::{OpDomain, Operation, OperationKind};

/// A resolved conflict, reported to the session for surfacing.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub winner: Operation,
    pub loser: Operation,
}

/// Output of transforming a concurrent pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    pub a: Operation,
    pub b: Operation,
    pub conflict: Option<Conflict>,
}

impl TransformResult {
    fn unchanged(a: &Operation, b: &Operation) -> Self {
        Self {
            a: a.clone(),
            b: b.clone(),
            conflict: None,
        }
    }
}

/// Strict winner rule: higher timestamp wins, ties break on the greater
/// `PeerId`. Total and antisymmetric for distinct authors.
pub fn first_wins(a: &Operation, b: &Operation) -> bool {
    match a.timestamp.cmp(&b.timestamp) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.author > b.author,
    }
}

/// Transforms two operations against each other.
///
/// Non-concurrent pairs, different domains, and unrelated entities pass
/// through unchanged.
pub fn transform(a: &Operation, b: &Operation) -> TransformResult {
    if a.is_noop() || b.is_noop() || !a.concurrent_with(b) || a.domain != b.domain {
        return TransformResult::unchanged(a, b);
    }
    match a.domain {
        OpDomain::Note => transform_note(a, b),
        OpDomain::Track => transform_track(a, b),
        OpDomain::Clip => transform_clip(a, b),
        OpDomain::Parameter => transform_parameter(a, b),
    }
}

fn transform_note(a: &Operation, b: &Operation) -> TransformResult {
    if !a.same_entity(b) {
        return TransformResult::unchanged(a, b);
    }
    use OperationKind::*;
    let mut result = TransformResult::unchanged(a, b);
    match (a.kind, b.kind) {
        (Delete, Delete) => {
            result.a.nullify();
            result.b.nullify();
        }
        (Delete, Update) => result.b.nullify(),
        (Update, Delete) => result.a.nullify(),
        (Update, Update) => return transform_update_pair(a, b),
        _ => {}
    }
    result
}

fn transform_clip(a: &Operation, b: &Operation) -> TransformResult {
    if !a.same_entity(b) {
        return TransformResult::unchanged(a, b);
    }
    use OperationKind::*;
    if let (Move, Move) = (a.kind, b.kind) {
        // Two concurrent moves of the same clip: last writer wins.
        let mut result = TransformResult::unchanged(a, b);
        let conflict = if first_wins(a, b) {
            result.b.nullify();
            Conflict {
                winner: a.clone(),
                loser: b.clone(),
            }
        } else {
            result.a.nullify();
            Conflict {
                winner: b.clone(),
                loser: a.clone(),
            }
        };
        debug!("clip move conflict on {}", a.target);
        result.conflict = Some(conflict);
        return result;
    }
    transform_note(a, b)
}

fn transform_track(a: &Operation, b: &Operation) -> TransformResult {
    use OperationKind::*;
    if a.same_entity(b) {
        // Same track: mirror the note rules.
        let mut result = TransformResult::unchanged(a, b);
        match (a.kind, b.kind) {
            (Delete, Delete) => {
                result.a.nullify();
                result.b.nullify();
            }
            (Delete, Update) => result.b.nullify(),
            (Update, Delete) => result.a.nullify(),
            (Update, Update) => return transform_update_pair(a, b),
            _ => {}
        }
        return result;
    }

    // Different tracks in the same list: adjust indices so both orders
    // land every track where the author intended it.
    let (Some(pa), Some(pb)) = (a.position, b.position) else {
        return TransformResult::unchanged(a, b);
    };
    let mut result = TransformResult::unchanged(a, b);
    match (a.kind, b.kind) {
        (Insert, Insert) => {
            if pa == pb {
                if first_wins(a, b) {
                    result.b.position = Some(pb + 1);
                } else {
                    result.a.position = Some(pa + 1);
                }
            } else if pa < pb {
                result.b.position = Some(pb + 1);
            } else {
                result.a.position = Some(pa + 1);
            }
        }
        (Delete, Delete) => {
            if pa < pb {
                result.b.position = Some(pb - 1);
            } else if pb < pa {
                result.a.position = Some(pa - 1);
            }
        }
        (Insert, Delete) => {
            if pb < pa {
                result.a.position = Some(pa - 1);
            } else {
                result.b.position = Some(pb + 1);
            }
        }
        (Delete, Insert) => {
            if pa < pb {
                result.b.position = Some(pb - 1);
            } else {
                result.a.position = Some(pa + 1);
            }
        }
        _ => {}
    }
    result
}

fn transform_parameter(a: &Operation, b: &Operation) -> TransformResult {
    if !a.same_entity(b) {
        return TransformResult::unchanged(a, b);
    }
    // Same target and parameter name: last write wins.
    let mut result = TransformResult::unchanged(a, b);
    let conflict = if first_wins(a, b) {
        result.b.nullify();
        Conflict {
            winner: a.clone(),
            loser: b.clone(),
        }
    } else {
        result.a.nullify();
        Conflict {
            winner: b.clone(),
            loser: a.clone(),
        }
    };
    result.conflict = Some(conflict);
    result
}

/// Update/Update with property sets that may overlap.
fn transform_update_pair(a: &Operation, b: &Operation) -> TransformResult {
    let overlap: Vec<String> = a
        .properties
        .keys()
        .filter(|k| b.properties.contains_key(*k))
        .cloned()
        .collect();
    let mut result = TransformResult::unchanged(a, b);
    if overlap.is_empty() {
        // Disjoint property sets merge naturally when both apply.
        return result;
    }

    let a_is_winner = first_wins(a, b);
    let loser = if a_is_winner {
        &mut result.b
    } else {
        &mut result.a
    };
    for key in &overlap {
        loser.properties.remove(key);
    }
    if loser.properties.is_empty() {
        loser.nullify();
    }
    let conflict = if a_is_winner {
        Conflict {
            winner: a.clone(),
            loser: b.clone(),
        }
    } else {
        Conflict {
            winner: b.clone(),
            loser: a.clone(),
        }
    };
    debug!(
        "update conflict on {} over {:?}, winner {}",
        a.target, overlap, conflict.winner.author
    );
    result.conflict = Some(conflict);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use nois_shared::ids::{EntityId, PeerId};
    use serde_json::json;

    fn concurrent_pair(
        kind_a: OperationKind,
        kind_b: OperationKind,
        domain: OpDomain,
        target: EntityId,
        item: Option<EntityId>,
    ) -> (Operation, Operation) {
        let p1 = PeerId::new();
        let p2 = PeerId::new();
        let mut ca = VectorClock::new();
        ca.increment(p1);
        let mut cb = VectorClock::new();
        cb.increment(p2);

        let mut a = Operation::new(p1, kind_a, domain, target);
        a.item = item;
        a.clock = ca;
        a.timestamp = 1000;
        let mut b = Operation::new(p2, kind_b, domain, target);
        b.item = item;
        b.clock = cb;
        b.timestamp = 1000;
        (a, b)
    }

    #[test]
    fn delete_delete_both_noop() {
        let target = EntityId::new();
        let note = EntityId::new();
        let (a, b) = concurrent_pair(
            OperationKind::Delete,
            OperationKind::Delete,
            OpDomain::Note,
            target,
            Some(note),
        );
        let result = transform(&a, &b);
        assert!(result.a.is_noop());
        assert!(result.b.is_noop());
        assert!(result.conflict.is_none());
    }

    #[test]
    fn delete_beats_update() {
        let target = EntityId::new();
        let note = EntityId::new();
        let (a, b) = concurrent_pair(
            OperationKind::Delete,
            OperationKind::Update,
            OpDomain::Note,
            target,
            Some(note),
        );
        let result = transform(&a, &b);
        assert_eq!(result.a.kind, OperationKind::Delete);
        assert!(result.b.is_noop());
    }

    #[test]
    fn disjoint_updates_merge_without_conflict() {
        let target = EntityId::new();
        let note = EntityId::new();
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Update,
            OperationKind::Update,
            OpDomain::Note,
            target,
            Some(note),
        );
        a.properties.insert("velocity".into(), json!(100));
        b.properties.insert("duration".into(), json!(2.0));
        let result = transform(&a, &b);
        assert_eq!(result.a, a);
        assert_eq!(result.b, b);
        assert!(result.conflict.is_none());
    }

    #[test]
    fn overlapping_updates_keep_winner_props() {
        let target = EntityId::new();
        let note = EntityId::new();
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Update,
            OperationKind::Update,
            OpDomain::Note,
            target,
            Some(note),
        );
        a.properties.insert("velocity".into(), json!(100));
        b.properties.insert("velocity".into(), json!(80));
        b.properties.insert("duration".into(), json!(2.0));

        let result = transform(&a, &b);
        let conflict = result.conflict.expect("conflict reported");
        if first_wins(&a, &b) {
            // Loser kept only its non-overlapping property.
            assert!(!result.b.properties.contains_key("velocity"));
            assert!(result.b.properties.contains_key("duration"));
            assert_eq!(conflict.winner.id, a.id);
        } else {
            assert_eq!(result.a.kind, OperationKind::NoOp);
            assert_eq!(conflict.winner.id, b.id);
        }
    }

    #[test]
    fn loser_losing_all_props_becomes_noop() {
        let target = EntityId::new();
        let note = EntityId::new();
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Update,
            OperationKind::Update,
            OpDomain::Note,
            target,
            Some(note),
        );
        a.properties.insert("velocity".into(), json!(100));
        b.properties.insert("velocity".into(), json!(80));
        let result = transform(&a, &b);
        let loser = if first_wins(&a, &b) {
            &result.b
        } else {
            &result.a
        };
        assert!(loser.is_noop());
    }

    #[test]
    fn winner_rule_is_antisymmetric_and_total() {
        let target = EntityId::new();
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Update,
            OperationKind::Update,
            OpDomain::Note,
            target,
            None,
        );
        // Equal timestamps: PeerId breaks the tie, both directions agree.
        assert_ne!(first_wins(&a, &b), first_wins(&b, &a));
        a.timestamp = 2000;
        b.timestamp = 1000;
        assert!(first_wins(&a, &b));
        assert!(!first_wins(&b, &a));
    }

    #[test]
    fn track_insert_insert_same_position() {
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Insert,
            OperationKind::Insert,
            OpDomain::Track,
            EntityId::new(),
            None,
        );
        b.target = EntityId::new(); // different tracks
        a.position = Some(3);
        b.position = Some(3);
        let result = transform(&a, &b);
        let positions = (result.a.position.unwrap(), result.b.position.unwrap());
        assert!(positions == (3, 4) || positions == (4, 3));
    }

    #[test]
    fn track_insert_insert_shifts_later_position() {
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Insert,
            OperationKind::Insert,
            OpDomain::Track,
            EntityId::new(),
            None,
        );
        b.target = EntityId::new();
        a.position = Some(2);
        b.position = Some(5);
        let result = transform(&a, &b);
        assert_eq!(result.a.position, Some(2));
        assert_eq!(result.b.position, Some(6));
    }

    #[test]
    fn track_insert_delete_shifts() {
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Insert,
            OperationKind::Delete,
            OpDomain::Track,
            EntityId::new(),
            None,
        );
        b.target = EntityId::new();
        a.position = Some(5);
        b.position = Some(2);
        let result = transform(&a, &b);
        assert_eq!(result.a.position, Some(4));
        assert_eq!(result.b.position, Some(2));
    }

    #[test]
    fn clip_move_move_conflict() {
        let clip = EntityId::new();
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Move,
            OperationKind::Move,
            OpDomain::Clip,
            clip,
            Some(clip),
        );
        a.properties.insert("startBeat".into(), json!(4.0));
        b.properties.insert("startBeat".into(), json!(8.0));
        let result = transform(&a, &b);
        let conflict = result.conflict.expect("move conflict");
        assert!(result.a.is_noop() ^ result.b.is_noop());
        assert!(conflict.winner.id == a.id || conflict.winner.id == b.id);
    }

    #[test]
    fn parameter_last_write_wins() {
        let device = EntityId::new();
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Update,
            OperationKind::Update,
            OpDomain::Parameter,
            device,
            None,
        );
        a.properties.insert("parameterName".into(), json!("cutoff"));
        a.properties.insert("value".into(), json!(0.4));
        b.properties.insert("parameterName".into(), json!("cutoff"));
        b.properties.insert("value".into(), json!(0.9));
        a.timestamp = 2000;
        b.timestamp = 1000;
        let result = transform(&a, &b);
        assert_eq!(result.a.kind, OperationKind::Update);
        assert!(result.b.is_noop());
        assert_eq!(result.conflict.unwrap().winner.id, a.id);
    }

    #[test]
    fn different_entities_pass_through() {
        let (a, mut b) = concurrent_pair(
            OperationKind::Update,
            OperationKind::Update,
            OpDomain::Note,
            EntityId::new(),
            Some(EntityId::new()),
        );
        b.item = Some(EntityId::new());
        let result = transform(&a, &b);
        assert_eq!(result.a, a);
        assert_eq!(result.b, b);
    }

    #[test]
    fn sequential_ops_pass_through() {
        let target = EntityId::new();
        let note = EntityId::new();
        let (mut a, mut b) = concurrent_pair(
            OperationKind::Delete,
            OperationKind::Delete,
            OpDomain::Note,
            target,
            Some(note),
        );
        // Make b causally after a.
        b.clock = a.clock.clone();
        b.clock.increment(b.author);
        let result = transform(&a, &b);
        assert_eq!(result.a.kind, OperationKind::Delete);
        assert_eq!(result.b.kind, OperationKind::Delete);
    }
}
