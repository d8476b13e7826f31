//! Convergence: two sessions that exchange the same concurrent edits in
//! opposite orders end with identical project state.

use crossbeam_channel::bounded;
use serde_json::json;

use nois_collab::clock::VectorClock;
use nois_collab::op::{OpDomain, Operation, OperationKind};
use nois_collab::session::Session;
use nois_shared::ids::{EntityId, PeerId};
use nois_shared::project::{Clip, Note, Track};

fn session_with_note() -> (Session, EntityId, EntityId) {
    let (tx, _rx) = bounded(1024);
    let mut session = Session::create("conv", "host", None, 8, tx);
    let mut track = Track::default();
    let mut clip = Clip::default();
    let mut note = Note::new(0.0, 1.0, 60, 100);
    note.id = EntityId::new();
    let ids = (clip.id, note.id);
    clip.notes.push(note);
    track.clips.push(clip);
    session.project.tracks.push(track);
    (session, ids.0, ids.1)
}

fn update(
    author: PeerId,
    clip: EntityId,
    note: EntityId,
    key: &str,
    value: serde_json::Value,
    timestamp: i64,
) -> Operation {
    let mut op =
        Operation::new(author, OperationKind::Update, OpDomain::Note, clip).with_item(note);
    op.properties.insert(key.into(), value);
    let mut clock = VectorClock::new();
    clock.increment(author);
    op.clock = clock;
    op.timestamp = timestamp;
    op
}

#[test]
fn concurrent_updates_converge_in_either_order() {
    let p1 = PeerId::new();
    let p2 = PeerId::new();

    // Both projects seeded identically.
    let (mut left, clip, note) = session_with_note();
    let (mut right, _, _) = {
        let (tx, _rx) = bounded(1024);
        let mut session = Session::create("conv", "host", None, 8, tx);
        session.project = left.project.clone();
        (session, clip, note)
    };

    let a = update(p1, clip, note, "velocity", json!(90), 7000);
    let b = update(p2, clip, note, "velocity", json!(40), 7000);

    left.integrate_remote(a.clone());
    left.integrate_remote(b.clone());
    right.integrate_remote(b);
    right.integrate_remote(a);

    let lv = left.project.note_mut(note).unwrap().velocity;
    let rv = right.project.note_mut(note).unwrap().velocity;
    assert_eq!(lv, rv, "both orders must agree on the winner");
}

#[test]
fn disjoint_updates_converge_to_the_merge() {
    let p1 = PeerId::new();
    let p2 = PeerId::new();

    let (mut left, clip, note) = session_with_note();
    let (mut right, _, _) = {
        let (tx, _rx) = bounded(1024);
        let mut session = Session::create("conv", "host", None, 8, tx);
        session.project = left.project.clone();
        (session, clip, note)
    };

    let a = update(p1, clip, note, "velocity", json!(90), 7000);
    let b = update(p2, clip, note, "duration", json!(2.5), 7000);

    left.integrate_remote(a.clone());
    left.integrate_remote(b.clone());
    right.integrate_remote(b);
    right.integrate_remote(a);

    for session in [&mut left, &mut right] {
        let stored = session.project.note_mut(note).unwrap();
        assert_eq!(stored.velocity, 90);
        assert_eq!(stored.duration, 2.5);
    }
}

#[test]
fn delete_update_converges_to_deletion() {
    let p1 = PeerId::new();
    let p2 = PeerId::new();

    let (mut left, clip, note) = session_with_note();
    let (mut right, _, _) = {
        let (tx, _rx) = bounded(1024);
        let mut session = Session::create("conv", "host", None, 8, tx);
        session.project = left.project.clone();
        (session, clip, note)
    };

    let mut delete =
        Operation::new(p1, OperationKind::Delete, OpDomain::Note, clip).with_item(note);
    let mut clock = VectorClock::new();
    clock.increment(p1);
    delete.clock = clock;
    delete.timestamp = 7000;
    let edit = update(p2, clip, note, "velocity", json!(10), 7000);

    left.integrate_remote(delete.clone());
    left.integrate_remote(edit.clone());
    right.integrate_remote(edit);
    right.integrate_remote(delete);

    assert!(left.project.note_mut(note).is_none());
    assert!(right.project.note_mut(note).is_none());
}
