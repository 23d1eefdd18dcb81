//! End-to-end collaboration scenarios
//!
//! Two or three client sessions wired to one authority through the in-process
//! harness. Covers:
//! - lock hand-over when the holder disconnects
//! - exactly-once delivery of a remote update without re-emission
//! - offline buffering and ordered replay
//! - replay conflicts when an element changed ownership

use super::harness::{doc, Harness};
use diagramsync::client::{ClientEvent, LinkState, LocalOutcome};
use diagramsync::model::{ElementKind, LockOutcome, Mutation, MutationKind};
use diagramsync::protocol::ServerMessage;
use serde_json::json;

#[tokio::test]
async fn test_lock_passes_to_waiting_participant_after_holder_disconnects() {
    let h = Harness::new();
    let d1 = doc("D1");
    let mut a = h.peer("A", "Alice");
    let mut b = h.peer("B", "Bob");

    a.session.join("D1");
    h.settle(&mut [&mut a]).await;
    assert_eq!(a.session.link_state(), LinkState::Joined);
    a.session.request_lock("E1").unwrap();
    h.settle(&mut [&mut a]).await;
    assert_eq!(a.session.lock_holder(&"E1".into()), Some(&"A".into()));

    b.session.join("D1");
    h.settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.session.lock_holder(&"E1".into()), Some(&"A".into()));

    let denied = h.authority.try_lock(&d1, &"E1".into(), &"B".into()).await.unwrap();
    assert_eq!(
        denied,
        LockOutcome::Denied {
            current_holder: "A".into()
        }
    );

    h.drop_link(&mut a).await;
    h.settle(&mut [&mut a, &mut b]).await;
    assert!(b
        .inbox
        .iter()
        .any(|m| matches!(m, ServerMessage::ElementUnlocked { element_id, .. } if element_id.as_str() == "E1")));
    assert_eq!(b.session.lock_holder(&"E1".into()), None);
    assert_eq!(b.session.participants().len(), 1);

    let granted = h.authority.try_lock(&d1, &"E1".into(), &"B".into()).await.unwrap();
    assert!(granted.is_granted());
}

#[tokio::test]
async fn test_remote_update_delivered_once_and_not_reemitted() {
    let h = Harness::new();
    let mut a = h.peer("A", "Alice");
    let mut b = h.peer("B", "Bob");
    a.session.join("D1");
    b.session.join("D1");
    h.settle(&mut [&mut a, &mut b]).await;
    b.inbox.clear();

    let outcome = a
        .session
        .edit(Mutation::update("E1", json!({"x": 10, "y": 20})))
        .unwrap();
    assert_eq!(outcome, LocalOutcome::Sent { client_seq: 1 });
    h.settle(&mut [&mut a, &mut b]).await;

    let updates: Vec<_> = b
        .inbox
        .iter()
        .filter_map(|m| match m {
            ServerMessage::ElementUpdated { event } => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].mutation.payload, json!({"x": 10, "y": 20}));
    assert_eq!(updates[0].origin_participant_id.as_str(), "A");

    // The apply reached B's model but never its change listener.
    let record = b.session.model().graph.get(&"E1".into()).unwrap();
    assert_eq!(record.payload, json!({"x": 10, "y": 20}));
    assert!(b.session.model().republished.is_empty());
    assert!(b.published.is_empty());

    // One publish in total across both peers.
    assert_eq!(a.published.len() + b.published.len(), 1);
    assert_eq!(a.session.in_flight(), 0);
    assert!(!a
        .inbox
        .iter()
        .any(|m| matches!(m, ServerMessage::ElementUpdated { .. })));
}

#[tokio::test]
async fn test_offline_edits_replay_in_order() {
    let h = Harness::new();
    let mut a = h.peer("A", "Alice");
    let mut b = h.peer("B", "Bob");
    a.session.join("D1");
    b.session.join("D1");
    h.settle(&mut [&mut a, &mut b]).await;

    h.drop_link(&mut a).await;
    h.settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.session.link_state(), LinkState::Reconnecting);

    for x in [1, 2, 3] {
        let outcome = a.session.edit(Mutation::update("E2", json!({ "x": x }))).unwrap();
        assert!(matches!(outcome, LocalOutcome::Buffered { .. }));
    }
    assert_eq!(a.session.buffered(), 3);
    b.inbox.clear();

    h.restore_link(&mut a);
    h.settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.session.link_state(), LinkState::Joined);
    assert_eq!(a.session.buffered(), 0);
    assert_eq!(a.session.in_flight(), 0);

    let seen: Vec<_> = b
        .inbox
        .iter()
        .filter_map(|m| m.mutation_event())
        .filter(|e| e.mutation.element_id.as_str() == "E2")
        .map(|e| e.mutation.payload["x"].as_i64().unwrap())
        .collect();
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(
        b.session.model().graph.get(&"E2".into()).unwrap().payload,
        json!({"x": 3})
    );
    assert!(a
        .session
        .take_events()
        .iter()
        .any(|e| matches!(e, ClientEvent::Replayed { count: 3 })));
}

#[tokio::test]
async fn test_replay_conflict_is_reported_not_sent() {
    let h = Harness::new();
    let mut a = h.peer("A", "Alice");
    let mut b = h.peer("B", "Bob");
    a.session.join("D1");
    b.session.join("D1");
    h.settle(&mut [&mut a, &mut b]).await;

    h.drop_link(&mut a).await;
    h.settle(&mut [&mut a, &mut b]).await;
    a.session.edit(Mutation::update("E3", json!({"x": 1}))).unwrap();
    a.session.edit(Mutation::update("E4", json!({"x": 1}))).unwrap();

    b.session.request_lock("E3").unwrap();
    h.settle(&mut [&mut a, &mut b]).await;
    a.session.take_events();
    b.inbox.clear();

    h.restore_link(&mut a);
    h.settle(&mut [&mut a, &mut b]).await;

    let events = a.session.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::ConflictOnReplay { element_id, holder } if element_id.as_str() == "E3" && holder.as_str() == "B"
    )));
    assert!(events.iter().any(|e| matches!(e, ClientEvent::Replayed { count: 1 })));
    let replayed: Vec<_> = b.inbox.iter().filter_map(|m| m.mutation_event()).collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].mutation.element_id.as_str(), "E4");
}

#[tokio::test]
async fn test_late_joiner_sees_current_graph_and_sequence() {
    let h = Harness::new();
    let mut a = h.peer("A", "Alice");
    a.session.join("D1");
    h.settle(&mut [&mut a]).await;
    a.session
        .edit(Mutation::add("N1", ElementKind::Node, json!({"label": "Start"})))
        .unwrap();
    a.session
        .edit(Mutation::add("N2", ElementKind::Node, json!({"label": "End"})))
        .unwrap();
    a.session.edit(Mutation::delete("N1")).unwrap();
    h.settle(&mut [&mut a]).await;

    let mut c = h.peer("C", "Carol");
    c.session.join("D1");
    h.settle(&mut [&mut a, &mut c]).await;

    assert_eq!(c.session.last_sequence(), 3);
    assert_eq!(c.session.model().graph.len(), 1);
    assert!(c.session.model().graph.get(&"N2".into()).is_some());
    assert!(c.session.model().republished.is_empty());
    assert!(a
        .session
        .take_events()
        .iter()
        .any(|e| matches!(e, ClientEvent::ParticipantJoined(p) if p.display_name == "Carol")));
}

#[tokio::test]
async fn test_edit_on_element_locked_by_other_is_refused_locally() {
    let h = Harness::new();
    let mut a = h.peer("A", "Alice");
    let mut b = h.peer("B", "Bob");
    a.session.join("D1");
    b.session.join("D1");
    h.settle(&mut [&mut a, &mut b]).await;

    a.session.request_lock("E1").unwrap();
    h.settle(&mut [&mut a, &mut b]).await;

    let err = b.session.edit(Mutation::update("E1", json!({"x": 5}))).unwrap_err();
    assert_eq!(err.code(), "lock_denied");
    assert!(b.session.model().graph.get(&"E1".into()).is_none());
    h.settle(&mut [&mut a, &mut b]).await;
    assert!(b.published.is_empty());
}

#[tokio::test]
async fn test_delete_releases_lock_for_everyone() {
    let h = Harness::new();
    let mut a = h.peer("A", "Alice");
    let mut b = h.peer("B", "Bob");
    a.session.join("D1");
    b.session.join("D1");
    h.settle(&mut [&mut a, &mut b]).await;

    a.session.request_lock("E1").unwrap();
    h.settle(&mut [&mut a, &mut b]).await;
    a.session.edit(Mutation::delete("E1")).unwrap();
    h.settle(&mut [&mut a, &mut b]).await;

    let kinds: Vec<_> = b
        .inbox
        .iter()
        .filter_map(|m| m.mutation_event())
        .map(|e| e.kind())
        .collect();
    assert_eq!(kinds, vec![MutationKind::Delete]);
    assert_eq!(b.session.lock_holder(&"E1".into()), None);
    assert_eq!(a.session.lock_holder(&"E1".into()), None);
    assert!(h.authority.lock_snapshot(&doc("D1")).await.is_empty());
}
