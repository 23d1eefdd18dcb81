//! Element lock tests through the authority
//!
//! Tests cover:
//! - idempotent re-lock by the holder
//! - denial naming the current holder
//! - N held locks produce exactly N unlock notifications on disconnect
//! - unlock by a non-holder is ignored

use super::harness::{doc, Harness};
use diagramsync::authority::ConnectionId;
use diagramsync::model::{CursorPosition, LockOutcome, Mutation, ParticipantId, UnlockOutcome};
use diagramsync::protocol::ServerMessage;
use diagramsync::SyncError;
use serde_json::json;

async fn two_members(h: &Harness) -> (ConnectionId, ConnectionId) {
    let a = ConnectionId::new();
    let b = ConnectionId::new();
    h.authority
        .join(&doc("D1"), &h.credential("A", "Alice"), a, false)
        .await
        .unwrap();
    h.authority
        .join(&doc("D1"), &h.credential("B", "Bob"), b, false)
        .await
        .unwrap();
    h.transport.drain();
    (a, b)
}

#[tokio::test]
async fn test_relock_by_holder_is_idempotent() {
    let h = Harness::new();
    two_members(&h).await;
    let d1 = doc("D1");

    let first = h.authority.try_lock(&d1, &"E1".into(), &"A".into()).await.unwrap();
    assert_eq!(first, LockOutcome::Granted { newly_acquired: true });
    let locked_to_b = h
        .transport
        .take_for("B")
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::ElementLocked { .. }))
        .count();
    assert_eq!(locked_to_b, 1);

    let again = h.authority.try_lock(&d1, &"E1".into(), &"A".into()).await.unwrap();
    assert_eq!(again, LockOutcome::Granted { newly_acquired: false });
    assert!(h
        .transport
        .take_for("B")
        .iter()
        .all(|m| !matches!(m, ServerMessage::ElementLocked { .. })));
    assert_eq!(h.authority.lock_snapshot(&d1).await.len(), 1);
}

#[tokio::test]
async fn test_denial_names_current_holder() {
    let h = Harness::new();
    two_members(&h).await;
    let d1 = doc("D1");
    h.authority.try_lock(&d1, &"E1".into(), &"A".into()).await.unwrap();
    h.transport.drain();

    let denied = h.authority.try_lock(&d1, &"E1".into(), &"B".into()).await.unwrap();
    assert_eq!(
        denied,
        LockOutcome::Denied {
            current_holder: "A".into()
        }
    );
    let to_b = h.transport.take_for("B");
    assert!(matches!(
        &to_b[..],
        [ServerMessage::ElementLockFailed { current_holder, .. }] if current_holder.as_str() == "A"
    ));
    assert!(h.transport.take_for("A").is_empty());
}

#[tokio::test]
async fn test_disconnect_with_n_locks_sends_n_unlocks() {
    let h = Harness::new();
    let (a_conn, _) = two_members(&h).await;
    let d1 = doc("D1");
    for e in ["E1", "E2", "E3", "E4"] {
        h.authority.try_lock(&d1, &e.into(), &"A".into()).await.unwrap();
    }
    h.authority.try_lock(&d1, &"E9".into(), &"B".into()).await.unwrap();
    h.transport.drain();

    let released = h.authority.disconnect(&d1, &"A".into(), a_conn).await.unwrap();
    assert_eq!(released.len(), 4);

    let unlocks = h
        .transport
        .take_for("B")
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::ElementUnlocked { previous_holder, .. } if previous_holder.as_str() == "A"))
        .count();
    assert_eq!(unlocks, 4);

    let remaining = h.authority.lock_snapshot(&d1).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].holder_participant_id.as_str(), "B");
}

#[tokio::test]
async fn test_unlock_by_non_holder_is_ignored() {
    let h = Harness::new();
    two_members(&h).await;
    let d1 = doc("D1");
    h.authority.try_lock(&d1, &"E1".into(), &"A".into()).await.unwrap();
    h.transport.drain();

    let outcome = h.authority.unlock(&d1, &"E1".into(), &"B".into()).await.unwrap();
    assert_eq!(outcome, UnlockOutcome::Ignored);
    assert!(h.transport.is_empty());
    assert_eq!(h.authority.lock_snapshot(&d1).await.len(), 1);

    let outcome = h.authority.unlock(&d1, &"E1".into(), &"A".into()).await.unwrap();
    assert_eq!(outcome, UnlockOutcome::Released);
    assert!(h.authority.lock_snapshot(&d1).await.is_empty());
}

#[tokio::test]
async fn test_publish_on_foreign_lock_is_rejected() {
    let h = Harness::new();
    two_members(&h).await;
    let d1 = doc("D1");
    h.authority.try_lock(&d1, &"E1".into(), &"A".into()).await.unwrap();
    h.transport.drain();

    let err = h
        .authority
        .publish(&d1, &"B".into(), 7, Mutation::update("E1", json!({"x": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::LockDenied { ref holder, .. } if holder.as_str() == "A"));
    assert!(matches!(
        &h.transport.take_for("B")[..],
        [ServerMessage::MutationRejected { client_seq: 7, code, .. }] if code == "lock_denied"
    ));
    assert!(h.transport.take_for("A").is_empty());
}

#[tokio::test]
async fn test_cursor_updates_are_throttled_per_participant() {
    let h = Harness::new();
    two_members(&h).await;
    let d1 = doc("D1");

    let first = h
        .authority
        .update_cursor(&d1, &"A".into(), CursorPosition::new(1.0, 2.0))
        .await
        .unwrap();
    let second = h
        .authority
        .update_cursor(&d1, &"A".into(), CursorPosition::new(3.0, 4.0))
        .await
        .unwrap();
    let other = h
        .authority
        .update_cursor(&d1, &"B".into(), CursorPosition::new(5.0, 6.0))
        .await
        .unwrap();
    assert!(first);
    assert!(!second);
    assert!(other);

    let to_b: Vec<_> = h
        .transport
        .take_for("B")
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::CursorMoved { .. }))
        .collect();
    assert_eq!(to_b.len(), 1);

    // A throttled move still becomes the last known position.
    let cursors = h.authority.cursor_snapshot(&d1).await;
    assert_eq!(cursors.get(&ParticipantId::from("A")), Some(&CursorPosition::new(3.0, 4.0)));
    assert_eq!(cursors.len(), 2);
}
