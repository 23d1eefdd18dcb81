//! Document registry and lifecycle tests
//!
//! Tests cover:
//! - roster accuracy across join/leave
//! - retire vs retain when the last participant leaves
//! - persistence on retirement and reload on the next join
//! - heartbeat expiry of silent participants
//! - stale connections not evicting a newer one

use super::harness::{doc, Harness};
use diagramsync::authority::ConnectionId;
use diagramsync::config::AuthorityConfig;
use diagramsync::model::{ElementKind, Mutation};
use diagramsync::protocol::ServerMessage;
use diagramsync::store::MemoryStore;
use diagramsync::SyncError;
use serde_json::json;
use std::time::Duration;

// ============================================================================
// Roster
// ============================================================================

mod roster_tests {
    use super::*;

    #[tokio::test]
    async fn test_list_participants_tracks_joins_and_leaves() {
        let h = Harness::new();
        let mut a = h.peer("A", "Alice");
        let mut b = h.peer("B", "Bob");
        let mut c = h.peer("C", "Carol");
        for p in [&mut a, &mut b, &mut c] {
            p.session.join("D1");
        }
        h.settle(&mut [&mut a, &mut b, &mut c]).await;

        let mut ids: Vec<_> = h
            .authority
            .list_participants(&doc("D1"))
            .await
            .into_iter()
            .map(|p| p.participant_id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C"]);

        b.session.leave();
        h.settle(&mut [&mut a, &mut b, &mut c]).await;
        let ids: Vec<_> = h
            .authority
            .list_participants(&doc("D1"))
            .await
            .into_iter()
            .map(|p| p.participant_id.to_string())
            .collect();
        assert!(!ids.contains(&"B".to_string()));
        assert_eq!(ids.len(), 2);
        assert_eq!(a.session.participants().len(), 2);
        assert_eq!(c.session.participants().len(), 2);
    }

    #[tokio::test]
    async fn test_rejoin_with_same_id_does_not_duplicate() {
        let h = Harness::new();
        let mut a = h.peer("A", "Alice");
        let mut b = h.peer("B", "Bob");
        a.session.join("D1");
        b.session.join("D1");
        h.settle(&mut [&mut a, &mut b]).await;
        b.inbox.clear();

        // Same participant from a second tab/connection.
        let mut a2 = h.peer("A", "Alice");
        a2.session.join("D1");
        h.settle(&mut [&mut b, &mut a2]).await;

        assert_eq!(h.authority.list_participants(&doc("D1")).await.len(), 2);
        assert!(!b
            .inbox
            .iter()
            .any(|m| matches!(m, ServerMessage::UserJoined { .. })));
    }

    #[tokio::test]
    async fn test_switching_documents_leaves_the_previous_one() {
        let h = Harness::new();
        let mut a = h.peer("A", "Alice");
        let mut b = h.peer("B", "Bob");
        a.session.join("D1");
        b.session.join("D1");
        h.settle(&mut [&mut a, &mut b]).await;

        a.session.join("D2");
        h.settle(&mut [&mut a, &mut b]).await;
        assert_eq!(h.authority.list_participants(&doc("D1")).await.len(), 1);
        assert_eq!(h.authority.list_participants(&doc("D2")).await.len(), 1);
        assert_eq!(a.session.document_id(), Some(&doc("D2")));
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle_tests {
    use super::*;

    async fn wait_until_retired(h: &Harness, document: &str) {
        for _ in 0..100 {
            if !h.authority.document_ids().await.contains(&doc(document)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("document {} was not retired", document);
    }

    #[tokio::test]
    async fn test_last_leave_retires_and_persists() {
        let h = Harness::new();
        let mut a = h.peer("A", "Alice");
        a.session.join("D1");
        h.settle(&mut [&mut a]).await;
        a.session
            .edit(Mutation::add("N1", ElementKind::Node, json!({"label": "Actor"})))
            .unwrap();
        h.settle(&mut [&mut a]).await;

        a.session.leave();
        h.settle(&mut [&mut a]).await;
        wait_until_retired(&h, "D1").await;

        let saved = h.store.get(&doc("D1")).expect("graph saved on retirement");
        assert!(saved.contains("Actor"));
    }

    #[tokio::test]
    async fn test_retired_document_reloads_from_store() {
        let h = Harness::new();
        let mut a = h.peer("A", "Alice");
        a.session.join("D1");
        h.settle(&mut [&mut a]).await;
        a.session
            .edit(Mutation::add("N1", ElementKind::Node, json!({"label": "Kept"})))
            .unwrap();
        h.settle(&mut [&mut a]).await;
        a.session.leave();
        h.settle(&mut [&mut a]).await;
        wait_until_retired(&h, "D1").await;

        let mut b = h.peer("B", "Bob");
        b.session.join("D1");
        h.settle(&mut [&mut b]).await;
        let record = b.session.model().graph.get(&"N1".into()).unwrap();
        assert_eq!(record.payload, json!({"label": "Kept"}));
    }

    #[tokio::test]
    async fn test_retained_document_keeps_state() {
        let config = AuthorityConfig {
            retain_empty_documents: true,
            ..AuthorityConfig::default()
        };
        let h = Harness::with_config(config);
        let mut a = h.peer("A", "Alice");
        a.session.join("D1");
        h.settle(&mut [&mut a]).await;
        a.session.edit(Mutation::update("E1", json!({"x": 1}))).unwrap();
        h.settle(&mut [&mut a]).await;
        a.session.leave();
        h.settle(&mut [&mut a]).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.authority.document_ids().await.contains(&doc("D1")));
        assert!(h.authority.list_participants(&doc("D1")).await.is_empty());

        let mut b = h.peer("B", "Bob");
        b.session.join("D1");
        h.settle(&mut [&mut b]).await;
        assert_eq!(b.session.last_sequence(), 1);
    }

    #[tokio::test]
    async fn test_join_loads_seeded_diagram() {
        let store = MemoryStore::new().with_diagram(
            "D9",
            r#"{"elements":{"N1":{"kind":"node","payload":{"label":"Seeded"}}}}"#,
        );
        let h = Harness::with_store(AuthorityConfig::default(), store);
        let mut a = h.peer("A", "Alice");
        a.session.join("D9");
        h.settle(&mut [&mut a]).await;
        assert_eq!(a.session.model().graph.len(), 1);
        assert!(a.session.model().republished.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_diagram_fails_join_without_crashing() {
        let store = MemoryStore::new().with_diagram("BAD", "{not json");
        let h = Harness::with_store(AuthorityConfig::default(), store);
        let mut a = h.peer("A", "Alice");
        a.session.join("BAD");
        h.settle(&mut [&mut a]).await;
        assert!(a
            .inbox
            .iter()
            .any(|m| matches!(m, ServerMessage::Error { code, .. } if code == "store")));

        // Other documents are unaffected.
        a.session.join("D1");
        h.settle(&mut [&mut a]).await;
        assert_eq!(h.authority.list_participants(&doc("D1")).await.len(), 1);
    }
}

// ============================================================================
// Liveness
// ============================================================================

mod liveness_tests {
    use super::*;

    fn fast_heartbeats() -> AuthorityConfig {
        AuthorityConfig {
            heartbeat_interval_ms: 20,
            missed_heartbeats: 2,
            ..AuthorityConfig::default()
        }
    }

    #[tokio::test]
    async fn test_silent_participant_expires_and_releases_locks() {
        let h = Harness::with_config(fast_heartbeats());
        let d1 = doc("D1");
        h.authority
            .join(&d1, &credential_of(&h, "A"), ConnectionId::new(), false)
            .await
            .unwrap();
        h.authority
            .join(&d1, &credential_of(&h, "B"), ConnectionId::new(), false)
            .await
            .unwrap();
        h.authority.try_lock(&d1, &"E1".into(), &"A".into()).await.unwrap();
        h.transport.drain();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            let _ = h.authority.heartbeat(&d1, &"B".into()).await;
        }

        let ids: Vec<_> = h
            .authority
            .list_participants(&d1)
            .await
            .into_iter()
            .map(|p| p.participant_id.to_string())
            .collect();
        assert_eq!(ids, vec!["B"]);
        assert!(h.authority.lock_snapshot(&d1).await.is_empty());
        let to_bob = h.transport.take_for("B");
        assert!(to_bob
            .iter()
            .any(|m| matches!(m, ServerMessage::ElementUnlocked { element_id, .. } if element_id.as_str() == "E1")));
        assert!(to_bob
            .iter()
            .any(|m| matches!(m, ServerMessage::UserLeft { participant, .. } if participant.participant_id.as_str() == "A")));
    }

    #[tokio::test]
    async fn test_stale_connection_does_not_evict_newer_one() {
        let h = Harness::new();
        let d1 = doc("D1");
        let old = ConnectionId::new();
        let new = ConnectionId::new();
        h.authority
            .join(&d1, &credential_of(&h, "A"), old, false)
            .await
            .unwrap();
        h.authority
            .join(&d1, &credential_of(&h, "A"), new, false)
            .await
            .unwrap();

        let released = h.authority.disconnect(&d1, &"A".into(), old).await.unwrap();
        assert!(released.is_empty());
        assert_eq!(h.authority.list_participants(&d1).await.len(), 1);

        h.authority.disconnect(&d1, &"A".into(), new).await.unwrap();
        assert!(h.authority.list_participants(&d1).await.is_empty());
    }

    #[tokio::test]
    async fn test_operations_after_departure_are_not_applied() {
        let h = Harness::new();
        let d1 = doc("D1");
        h.authority
            .join(&d1, &credential_of(&h, "A"), ConnectionId::new(), false)
            .await
            .unwrap();
        h.authority
            .join(&d1, &credential_of(&h, "B"), ConnectionId::new(), false)
            .await
            .unwrap();
        h.authority.leave(&d1, &"A".into()).await.unwrap();

        let err = h
            .authority
            .publish(&d1, &"A".into(), 1, Mutation::update("E1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotJoined(_)));
        let err = h.authority.try_lock(&d1, &"E1".into(), &"A".into()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotJoined(_)));
        assert!(h.authority.lock_snapshot(&d1).await.is_empty());
    }

    fn credential_of(h: &Harness, id: &str) -> diagramsync::Credential {
        h.credential(id, id)
    }
}
