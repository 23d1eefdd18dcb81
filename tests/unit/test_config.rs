//! Configuration and persistence wiring tests
//!
//! Tests cover:
//! - loading a config file from disk
//! - building a file-backed store from config and serving a document from it
//! - client backoff derived from the reconnect section

use diagramsync::authority::{Authority, ConnectionId, RecordingTransport};
use diagramsync::client::BackoffPolicy;
use diagramsync::config::{Config, StoreKind};
use diagramsync::identity::SignedTokenProvider;
use diagramsync::model::{ElementKind, Mutation};
use diagramsync::store;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Config files
// ============================================================================

mod config_file_tests {
    use super::*;

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind = "127.0.0.1:4100"

[authority]
heartbeat_interval_ms = 5000
missed_heartbeats = 2

[reconnect]
max_attempts = 2
base_delay_ms = 250
max_delay_ms = 1000

[identity]
secret = "from-file"
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:4100");
        assert_eq!(config.authority.heartbeat_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 2);
        assert!(config.validate_for_serving().is_ok());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[authority]\nheartbeat_interval_ms = \"often\"").unwrap();
        assert!(Config::load(file.path().to_str()).is_err());
    }

    #[test]
    fn test_backoff_follows_reconnect_section() {
        let config = Config::from_toml(
            r#"
            [reconnect]
            max_attempts = 3
            base_delay_ms = 100
            max_delay_ms = 300
            "#,
        )
        .unwrap();
        let policy = BackoffPolicy::from_config(&config.reconnect);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(300));
        assert_eq!(policy.delay(40), Duration::from_millis(300));
        assert_eq!(policy.max_attempts, 3);
    }
}

// ============================================================================
// File store
// ============================================================================

mod file_store_tests {
    use super::*;

    #[tokio::test]
    async fn test_document_survives_authority_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.kind = StoreKind::File;
        config.store.path = Some(dir.path().to_path_buf());
        config.validate().unwrap();

        let tokens = SignedTokenProvider::new("k", chrono::Duration::hours(1));
        let alice = tokens.issue("A", "Alice");
        let d1 = "D1".into();

        let first = Authority::new(
            Arc::new(RecordingTransport::new()),
            store::from_config(&config.store).unwrap(),
            Arc::new(SignedTokenProvider::new("k", chrono::Duration::hours(1))),
            config.authority.clone(),
        );
        first.join(&d1, &alice, ConnectionId::new(), false).await.unwrap();
        first
            .publish(
                &d1,
                &"A".into(),
                1,
                Mutation::add("N1", ElementKind::Node, json!({"label": "Persisted"})),
            )
            .await
            .unwrap();
        first.shutdown().await;

        let second = Authority::new(
            Arc::new(RecordingTransport::new()),
            store::from_config(&config.store).unwrap(),
            Arc::new(SignedTokenProvider::new("k", chrono::Duration::hours(1))),
            config.authority.clone(),
        );
        let snapshot = second.join(&d1, &alice, ConnectionId::new(), false).await.unwrap();
        let record = snapshot.graph.get(&"N1".into()).unwrap();
        assert_eq!(record.payload, json!({"label": "Persisted"}));
        assert_eq!(record.kind, Some(ElementKind::Node));
    }
}
