//! Authoritative collaboration service
//!
//! The single source of truth for rosters, locks and mutation ordering.
//! Participants reach it through [`Authority`], which routes every operation
//! to the actor owning the target document.
//!
//! - **registry**: document id → actor, roster, lifecycle
//! - **presence**: cursor positions and throttling
//! - **locks**: exclusive element locks
//! - **broadcaster**: sequencing, fan-out, acknowledgement
//! - **heartbeat**: liveness of silent participants
//! - **document**: synchronous per-document state transitions
//! - **actor**: per-document task serializing operations

pub mod actor;
pub mod broadcaster;
pub mod document;
pub mod heartbeat;
pub mod locks;
pub mod presence;
pub mod registry;
pub mod transport;

pub use broadcaster::Delivery;
pub use document::{DepartureReason, JoinSnapshot};
pub use registry::DocumentRegistry;
pub use transport::{ConnectionId, RecordingTransport, Transport};

use crate::config::AuthorityConfig;
use crate::errors::{Result, SyncError};
use crate::identity::{Credential, Identity, IdentityProvider};
use crate::model::{
    CursorPosition, DocumentId, ElementId, LockEntry, LockOutcome, Mutation, Participant, ParticipantId,
    UnlockOutcome,
};
use crate::observability::telemetry::sanitize_for_log;
use crate::store::DiagramStore;
use actor::Command;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Cloneable entry point to the authority.
#[derive(Clone)]
pub struct Authority {
    inner: Arc<AuthorityInner>,
}

struct AuthorityInner {
    registry: DocumentRegistry,
    identity: Arc<dyn IdentityProvider>,
}

impl Authority {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn DiagramStore>,
        identity: Arc<dyn IdentityProvider>,
        config: AuthorityConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AuthorityInner {
                registry: DocumentRegistry::new(transport, store, config),
                identity,
            }),
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        self.inner.registry.config()
    }

    /// Verify a credential with the identity provider.
    pub fn authenticate(&self, credential: &Credential) -> Result<Identity> {
        self.inner.identity.verify(credential).inspect_err(|e| {
            warn!(
                participant = %sanitize_for_log(credential.participant_id.as_str()),
                error = %e,
                "Credential rejected"
            );
        })
    }

    /// Authenticate and join in one step.
    pub async fn join(
        &self,
        document_id: &DocumentId,
        credential: &Credential,
        connection: ConnectionId,
        resume: bool,
    ) -> Result<JoinSnapshot> {
        let identity = self.authenticate(credential)?;
        self.join_verified(document_id, identity, connection, resume).await
    }

    /// Join with an identity the caller already verified.
    pub async fn join_verified(
        &self,
        document_id: &DocumentId,
        identity: Identity,
        connection: ConnectionId,
        resume: bool,
    ) -> Result<JoinSnapshot> {
        self.inner.registry.join(document_id, identity, connection, resume).await
    }

    pub async fn leave(&self, document_id: &DocumentId, participant_id: &ParticipantId) -> Result<Vec<ElementId>> {
        self.inner.registry.leave(document_id, participant_id).await
    }

    pub async fn disconnect(
        &self,
        document_id: &DocumentId,
        participant_id: &ParticipantId,
        connection: ConnectionId,
    ) -> Result<Vec<ElementId>> {
        self.inner
            .registry
            .disconnect(document_id, participant_id, connection)
            .await
    }

    pub async fn list_participants(&self, document_id: &DocumentId) -> Vec<Participant> {
        self.inner.registry.list_participants(document_id).await
    }

    pub async fn document_ids(&self) -> Vec<DocumentId> {
        self.inner.registry.document_ids().await
    }

    pub async fn try_lock(
        &self,
        document_id: &DocumentId,
        element_id: &ElementId,
        participant_id: &ParticipantId,
    ) -> Result<LockOutcome> {
        self.route(document_id, participant_id, |reply| Command::TryLock {
            element_id: element_id.clone(),
            participant_id: participant_id.clone(),
            reply,
        })
        .await
    }

    pub async fn unlock(
        &self,
        document_id: &DocumentId,
        element_id: &ElementId,
        participant_id: &ParticipantId,
    ) -> Result<UnlockOutcome> {
        self.route(document_id, participant_id, |reply| Command::Unlock {
            element_id: element_id.clone(),
            participant_id: participant_id.clone(),
            reply,
        })
        .await
    }

    /// Accept a mutation and fan it out. Returns its sequence number.
    pub async fn publish(
        &self,
        document_id: &DocumentId,
        origin: &ParticipantId,
        client_seq: u64,
        mutation: Mutation,
    ) -> Result<u64> {
        self.route(document_id, origin, |reply| Command::Publish {
            origin: origin.clone(),
            client_seq,
            mutation,
            reply,
        })
        .await
    }

    /// Returns whether the position was fanned out (false when throttled).
    pub async fn update_cursor(
        &self,
        document_id: &DocumentId,
        participant_id: &ParticipantId,
        position: CursorPosition,
    ) -> Result<bool> {
        self.route(document_id, participant_id, |reply| Command::Cursor {
            participant_id: participant_id.clone(),
            position,
            reply,
        })
        .await
    }

    pub async fn heartbeat(&self, document_id: &DocumentId, participant_id: &ParticipantId) -> Result<()> {
        self.route(document_id, participant_id, |reply| Command::Heartbeat {
            participant_id: participant_id.clone(),
            reply,
        })
        .await
    }

    pub async fn lock_snapshot(&self, document_id: &DocumentId) -> Vec<LockEntry> {
        match self.inner.registry.get(document_id).await {
            Some(handle) => handle
                .request(|reply| Command::LockSnapshot { reply })
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Last known cursor of every participant that has moved one.
    pub async fn cursor_snapshot(&self, document_id: &DocumentId) -> HashMap<ParticipantId, CursorPosition> {
        match self.inner.registry.get(document_id).await {
            Some(handle) => handle
                .request(|reply| Command::CursorSnapshot { reply })
                .await
                .unwrap_or_default(),
            None => HashMap::new(),
        }
    }

    /// Save a document's graph now instead of waiting for the debounce.
    pub async fn flush(&self, document_id: &DocumentId) -> Result<()> {
        match self.inner.registry.get(document_id).await {
            Some(handle) => match handle.request(|reply| Command::Flush { reply }).await {
                Err(SyncError::DocumentRetired) => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }

    /// Flush every document and stop all actors.
    pub async fn shutdown(&self) {
        let documents = self.document_ids().await.len();
        self.inner.registry.shutdown().await;
        info!(documents, "Authority shut down");
    }

    /// Operations on an unknown or retired document fail as `NotJoined`.
    async fn route<T>(
        &self,
        document_id: &DocumentId,
        participant_id: &ParticipantId,
        make: impl FnOnce(actor::Reply<T>) -> Command,
    ) -> Result<T> {
        let not_joined = || SyncError::NotJoined(participant_id.clone());
        let handle = self.inner.registry.get(document_id).await.ok_or_else(not_joined)?;
        match handle.request(make).await {
            Err(SyncError::DocumentRetired) => Err(not_joined()),
            other => other,
        }
    }
}
