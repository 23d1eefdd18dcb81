//! Document registry
//!
//! Maps each document id to the single actor that owns it and keeps the
//! per-document roster of joined participants.
//!
//! Lifecycle: an actor is spawned on the first join of an unknown document
//! (loading the persisted graph) and retires once its last participant has
//! left, unless `retain_empty_documents` is set. A join that races with a
//! retiring actor is retried against a fresh one.

use super::actor::{self, Command, DocumentHandle};
use super::document::JoinSnapshot;
use super::{ConnectionId, Transport};
use crate::config::AuthorityConfig;
use crate::errors::{Result, SyncError};
use crate::identity::Identity;
use crate::model::{DocumentId, ElementId, Participant, ParticipantId};
use crate::store::DiagramStore;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// How often a join is retried when it lands on a retiring actor.
const MAX_JOIN_ATTEMPTS: usize = 3;

// ============================================================================
// Roster
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub participant: Participant,
    pub connection: ConnectionId,
}

/// Participants currently joined to one document, at most one per id.
#[derive(Debug, Default)]
pub struct Roster {
    members: BTreeMap<ParticipantId, Member>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant, replacing (and returning) any prior
    /// registration under the same id.
    pub fn join(&mut self, participant: Participant, connection: ConnectionId) -> Option<Member> {
        self.members.insert(
            participant.participant_id.clone(),
            Member {
                participant,
                connection,
            },
        )
    }

    pub fn leave(&mut self, participant_id: &ParticipantId) -> Option<Member> {
        self.members.remove(participant_id)
    }

    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.members.contains_key(participant_id)
    }

    pub fn get(&self, participant_id: &ParticipantId) -> Option<&Member> {
        self.members.get(participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &ParticipantId) -> Option<&mut Member> {
        self.members.get_mut(participant_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.keys()
    }

    /// Every participant except `participant_id`.
    pub fn others<'a>(&'a self, participant_id: &'a ParticipantId) -> impl Iterator<Item = &'a ParticipantId> {
        self.members.keys().filter(move |id| *id != participant_id)
    }

    pub fn list(&self) -> Vec<Participant> {
        self.members.values().map(|m| m.participant.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ============================================================================
// Registry
// ============================================================================

pub(crate) type Documents = RwLock<HashMap<DocumentId, DocumentHandle>>;
pub(crate) type HandleMap = Arc<Documents>;

pub struct DocumentRegistry {
    documents: HandleMap,
    generation: AtomicU64,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DiagramStore>,
    config: AuthorityConfig,
}

impl DocumentRegistry {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn DiagramStore>, config: AuthorityConfig) -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(1),
            transport,
            store,
            config,
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Register `identity` in the document, creating it on first join.
    pub async fn join(
        &self,
        document_id: &DocumentId,
        identity: Identity,
        connection: ConnectionId,
        resume: bool,
    ) -> Result<JoinSnapshot> {
        for _ in 0..MAX_JOIN_ATTEMPTS {
            let handle = self.get_or_spawn(document_id).await;
            let identity = identity.clone();
            let result = handle
                .request(|reply| Command::Join {
                    identity,
                    connection,
                    resume,
                    reply,
                })
                .await;
            match result {
                Err(SyncError::DocumentRetired) => {
                    debug!(document = %document_id, "Join hit a retiring document, retrying");
                    self.forget(&handle).await;
                }
                other => return other,
            }
        }
        Err(SyncError::Internal(format!(
            "document {} kept retiring during join",
            document_id
        )))
    }

    /// Remove the participant and release its locks. Returns the freed elements.
    pub async fn leave(&self, document_id: &DocumentId, participant_id: &ParticipantId) -> Result<Vec<ElementId>> {
        let Some(handle) = self.get(document_id).await else {
            return Ok(Vec::new());
        };
        let participant_id = participant_id.clone();
        handle
            .request(|reply| Command::Leave {
                participant_id,
                connection: None,
                reply,
            })
            .await
            .or_else(retired_is_empty)
    }

    /// Transport-level disconnect: leave only if `connection` still owns the
    /// registration, so a stale socket cannot evict a newer re-join.
    pub async fn disconnect(
        &self,
        document_id: &DocumentId,
        participant_id: &ParticipantId,
        connection: ConnectionId,
    ) -> Result<Vec<ElementId>> {
        let Some(handle) = self.get(document_id).await else {
            return Ok(Vec::new());
        };
        let participant_id = participant_id.clone();
        handle
            .request(|reply| Command::Leave {
                participant_id,
                connection: Some(connection),
                reply,
            })
            .await
            .or_else(retired_is_empty)
    }

    pub async fn list_participants(&self, document_id: &DocumentId) -> Vec<Participant> {
        let Some(handle) = self.get(document_id).await else {
            return Vec::new();
        };
        handle
            .request(|reply| Command::ListParticipants { reply })
            .await
            .unwrap_or_default()
    }

    /// Handle for a live document, if any.
    pub(crate) async fn get(&self, document_id: &DocumentId) -> Option<DocumentHandle> {
        self.documents.read().await.get(document_id).cloned()
    }

    pub async fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.documents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn get_or_spawn(&self, document_id: &DocumentId) -> DocumentHandle {
        if let Some(handle) = self.get(document_id).await {
            return handle;
        }

        let mut documents = self.documents.write().await;
        if let Some(handle) = documents.get(document_id) {
            return handle.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = actor::spawn(
            document_id.clone(),
            generation,
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
            Arc::downgrade(&self.documents),
        );
        info!(document = %document_id, generation, "Document session created");
        documents.insert(document_id.clone(), handle.clone());
        handle
    }

    async fn forget(&self, handle: &DocumentHandle) {
        forget_generation(&self.documents, handle.document_id(), handle.generation()).await;
    }

    /// Save every live document and stop its actor.
    pub async fn shutdown(&self) {
        let handles: Vec<DocumentHandle> = self.documents.write().await.drain().map(|(_, h)| h).collect();
        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .map(|handle| async move {
                let (tx, rx) = oneshot::channel();
                if handle.send(Command::Shutdown { reply: tx }).await.is_err() {
                    return;
                }
                if let Err(e) = rx.await.unwrap_or(Ok(())) {
                    warn!(document = %handle.document_id(), error = %e, "Final save failed during shutdown");
                }
            })
            .collect();
        while pending.next().await.is_some() {}
    }
}

/// Unmap `document_id` if it still points at actor `generation`.
pub(crate) async fn forget_generation(
    documents: &Documents,
    document_id: &DocumentId,
    generation: u64,
) {
    let mut documents = documents.write().await;
    if documents
        .get(document_id)
        .is_some_and(|current| current.generation() == generation)
    {
        documents.remove(document_id);
    }
}

fn retired_is_empty<T: Default>(err: SyncError) -> Result<T> {
    match err {
        SyncError::DocumentRetired => Ok(T::default()),
        other => Err(other),
    }
}
