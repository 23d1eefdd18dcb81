//! Wire protocol
//!
//! JSON records exchanged over the transport channel. Every record carries a
//! `type` tag; field names are camelCase so browser clients can consume them
//! unchanged.

use crate::errors::SyncError;
use crate::identity::Credential;
use crate::model::{
    CursorPosition, DiagramGraph, DocumentId, ElementId, LockEntry, Mutation, MutationEvent,
    MutationKind, Participant, ParticipantId,
};
use serde::{Deserialize, Serialize};

/// Participant → authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        document_id: DocumentId,
        credential: Credential,
        /// Set when re-joining after a transport loss, so mutations already
        /// accepted from the previous connection are recognized on replay.
        #[serde(default)]
        resume: bool,
    },
    Leave {
        document_id: DocumentId,
    },
    Mutate {
        document_id: DocumentId,
        client_seq: u64,
        mutation: Mutation,
    },
    Lock {
        document_id: DocumentId,
        element_id: ElementId,
    },
    Unlock {
        document_id: DocumentId,
        element_id: ElementId,
    },
    Cursor {
        document_id: DocumentId,
        position: CursorPosition,
    },
    Ping,
}

impl ClientMessage {
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            ClientMessage::Join { document_id, .. }
            | ClientMessage::Leave { document_id }
            | ClientMessage::Mutate { document_id, .. }
            | ClientMessage::Lock { document_id, .. }
            | ClientMessage::Unlock { document_id, .. }
            | ClientMessage::Cursor { document_id, .. } => Some(document_id),
            ClientMessage::Ping => None,
        }
    }

    pub fn from_json(line: &str) -> Result<Self, SyncError> {
        serde_json::from_str(line).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

/// Authority → participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Reply to a join: authoritative roster, lock table, sequence and graph.
    Joined {
        document_id: DocumentId,
        participant_id: ParticipantId,
        participants: Vec<Participant>,
        locks: Vec<LockEntry>,
        sequence: u64,
        graph: DiagramGraph,
    },
    UserJoined {
        document_id: DocumentId,
        participant: Participant,
    },
    UserLeft {
        document_id: DocumentId,
        participant: Participant,
    },
    UsersUpdated {
        document_id: DocumentId,
        participants: Vec<Participant>,
    },
    ElementAdded {
        event: MutationEvent,
    },
    ElementUpdated {
        event: MutationEvent,
    },
    ElementDeleted {
        event: MutationEvent,
    },
    /// Acknowledgement to the origin that its mutation was sequenced.
    ElementConfirmed {
        document_id: DocumentId,
        element_id: ElementId,
        client_seq: u64,
        sequence: u64,
    },
    MutationRejected {
        document_id: DocumentId,
        element_id: ElementId,
        client_seq: u64,
        code: String,
        message: String,
    },
    ElementLocked {
        document_id: DocumentId,
        element_id: ElementId,
        holder: ParticipantId,
    },
    ElementUnlocked {
        document_id: DocumentId,
        element_id: ElementId,
        previous_holder: ParticipantId,
    },
    ElementLockSuccess {
        document_id: DocumentId,
        element_id: ElementId,
    },
    ElementLockFailed {
        document_id: DocumentId,
        element_id: ElementId,
        current_holder: ParticipantId,
    },
    CursorMoved {
        document_id: DocumentId,
        participant_id: ParticipantId,
        position: CursorPosition,
    },
    Pong,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_id: Option<DocumentId>,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    /// Wrap a sequenced event in the notification matching its kind.
    pub fn for_event(event: MutationEvent) -> Self {
        match event.kind() {
            MutationKind::Add => ServerMessage::ElementAdded { event },
            MutationKind::Update => ServerMessage::ElementUpdated { event },
            MutationKind::Delete => ServerMessage::ElementDeleted { event },
        }
    }

    pub fn mutation_event(&self) -> Option<&MutationEvent> {
        match self {
            ServerMessage::ElementAdded { event }
            | ServerMessage::ElementUpdated { event }
            | ServerMessage::ElementDeleted { event } => Some(event),
            _ => None,
        }
    }

    pub fn error(document_id: Option<DocumentId>, err: &SyncError) -> Self {
        ServerMessage::Error {
            document_id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn from_json(line: &str) -> Result<Self, SyncError> {
        serde_json::from_str(line).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}
