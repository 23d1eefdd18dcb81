//! Core data model
//!
//! Identifiers and records shared by the authority, the client session and
//! the wire protocol:
//! - Document / participant / element identifiers
//! - Participants with their cursor position
//! - Mutations and the sequenced events the authority fans out
//! - Lock entries and lock outcomes
//! - The opaque diagram graph kept in memory per document

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable identifier of one collaboratively edited diagram.
    DocumentId
);
string_id!(
    /// Identifier of one participant session, issued by the identity provider.
    ParticipantId
);
string_id!(
    /// Identifier of a diagram element (node or edge).
    ElementId
);

// ============================================================================
// Participants & presence
// ============================================================================

/// Canvas coordinates of a participant's pointer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A connected user's session within one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub cursor_position: Option<CursorPosition>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(participant_id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            cursor_position: None,
            joined_at: Utc::now(),
        }
    }
}

// ============================================================================
// Elements & mutations
// ============================================================================

/// Shape class of a diagram element. The core never looks further inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Node,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Add,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Add => "add",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

/// One add/update/delete against a single element, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub kind: MutationKind,
    pub element_id: ElementId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_kind: Option<ElementKind>,
    #[serde(default)]
    pub payload: Value,
}

impl Mutation {
    pub fn add(element_id: impl Into<ElementId>, element_kind: ElementKind, payload: Value) -> Self {
        Self {
            kind: MutationKind::Add,
            element_id: element_id.into(),
            element_kind: Some(element_kind),
            payload,
        }
    }

    pub fn update(element_id: impl Into<ElementId>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Update,
            element_id: element_id.into(),
            element_kind: None,
            payload,
        }
    }

    pub fn delete(element_id: impl Into<ElementId>) -> Self {
        Self {
            kind: MutationKind::Delete,
            element_id: element_id.into(),
            element_kind: None,
            payload: Value::Null,
        }
    }
}

/// A mutation tagged by the authority with its origin and document sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub document_id: DocumentId,
    pub origin_participant_id: ParticipantId,
    pub sequence_number: u64,
    #[serde(flatten)]
    pub mutation: Mutation,
}

impl MutationEvent {
    pub fn kind(&self) -> MutationKind {
        self.mutation.kind
    }

    pub fn element_id(&self) -> &ElementId {
        &self.mutation.element_id
    }
}

// ============================================================================
// Locks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub element_id: ElementId,
    pub holder_participant_id: ParticipantId,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// `newly_acquired` is false when the caller already held the lock.
    Granted { newly_acquired: bool },
    Denied { current_holder: ParticipantId },
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released,
    Ignored,
}

// ============================================================================
// Diagram graph
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ElementKind>,
    pub payload: Value,
}

/// In-memory copy of one diagram: opaque element payloads keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagramGraph {
    #[serde(default)]
    pub elements: BTreeMap<ElementId, ElementRecord>,
}

impl DiagramGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, mutation: &Mutation) {
        match mutation.kind {
            MutationKind::Add => {
                self.elements.insert(
                    mutation.element_id.clone(),
                    ElementRecord {
                        kind: mutation.element_kind,
                        payload: mutation.payload.clone(),
                    },
                );
            }
            MutationKind::Update => {
                let record = self
                    .elements
                    .entry(mutation.element_id.clone())
                    .or_insert_with(|| ElementRecord {
                        kind: mutation.element_kind,
                        payload: Value::Null,
                    });
                merge_payload(&mut record.payload, &mutation.payload);
            }
            MutationKind::Delete => {
                self.elements.remove(&mutation.element_id);
            }
        }
    }

    pub fn get(&self, element_id: &ElementId) -> Option<&ElementRecord> {
        self.elements.get(element_id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(blob: &str) -> serde_json::Result<Self> {
        serde_json::from_str(blob)
    }
}

/// Shallow merge: top-level keys of an object patch overwrite the target's;
/// any non-object patch replaces the target outright.
fn merge_payload(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(changes)) => {
            for (key, value) in changes {
                existing.insert(key.clone(), value.clone());
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
