//! Typed notifications from the client session to the presentation layer
//!
//! The session never renders anything. It emits `ClientEvent`s; a UI decides
//! how to show them. `notification()` gives the default toast for events a
//! user should see.

use crate::model::{CursorPosition, DocumentId, ElementId, MutationEvent, MutationKind, Participant, ParticipantId};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Joined {
        document_id: DocumentId,
        participants: Vec<Participant>,
    },
    Left {
        document_id: DocumentId,
    },
    ParticipantJoined(Participant),
    ParticipantLeft(Participant),
    RosterUpdated(Vec<Participant>),
    RemoteMutation {
        event: MutationEvent,
        origin_name: Option<String>,
    },
    MutationConfirmed {
        element_id: ElementId,
        sequence: u64,
    },
    MutationRejected {
        element_id: ElementId,
        code: String,
        message: String,
    },
    LockGranted {
        element_id: ElementId,
    },
    LockDenied {
        element_id: ElementId,
        holder: ParticipantId,
    },
    ElementLocked {
        element_id: ElementId,
        holder: ParticipantId,
    },
    ElementUnlocked {
        element_id: ElementId,
    },
    CursorMoved {
        participant_id: ParticipantId,
        position: CursorPosition,
    },
    ConnectionLost,
    /// Sent but never acknowledged when the transport dropped; queued for replay.
    UnsyncedChanges {
        element_ids: Vec<ElementId>,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Replayed {
        count: usize,
    },
    ConflictOnReplay {
        element_id: ElementId,
        holder: ParticipantId,
    },
    Offline {
        unsynced: usize,
    },
    AuthenticationRequired {
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub text: String,
    pub duration: Duration,
}

const USER_NOTICE: Duration = Duration::from_millis(3000);
const ELEMENT_NOTICE: Duration = Duration::from_millis(2000);

impl Notification {
    fn user(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            duration: USER_NOTICE,
        }
    }

    fn element(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            duration: ELEMENT_NOTICE,
        }
    }
}

impl ClientEvent {
    /// Default user-facing toast, if the event deserves one.
    pub fn notification(&self) -> Option<Notification> {
        let n = match self {
            ClientEvent::ParticipantJoined(p) => {
                Notification::user(Severity::Info, format!("{} joined the diagram", p.display_name))
            }
            ClientEvent::ParticipantLeft(p) => {
                Notification::user(Severity::Info, format!("{} left the diagram", p.display_name))
            }
            ClientEvent::RemoteMutation { event, origin_name } => {
                let who = origin_name
                    .clone()
                    .unwrap_or_else(|| event.origin_participant_id.to_string());
                let verb = match event.kind() {
                    MutationKind::Add => "added",
                    MutationKind::Update => "updated",
                    MutationKind::Delete => "deleted",
                };
                Notification::element(Severity::Info, format!("{} {} {}", who, verb, event.element_id()))
            }
            ClientEvent::LockDenied { element_id, holder } => {
                Notification::element(Severity::Warning, format!("{} is locked by {}", element_id, holder))
            }
            ClientEvent::MutationRejected { element_id, message, .. } => Notification::element(
                Severity::Error,
                format!("Change to {} was rejected: {}", element_id, message),
            ),
            ClientEvent::ConnectionLost => Notification::user(Severity::Warning, "Connection lost, reconnecting"),
            ClientEvent::UnsyncedChanges { element_ids } => Notification::user(
                Severity::Warning,
                format!("{} change(s) not yet confirmed, will retry", element_ids.len()),
            ),
            ClientEvent::Replayed { count } if *count > 0 => {
                Notification::user(Severity::Success, format!("Reconnected, {} change(s) synced", count))
            }
            ClientEvent::ConflictOnReplay { element_id, holder } => Notification::user(
                Severity::Error,
                format!("Offline change to {} discarded: now locked by {}", element_id, holder),
            ),
            ClientEvent::Offline { .. } => {
                Notification::user(Severity::Warning, "Working offline, changes are not being saved")
            }
            ClientEvent::AuthenticationRequired { .. } => {
                Notification::user(Severity::Error, "Session expired, please sign in again")
            }
            ClientEvent::Error { message, .. } => Notification::user(Severity::Error, message.clone()),
            _ => return None,
        };
        Some(n)
    }
}
