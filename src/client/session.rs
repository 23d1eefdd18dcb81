//! Participant-side session state machine
//!
//! `ClientSession` is sans-IO: feed it user actions and `ServerMessage`s, and
//! collect the `ClientMessage`s it wants sent (`take_outbox`) and the
//! `ClientEvent`s it wants shown (`take_events`). It keeps:
//! - views of the roster, cursors and lock table, replaced wholesale by every
//!   join snapshot and patched by broadcast events
//! - the last applied document sequence, so duplicated events are dropped
//! - mutations sent but not yet acknowledged, and mutations buffered while
//!   not joined, both replayed after a re-join
//!
//! Remote mutations reach the local model through the echo suppressor, so a
//! model change listener that checks `EchoSuppressor::is_suppressing` never
//! republishes them.

use super::echo::EchoSuppressor;
use super::events::ClientEvent;
use super::reconnect::{plan_replay, BackoffPolicy, PendingMutation, ReconnectCoordinator};
use crate::authority::presence::CursorThrottle;
use crate::errors::{Result, SyncError};
use crate::identity::Credential;
use crate::model::{
    CursorPosition, DiagramGraph, DocumentId, ElementId, Mutation, MutationEvent, Participant, ParticipantId,
};
use crate::protocol::{ClientMessage, ServerMessage};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Error code the authority uses when it does not list this participant.
const NOT_JOINED: &str = "not_joined";

/// The local diagram model the session keeps in step with the authority.
pub trait DiagramModel {
    fn apply(&mut self, mutation: &Mutation);

    /// Replace the whole model with the authoritative graph.
    fn replace(&mut self, graph: &DiagramGraph);
}

impl DiagramModel for DiagramGraph {
    fn apply(&mut self, mutation: &Mutation) {
        DiagramGraph::apply(self, mutation);
    }

    fn replace(&mut self, graph: &DiagramGraph) {
        *self = graph.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No document selected.
    Disconnected,
    Joining,
    Joined,
    /// Transport dropped; waiting for the next attempt.
    Reconnecting,
    /// Retry budget exhausted. Local edits are kept but not sent.
    Offline,
    /// The authority refused the credential; a new one is required.
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOutcome {
    /// Sent to the authority.
    Sent { client_seq: u64 },
    /// Queued until the session is joined again.
    Buffered { client_seq: u64 },
    /// A remote apply was in progress; not a local change.
    Suppressed,
}

pub struct ClientSession<M: DiagramModel> {
    credential: Credential,
    model: M,
    echo: EchoSuppressor,
    link: LinkState,
    document_id: Option<DocumentId>,
    rejoining: bool,
    roster: BTreeMap<ParticipantId, Participant>,
    cursors: HashMap<ParticipantId, CursorPosition>,
    locks: BTreeMap<ElementId, ParticipantId>,
    last_sequence: u64,
    next_client_seq: u64,
    in_flight: VecDeque<PendingMutation>,
    buffered: VecDeque<PendingMutation>,
    cursor_throttle: CursorThrottle,
    reconnect: ReconnectCoordinator,
    outbox: Vec<ClientMessage>,
    events: Vec<ClientEvent>,
}

impl<M: DiagramModel> ClientSession<M> {
    pub fn new(credential: Credential, model: M, backoff: BackoffPolicy, cursor_throttle: Duration) -> Self {
        Self {
            credential,
            model,
            echo: EchoSuppressor::new(),
            link: LinkState::Disconnected,
            document_id: None,
            rejoining: false,
            roster: BTreeMap::new(),
            cursors: HashMap::new(),
            locks: BTreeMap::new(),
            last_sequence: 0,
            next_client_seq: 1,
            in_flight: VecDeque::new(),
            buffered: VecDeque::new(),
            cursor_throttle: CursorThrottle::new(cursor_throttle),
            reconnect: ReconnectCoordinator::new(backoff),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn participant_id(&self) -> &ParticipantId {
        &self.credential.participant_id
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        self.document_id.as_ref()
    }

    /// Handle to give the model's change listener.
    pub fn echo_suppressor(&self) -> EchoSuppressor {
        self.echo.clone()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.roster.values().cloned().collect()
    }

    pub fn cursors(&self) -> &HashMap<ParticipantId, CursorPosition> {
        &self.cursors
    }

    /// The lock table as last reported by the authority.
    pub fn lock_holder(&self, element_id: &ElementId) -> Option<&ParticipantId> {
        self.locks.get(element_id)
    }

    pub fn locks(&self) -> &BTreeMap<ElementId, ParticipantId> {
        &self.locks
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Mutations sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Mutations waiting for a re-join.
    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn take_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Join `document_id`, leaving the current document first.
    pub fn join(&mut self, document_id: impl Into<DocumentId>) {
        let document_id = document_id.into();
        if self.document_id.as_ref() == Some(&document_id) && self.link == LinkState::Joined {
            return;
        }
        if self.document_id.is_some() {
            self.leave();
        }

        info!(document = %document_id, participant = %self.participant_id(), "Joining document");
        self.document_id = Some(document_id.clone());
        self.rejoining = false;
        self.link = LinkState::Joining;
        self.outbox.push(ClientMessage::Join {
            document_id,
            credential: self.credential.clone(),
            resume: false,
        });
    }

    /// Leave the current document. Unsent local mutations are discarded.
    pub fn leave(&mut self) {
        let Some(document_id) = self.document_id.take() else {
            return;
        };
        if matches!(self.link, LinkState::Joined | LinkState::Joining) {
            self.outbox.push(ClientMessage::Leave {
                document_id: document_id.clone(),
            });
        }
        let unsynced = self.in_flight.len() + self.buffered.len();
        if unsynced > 0 {
            warn!(document = %document_id, unsynced, "Leaving with unsynced changes");
        }
        self.reset_document_state();
        self.link = LinkState::Disconnected;
        self.events.push(ClientEvent::Left { document_id });
    }

    /// Replace the credential, e.g. after the authority reported it expired,
    /// and re-join the current document with it.
    pub fn update_credential(&mut self, credential: Credential) {
        self.credential = credential;
        if self.link == LinkState::Unauthenticated {
            self.send_join();
        }
    }

    // ------------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------------

    /// Report a change the local model just made. Call from the model's
    /// change listener.
    pub fn record_local(&mut self, mutation: Mutation) -> Result<LocalOutcome> {
        if self.echo.is_suppressing() {
            return Ok(LocalOutcome::Suppressed);
        }
        if self.document_id.is_none() {
            return Err(SyncError::NotJoined(self.participant_id().clone()));
        }
        if let Some(holder) = self.locked_by_other(&mutation.element_id) {
            return Err(SyncError::LockDenied {
                element_id: mutation.element_id,
                holder,
            });
        }

        let client_seq = self.next_client_seq;
        self.next_client_seq += 1;
        let pending = PendingMutation { client_seq, mutation };

        if self.link == LinkState::Joined {
            self.send_pending(pending);
            Ok(LocalOutcome::Sent { client_seq })
        } else {
            debug!(client_seq, element = %pending.mutation.element_id, "Buffering local mutation");
            self.buffered.push_back(pending);
            Ok(LocalOutcome::Buffered { client_seq })
        }
    }

    /// Apply a user edit to the local model and publish it.
    ///
    /// Refused without touching the model if another participant holds the
    /// element's lock.
    pub fn edit(&mut self, mutation: Mutation) -> Result<LocalOutcome> {
        if let Some(holder) = self.locked_by_other(&mutation.element_id) {
            return Err(SyncError::LockDenied {
                element_id: mutation.element_id,
                holder,
            });
        }
        self.model.apply(&mutation);
        self.record_local(mutation)
    }

    /// Ask the authority for an element lock. The local view only changes
    /// when the authority answers.
    pub fn request_lock(&mut self, element_id: impl Into<ElementId>) -> Result<()> {
        let document_id = self.joined_document()?;
        self.outbox.push(ClientMessage::Lock {
            document_id,
            element_id: element_id.into(),
        });
        Ok(())
    }

    pub fn release_lock(&mut self, element_id: impl Into<ElementId>) -> Result<()> {
        let document_id = self.joined_document()?;
        let element_id = element_id.into();
        if self.locks.get(&element_id) == Some(&self.credential.participant_id) {
            self.locks.remove(&element_id);
        }
        self.outbox.push(ClientMessage::Unlock {
            document_id,
            element_id,
        });
        Ok(())
    }

    /// Queue a cursor update unless one was sent within the throttle interval.
    pub fn move_cursor(&mut self, position: CursorPosition, now: Instant) -> bool {
        let Ok(document_id) = self.joined_document() else {
            return false;
        };
        if !self.cursor_throttle.should_emit(now) {
            return false;
        }
        self.outbox.push(ClientMessage::Cursor { document_id, position });
        true
    }

    /// Queue a heartbeat ping while joined.
    pub fn heartbeat(&mut self) {
        if self.link == LinkState::Joined {
            self.outbox.push(ClientMessage::Ping);
        }
    }

    // ------------------------------------------------------------------------
    // Transport lifecycle
    // ------------------------------------------------------------------------

    /// The transport dropped. Returns the delay before the first reconnect
    /// attempt, or `None` if the session went straight to `Offline`.
    pub fn transport_lost(&mut self) -> Option<Duration> {
        if self.document_id.is_none() || matches!(self.link, LinkState::Reconnecting | LinkState::Offline) {
            return None;
        }
        warn!(participant = %self.participant_id(), "Transport lost");
        self.outbox.clear();
        self.events.push(ClientEvent::ConnectionLost);

        self.requeue_in_flight();

        self.link = LinkState::Reconnecting;
        let delay = self.reconnect.begin();
        self.after_schedule(delay)
    }

    /// Transport is back: re-join the last known document.
    pub fn transport_restored(&mut self) {
        if self.document_id.is_none() {
            return;
        }
        self.rejoining = true;
        self.send_join();
    }

    /// A reconnect attempt failed. Returns the next delay, or `None` once the
    /// retry budget is exhausted.
    pub fn reconnect_failed(&mut self) -> Option<Duration> {
        if self.link == LinkState::Offline {
            return None;
        }
        self.link = LinkState::Reconnecting;
        let delay = self.reconnect.attempt_failed();
        self.after_schedule(delay)
    }

    /// User-initiated retry from `Offline`: restart the retry budget.
    pub fn retry(&mut self) -> Option<Duration> {
        if self.link != LinkState::Offline {
            return None;
        }
        self.link = LinkState::Reconnecting;
        let delay = self.reconnect.begin();
        self.after_schedule(delay)
    }

    /// The authority dropped this participant while the link stayed up
    /// (heartbeat expiry or a failed delivery). Unacknowledged mutations are
    /// queued again and the document is re-joined.
    fn membership_lost(&mut self) {
        if self.link != LinkState::Joined {
            return;
        }
        warn!(participant = %self.participant_id(), "Authority no longer lists this participant, re-joining");
        self.requeue_in_flight();
        self.rejoining = true;
        self.send_join();
    }

    fn requeue_in_flight(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let element_ids = self.in_flight.iter().map(|p| p.mutation.element_id.clone()).collect();
        self.events.push(ClientEvent::UnsyncedChanges { element_ids });
        while let Some(pending) = self.in_flight.pop_back() {
            self.buffered.push_front(pending);
        }
    }

    fn after_schedule(&mut self, delay: Option<Duration>) -> Option<Duration> {
        match delay {
            Some(delay) => {
                let attempt = self.reconnect.failures() + 1;
                self.events.push(ClientEvent::Reconnecting { attempt, delay });
                Some(delay)
            }
            None => {
                let unsynced = self.buffered.len();
                warn!(participant = %self.participant_id(), unsynced, "Reconnect budget exhausted, offline");
                self.link = LinkState::Offline;
                self.events.push(ClientEvent::Offline { unsynced });
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Pong => {}
            ServerMessage::Error {
                document_id,
                code,
                message,
            } => {
                if document_id.is_some() && document_id != self.document_id {
                    return;
                }
                self.on_error(code, message);
            }
            other => {
                if let Some(document_id) = server_document(&other) {
                    if Some(document_id) != self.document_id.as_ref() {
                        debug!(document = %document_id, "Ignoring message for another document");
                        return;
                    }
                }
                self.on_document_message(other);
            }
        }
    }

    fn on_document_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Joined {
                document_id,
                participants,
                locks,
                sequence,
                graph,
                ..
            } => {
                self.roster = participants
                    .iter()
                    .map(|p| (p.participant_id.clone(), p.clone()))
                    .collect();
                self.cursors = participants
                    .iter()
                    .filter_map(|p| p.cursor_position.map(|c| (p.participant_id.clone(), c)))
                    .collect();
                self.locks = locks
                    .into_iter()
                    .map(|l| (l.element_id, l.holder_participant_id))
                    .collect();
                self.last_sequence = sequence;
                self.link = LinkState::Joined;
                self.reconnect.succeeded();

                let echo = self.echo.clone();
                echo.apply_remote(|| self.model.replace(&graph));

                info!(document = %document_id, participants = participants.len(), sequence, "Joined document");
                self.events.push(ClientEvent::Joined {
                    document_id,
                    participants,
                });
                self.replay_buffered();
            }
            ServerMessage::UserJoined { participant, .. } => {
                self.roster
                    .insert(participant.participant_id.clone(), participant.clone());
                self.events.push(ClientEvent::ParticipantJoined(participant));
            }
            ServerMessage::UserLeft { participant, .. } => {
                self.roster.remove(&participant.participant_id);
                self.cursors.remove(&participant.participant_id);
                self.events.push(ClientEvent::ParticipantLeft(participant));
            }
            ServerMessage::UsersUpdated { participants, .. } => {
                self.roster = participants
                    .iter()
                    .map(|p| (p.participant_id.clone(), p.clone()))
                    .collect();
                self.cursors.retain(|id, _| participants.iter().any(|p| p.participant_id == *id));
                self.events.push(ClientEvent::RosterUpdated(participants));
            }
            ServerMessage::ElementAdded { event }
            | ServerMessage::ElementUpdated { event }
            | ServerMessage::ElementDeleted { event } => self.on_remote_mutation(event),
            ServerMessage::ElementConfirmed {
                element_id,
                client_seq,
                sequence,
                ..
            } => {
                self.in_flight.retain(|p| p.client_seq != client_seq);
                self.last_sequence = self.last_sequence.max(sequence);
                self.events.push(ClientEvent::MutationConfirmed { element_id, sequence });
            }
            ServerMessage::MutationRejected {
                element_id,
                client_seq,
                code,
                message,
                ..
            } => {
                if code == NOT_JOINED {
                    self.membership_lost();
                    return;
                }
                self.in_flight.retain(|p| p.client_seq != client_seq);
                warn!(element = %element_id, code = %code, "Mutation rejected");
                self.events.push(ClientEvent::MutationRejected {
                    element_id,
                    code,
                    message,
                });
            }
            ServerMessage::ElementLocked { element_id, holder, .. } => {
                self.locks.insert(element_id.clone(), holder.clone());
                self.events.push(ClientEvent::ElementLocked { element_id, holder });
            }
            ServerMessage::ElementUnlocked {
                element_id,
                previous_holder,
                ..
            } => {
                if self.locks.get(&element_id) == Some(&previous_holder) {
                    self.locks.remove(&element_id);
                }
                self.events.push(ClientEvent::ElementUnlocked { element_id });
            }
            ServerMessage::ElementLockSuccess { element_id, .. } => {
                self.locks
                    .insert(element_id.clone(), self.credential.participant_id.clone());
                self.events.push(ClientEvent::LockGranted { element_id });
            }
            ServerMessage::ElementLockFailed {
                element_id,
                current_holder,
                ..
            } => {
                self.locks.insert(element_id.clone(), current_holder.clone());
                self.events.push(ClientEvent::LockDenied {
                    element_id,
                    holder: current_holder,
                });
            }
            ServerMessage::CursorMoved {
                participant_id,
                position,
                ..
            } => {
                if let Some(p) = self.roster.get_mut(&participant_id) {
                    p.cursor_position = Some(position);
                }
                self.cursors.insert(participant_id.clone(), position);
                self.events.push(ClientEvent::CursorMoved {
                    participant_id,
                    position,
                });
            }
            ServerMessage::Pong | ServerMessage::Error { .. } => {}
        }
    }

    fn on_remote_mutation(&mut self, event: MutationEvent) {
        if event.sequence_number <= self.last_sequence {
            debug!(sequence = event.sequence_number, last = self.last_sequence, "Dropping stale mutation event");
            return;
        }
        self.last_sequence = event.sequence_number;
        if event.origin_participant_id == self.credential.participant_id {
            return;
        }

        let echo = self.echo.clone();
        echo.apply_remote(|| self.model.apply(&event.mutation));

        let origin_name = self
            .roster
            .get(&event.origin_participant_id)
            .map(|p| p.display_name.clone());
        self.events.push(ClientEvent::RemoteMutation { event, origin_name });
    }

    fn on_error(&mut self, code: String, message: String) {
        if code == NOT_JOINED {
            self.membership_lost();
            return;
        }
        if code == "unauthorized" {
            warn!(participant = %self.participant_id(), "Credential refused, re-authentication required");
            self.link = LinkState::Unauthenticated;
            self.events.push(ClientEvent::AuthenticationRequired { message });
            return;
        }
        self.events.push(ClientEvent::Error { code, message });
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn send_join(&mut self) {
        let Some(document_id) = self.document_id.clone() else {
            return;
        };
        self.link = LinkState::Joining;
        self.outbox.push(ClientMessage::Join {
            document_id,
            credential: self.credential.clone(),
            resume: self.rejoining,
        });
    }

    fn send_pending(&mut self, pending: PendingMutation) {
        if let Some(document_id) = self.document_id.clone() {
            self.outbox.push(ClientMessage::Mutate {
                document_id,
                client_seq: pending.client_seq,
                mutation: pending.mutation.clone(),
            });
            self.in_flight.push_back(pending);
        }
    }

    /// Resend everything buffered while not joined, in original order, except
    /// mutations whose element is now locked by someone else.
    fn replay_buffered(&mut self) {
        if self.buffered.is_empty() {
            return;
        }
        let pending: Vec<PendingMutation> = self.buffered.drain(..).collect();
        let plan = plan_replay(pending, &self.locks, &self.credential.participant_id);

        for (dropped, holder) in plan.conflicts {
            warn!(element = %dropped.mutation.element_id, holder = %holder, "Dropping buffered mutation on conflict");
            self.events.push(ClientEvent::ConflictOnReplay {
                element_id: dropped.mutation.element_id,
                holder,
            });
        }

        let count = plan.replay.len();
        for pending in plan.replay {
            // The join snapshot replaced the model; restore the optimistic edit.
            let echo = self.echo.clone();
            echo.apply_remote(|| self.model.apply(&pending.mutation));
            self.send_pending(pending);
        }
        info!(count, "Replayed buffered mutations");
        self.events.push(ClientEvent::Replayed { count });
    }

    fn locked_by_other(&self, element_id: &ElementId) -> Option<ParticipantId> {
        self.locks
            .get(element_id)
            .filter(|holder| **holder != self.credential.participant_id)
            .cloned()
    }

    fn joined_document(&self) -> Result<DocumentId> {
        match (&self.document_id, self.link) {
            (Some(document_id), LinkState::Joined) => Ok(document_id.clone()),
            _ => Err(SyncError::NotJoined(self.credential.participant_id.clone())),
        }
    }

    fn reset_document_state(&mut self) {
        self.rejoining = false;
        self.roster.clear();
        self.cursors.clear();
        self.locks.clear();
        self.last_sequence = 0;
        self.in_flight.clear();
        self.buffered.clear();
        self.cursor_throttle.reset();
        self.reconnect.succeeded();
    }
}

fn server_document(message: &ServerMessage) -> Option<&DocumentId> {
    match message {
        ServerMessage::Joined { document_id, .. }
        | ServerMessage::UserJoined { document_id, .. }
        | ServerMessage::UserLeft { document_id, .. }
        | ServerMessage::UsersUpdated { document_id, .. }
        | ServerMessage::ElementConfirmed { document_id, .. }
        | ServerMessage::MutationRejected { document_id, .. }
        | ServerMessage::ElementLocked { document_id, .. }
        | ServerMessage::ElementUnlocked { document_id, .. }
        | ServerMessage::ElementLockSuccess { document_id, .. }
        | ServerMessage::ElementLockFailed { document_id, .. }
        | ServerMessage::CursorMoved { document_id, .. } => Some(document_id),
        ServerMessage::ElementAdded { event }
        | ServerMessage::ElementUpdated { event }
        | ServerMessage::ElementDeleted { event } => Some(&event.document_id),
        ServerMessage::Pong => None,
        ServerMessage::Error { document_id, .. } => document_id.as_ref(),
    }
}
