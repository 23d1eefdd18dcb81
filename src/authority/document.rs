//! Per-document state transitions
//!
//! `DocumentState` is the synchronous core of one document session. Every
//! operation validates, mutates the roster / lock table / presence / graph,
//! and queues typed `Delivery` records in an outbox. It performs no I/O; the
//! owning actor drains the outbox into the transport. Time is passed in so
//! heartbeat and throttle behavior is deterministic under test.

use super::broadcaster::{Broadcaster, Delivery, Sequenced};
use super::heartbeat::HeartbeatMonitor;
use super::locks::LockTable;
use super::presence::PresenceTracker;
use super::registry::Roster;
use super::ConnectionId;
use crate::config::AuthorityConfig;
use crate::errors::{Result, SyncError};
use crate::identity::Identity;
use crate::model::{
    CursorPosition, DiagramGraph, DocumentId, ElementId, LockEntry, LockOutcome, Mutation, MutationKind,
    Participant, ParticipantId, UnlockOutcome,
};
use crate::protocol::ServerMessage;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Authoritative view handed to a participant when it joins.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSnapshot {
    pub document_id: DocumentId,
    pub participant_id: ParticipantId,
    pub participants: Vec<Participant>,
    pub locks: Vec<LockEntry>,
    pub sequence: u64,
    pub graph: DiagramGraph,
}

impl JoinSnapshot {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Joined {
            document_id: self.document_id.clone(),
            participant_id: self.participant_id.clone(),
            participants: self.participants.clone(),
            locks: self.locks.clone(),
            sequence: self.sequence,
            graph: self.graph.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureReason {
    Explicit,
    Disconnected,
    HeartbeatTimeout,
    TransportLost,
}

impl DepartureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepartureReason::Explicit => "explicit",
            DepartureReason::Disconnected => "disconnected",
            DepartureReason::HeartbeatTimeout => "heartbeat_timeout",
            DepartureReason::TransportLost => "transport_lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub participant: Participant,
    pub released: Vec<ElementId>,
    pub reason: DepartureReason,
}

pub struct DocumentState {
    document_id: DocumentId,
    roster: Roster,
    locks: LockTable,
    presence: PresenceTracker,
    broadcaster: Broadcaster,
    heartbeats: HeartbeatMonitor,
    graph: DiagramGraph,
    dirty_since: Option<Instant>,
    outbox: Vec<Delivery>,
}

impl DocumentState {
    pub fn new(document_id: DocumentId, graph: DiagramGraph, config: &AuthorityConfig) -> Self {
        Self {
            document_id,
            roster: Roster::new(),
            locks: LockTable::new(),
            presence: PresenceTracker::new(config.cursor_throttle()),
            broadcaster: Broadcaster::new(),
            heartbeats: HeartbeatMonitor::new(config.heartbeat_timeout()),
            graph,
            dirty_since: None,
            outbox: Vec::new(),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    pub fn join(&mut self, identity: &Identity, connection: ConnectionId, resume: bool, now: Instant) -> JoinSnapshot {
        let participant = Participant::new(identity.participant_id.clone(), identity.display_name.clone());
        let participant_id = participant.participant_id.clone();

        let replaced = self.roster.join(participant.clone(), connection);
        if !resume {
            self.broadcaster.reset_origin(&participant_id);
        }
        self.heartbeats.beat(&participant_id, now);

        let snapshot = self.snapshot_for(&participant_id);
        self.push(&participant_id, snapshot.to_message());

        if replaced.is_none() {
            info!(
                document = %self.document_id,
                participant = %participant_id,
                participants = self.roster.len(),
                "Participant joined"
            );
            self.push_to_others(
                &participant_id,
                ServerMessage::UserJoined {
                    document_id: self.document_id.clone(),
                    participant,
                },
            );
        } else {
            debug!(document = %self.document_id, participant = %participant_id, "Participant re-joined");
        }
        self.push_roster_to_others(&participant_id);

        snapshot
    }

    /// Remove the participant, release its locks and notify the rest.
    /// `None` if it was not joined.
    pub fn leave(&mut self, participant_id: &ParticipantId, reason: DepartureReason) -> Option<Departure> {
        let member = self.roster.leave(participant_id)?;
        // Only an explicit leave ends the client's numbering; other departures
        // may be followed by a resuming join.
        if reason == DepartureReason::Explicit {
            self.broadcaster.reset_origin(participant_id);
        }
        let released = self.locks.release_all_for(participant_id);
        self.presence.remove(participant_id);
        self.heartbeats.remove(participant_id);

        for element_id in &released {
            self.push_to_all(ServerMessage::ElementUnlocked {
                document_id: self.document_id.clone(),
                element_id: element_id.clone(),
                previous_holder: participant_id.clone(),
            });
        }
        self.push_to_all(ServerMessage::UserLeft {
            document_id: self.document_id.clone(),
            participant: member.participant.clone(),
        });
        self.push_to_all(ServerMessage::UsersUpdated {
            document_id: self.document_id.clone(),
            participants: self.roster.list(),
        });

        info!(
            document = %self.document_id,
            participant = %participant_id,
            reason = reason.as_str(),
            released = released.len(),
            "Participant left"
        );

        Some(Departure {
            participant: member.participant,
            released,
            reason,
        })
    }

    /// Leave on behalf of a closed connection, only if that connection still
    /// owns the participant's registration.
    pub fn disconnect(&mut self, participant_id: &ParticipantId, connection: ConnectionId) -> Option<Departure> {
        match self.roster.get(participant_id) {
            Some(member) if member.connection == connection => {
                self.leave(participant_id, DepartureReason::Disconnected)
            }
            Some(_) => {
                debug!(
                    document = %self.document_id,
                    participant = %participant_id,
                    "Ignoring disconnect from superseded connection"
                );
                None
            }
            None => None,
        }
    }

    /// Run the leave path for everyone whose heartbeat streak has lapsed.
    pub fn expire_silent(&mut self, now: Instant) -> Vec<Departure> {
        self.heartbeats
            .expired(now)
            .into_iter()
            .filter_map(|id| self.leave(&id, DepartureReason::HeartbeatTimeout))
            .collect()
    }

    pub fn heartbeat(&mut self, participant_id: &ParticipantId, now: Instant) -> Result<()> {
        self.require_joined(participant_id)?;
        self.heartbeats.beat(participant_id, now);
        Ok(())
    }

    pub fn list_participants(&self) -> Vec<Participant> {
        self.roster.list()
    }

    pub fn is_joined(&self, participant_id: &ParticipantId) -> bool {
        self.roster.contains(participant_id)
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    // ------------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------------

    pub fn try_lock(&mut self, element_id: &ElementId, participant_id: &ParticipantId, now: Instant) -> Result<LockOutcome> {
        self.require_joined(participant_id)?;
        self.heartbeats.beat(participant_id, now);

        let outcome = self.locks.try_lock(element_id, participant_id);
        match &outcome {
            LockOutcome::Granted { newly_acquired } => {
                self.push(
                    participant_id,
                    ServerMessage::ElementLockSuccess {
                        document_id: self.document_id.clone(),
                        element_id: element_id.clone(),
                    },
                );
                if *newly_acquired {
                    debug!(document = %self.document_id, element = %element_id, holder = %participant_id, "Element locked");
                    self.push_to_others(
                        participant_id,
                        ServerMessage::ElementLocked {
                            document_id: self.document_id.clone(),
                            element_id: element_id.clone(),
                            holder: participant_id.clone(),
                        },
                    );
                }
            }
            LockOutcome::Denied { current_holder } => {
                debug!(
                    document = %self.document_id,
                    element = %element_id,
                    requester = %participant_id,
                    holder = %current_holder,
                    "Lock denied"
                );
                self.push(
                    participant_id,
                    ServerMessage::ElementLockFailed {
                        document_id: self.document_id.clone(),
                        element_id: element_id.clone(),
                        current_holder: current_holder.clone(),
                    },
                );
            }
        }
        Ok(outcome)
    }

    pub fn unlock(&mut self, element_id: &ElementId, participant_id: &ParticipantId, now: Instant) -> Result<UnlockOutcome> {
        self.require_joined(participant_id)?;
        self.heartbeats.beat(participant_id, now);

        let outcome = self.locks.unlock(element_id, participant_id);
        if outcome == UnlockOutcome::Released {
            self.push_unlocked(element_id, participant_id);
        }
        Ok(outcome)
    }

    pub fn lock_snapshot(&self) -> Vec<LockEntry> {
        self.locks.snapshot()
    }

    pub fn locks_held_by(&self, participant_id: &ParticipantId) -> Vec<ElementId> {
        self.locks.held_by(participant_id)
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Sequence and fan out a mutation. Returns the assigned sequence number.
    pub fn publish(&mut self, origin: &ParticipantId, client_seq: u64, mutation: Mutation, now: Instant) -> Result<u64> {
        let element_id = mutation.element_id.clone();

        self.require_joined(origin)?;
        self.heartbeats.beat(origin, now);

        // An already-accepted mutation is confirmed again even if the element
        // has since been locked by someone else.
        if let Some(sequence) = self.broadcaster.accepted_as(origin, client_seq) {
            self.confirm_duplicate(origin, element_id, client_seq, sequence);
            return Ok(sequence);
        }

        if let Some(holder) = self.locks.holder(&element_id).filter(|h| *h != origin).cloned() {
            let err = SyncError::LockDenied {
                element_id: element_id.clone(),
                holder,
            };
            self.push_rejection(origin, &element_id, client_seq, &err);
            return Err(err);
        }

        let event = match self.broadcaster.sequence(&self.document_id, origin, client_seq, mutation) {
            Sequenced::New(event) => event,
            Sequenced::Duplicate { sequence } => {
                self.confirm_duplicate(origin, element_id, client_seq, sequence);
                return Ok(sequence);
            }
        };

        self.graph.apply(&event.mutation);
        self.dirty_since = Some(now);
        let sequence = event.sequence_number;
        debug!(
            document = %self.document_id,
            origin = %origin,
            element = %element_id,
            kind = event.kind().as_str(),
            sequence,
            "Mutation published"
        );

        let deliveries = Broadcaster::fan_out(&event, client_seq, self.roster.ids());
        self.outbox.extend(deliveries);

        // A deleted element cannot stay locked. The holder hears about it too.
        if event.kind() == MutationKind::Delete && self.locks.unlock(&element_id, origin) == UnlockOutcome::Released {
            self.push_to_all(ServerMessage::ElementUnlocked {
                document_id: self.document_id.clone(),
                element_id: element_id.clone(),
                previous_holder: origin.clone(),
            });
        }

        Ok(sequence)
    }

    pub fn current_sequence(&self) -> u64 {
        self.broadcaster.current_sequence()
    }

    pub fn graph(&self) -> &DiagramGraph {
        &self.graph
    }

    // ------------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------------

    /// Record the cursor; returns whether it was fanned out.
    pub fn update_cursor(&mut self, participant_id: &ParticipantId, position: CursorPosition, now: Instant) -> Result<bool> {
        self.require_joined(participant_id)?;
        self.heartbeats.beat(participant_id, now);

        if let Some(member) = self.roster.get_mut(participant_id) {
            member.participant.cursor_position = Some(position);
        }
        let emit = self.presence.update_cursor(participant_id, position, now);
        if emit {
            self.push_to_others(
                participant_id,
                ServerMessage::CursorMoved {
                    document_id: self.document_id.clone(),
                    participant_id: participant_id.clone(),
                    position,
                },
            );
        }
        Ok(emit)
    }

    pub fn cursor_snapshot(&self) -> std::collections::HashMap<ParticipantId, CursorPosition> {
        self.presence.snapshot()
    }

    // ------------------------------------------------------------------------
    // Persistence bookkeeping
    // ------------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// True once `debounce` has passed since the most recent mutation.
    pub fn autosave_due(&self, now: Instant, debounce: Duration) -> bool {
        self.dirty_since
            .is_some_and(|since| now.saturating_duration_since(since) >= debounce)
    }

    pub fn mark_saved(&mut self) {
        self.dirty_since = None;
    }

    pub fn take_outbox(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn snapshot_for(&self, participant_id: &ParticipantId) -> JoinSnapshot {
        JoinSnapshot {
            document_id: self.document_id.clone(),
            participant_id: participant_id.clone(),
            participants: self.roster.list(),
            locks: self.locks.snapshot(),
            sequence: self.broadcaster.current_sequence(),
            graph: self.graph.clone(),
        }
    }

    fn require_joined(&self, participant_id: &ParticipantId) -> Result<()> {
        if self.roster.contains(participant_id) {
            Ok(())
        } else {
            Err(SyncError::NotJoined(participant_id.clone()))
        }
    }

    fn push(&mut self, to: &ParticipantId, message: ServerMessage) {
        self.outbox.push(Delivery::new(to.clone(), message));
    }

    fn push_to_all(&mut self, message: ServerMessage) {
        let deliveries: Vec<Delivery> = self
            .roster
            .ids()
            .map(|id| Delivery::new(id.clone(), message.clone()))
            .collect();
        self.outbox.extend(deliveries);
    }

    fn push_to_others(&mut self, participant_id: &ParticipantId, message: ServerMessage) {
        let deliveries: Vec<Delivery> = self
            .roster
            .others(participant_id)
            .map(|id| Delivery::new(id.clone(), message.clone()))
            .collect();
        self.outbox.extend(deliveries);
    }

    fn push_roster_to_others(&mut self, participant_id: &ParticipantId) {
        let message = ServerMessage::UsersUpdated {
            document_id: self.document_id.clone(),
            participants: self.roster.list(),
        };
        self.push_to_others(participant_id, message);
    }

    fn push_unlocked(&mut self, element_id: &ElementId, previous_holder: &ParticipantId) {
        self.push_to_others(
            previous_holder,
            ServerMessage::ElementUnlocked {
                document_id: self.document_id.clone(),
                element_id: element_id.clone(),
                previous_holder: previous_holder.clone(),
            },
        );
    }

    fn confirm_duplicate(&mut self, origin: &ParticipantId, element_id: ElementId, client_seq: u64, sequence: u64) {
        debug!(
            document = %self.document_id,
            origin = %origin,
            client_seq,
            sequence,
            "Duplicate mutation re-confirmed"
        );
        self.push(
            origin,
            ServerMessage::ElementConfirmed {
                document_id: self.document_id.clone(),
                element_id,
                client_seq,
                sequence,
            },
        );
    }

    fn push_rejection(&mut self, origin: &ParticipantId, element_id: &ElementId, client_seq: u64, err: &SyncError) {
        debug!(document = %self.document_id, origin = %origin, element = %element_id, error = %err, "Mutation rejected");
        self.push(
            origin,
            ServerMessage::MutationRejected {
                document_id: self.document_id.clone(),
                element_id: element_id.clone(),
                client_seq,
                code: err.code().to_string(),
                message: err.to_string(),
            },
        );
    }
}
