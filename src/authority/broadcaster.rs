//! Mutation sequencing and fan-out
//!
//! Every accepted mutation gets the document's next sequence number and goes
//! to every participant except its origin; the origin gets a confirmation
//! instead. Origins number their own mutations (`client_seq`) so a mutation
//! replayed after a dropped acknowledgement is confirmed again without being
//! fanned out twice.

use crate::model::{DocumentId, Mutation, MutationEvent, ParticipantId};
use crate::protocol::ServerMessage;
use std::collections::{HashMap, VecDeque};

/// How many recent `(client_seq, sequence)` pairs are kept per origin.
/// A duplicate older than this window is still recognized through the
/// origin's high-water mark, but is confirmed with the current document
/// sequence instead of the one it was first accepted under.
const RECENT_ACCEPTED: usize = 64;

/// A message addressed to one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ParticipantId,
    pub message: ServerMessage,
}

impl Delivery {
    pub fn new(to: ParticipantId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sequenced {
    New(MutationEvent),
    /// Already accepted earlier under `sequence`.
    Duplicate { sequence: u64 },
}

#[derive(Debug, Default)]
struct AcceptedLog {
    highest_client_seq: u64,
    recent: VecDeque<(u64, u64)>,
}

impl AcceptedLog {
    fn record(&mut self, client_seq: u64, sequence: u64) {
        self.highest_client_seq = client_seq;
        self.recent.push_back((client_seq, sequence));
        if self.recent.len() > RECENT_ACCEPTED {
            self.recent.pop_front();
        }
    }

    fn lookup(&self, client_seq: u64) -> Option<u64> {
        self.recent
            .iter()
            .find(|(c, _)| *c == client_seq)
            .map(|(_, s)| *s)
    }
}

#[derive(Debug, Default)]
pub struct Broadcaster {
    sequence: u64,
    accepted: HashMap<ParticipantId, AcceptedLog>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sequence number assigned in this document.
    pub fn current_sequence(&self) -> u64 {
        self.sequence
    }

    /// Forget an origin's acceptance history (a fresh client session restarts
    /// its numbering).
    pub fn reset_origin(&mut self, origin: &ParticipantId) {
        self.accepted.remove(origin);
    }

    /// Number of origins with an acceptance history.
    pub fn tracked_origins(&self) -> usize {
        self.accepted.len()
    }

    /// The sequence a `client_seq` from `origin` was already accepted under,
    /// if it was. `client_seq == 0` opts out of deduplication.
    pub fn accepted_as(&self, origin: &ParticipantId, client_seq: u64) -> Option<u64> {
        if client_seq == 0 {
            return None;
        }
        let log = self.accepted.get(origin)?;
        (client_seq <= log.highest_client_seq).then(|| log.lookup(client_seq).unwrap_or(self.sequence))
    }

    pub fn sequence(
        &mut self,
        document_id: &DocumentId,
        origin: &ParticipantId,
        client_seq: u64,
        mutation: Mutation,
    ) -> Sequenced {
        if let Some(sequence) = self.accepted_as(origin, client_seq) {
            return Sequenced::Duplicate { sequence };
        }

        self.sequence += 1;
        if client_seq != 0 {
            self.accepted
                .entry(origin.clone())
                .or_default()
                .record(client_seq, self.sequence);
        }
        Sequenced::New(MutationEvent {
            document_id: document_id.clone(),
            origin_participant_id: origin.clone(),
            sequence_number: self.sequence,
            mutation,
        })
    }

    /// Deliveries for an accepted event: the notification to every other
    /// participant, then the confirmation to the origin.
    pub fn fan_out<'a>(
        event: &MutationEvent,
        client_seq: u64,
        participants: impl IntoIterator<Item = &'a ParticipantId>,
    ) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> = participants
            .into_iter()
            .filter(|p| **p != event.origin_participant_id)
            .map(|p| Delivery::new(p.clone(), ServerMessage::for_event(event.clone())))
            .collect();
        deliveries.push(Delivery::new(
            event.origin_participant_id.clone(),
            ServerMessage::ElementConfirmed {
                document_id: event.document_id.clone(),
                element_id: event.element_id().clone(),
                client_seq,
                sequence: event.sequence_number,
            },
        ));
        deliveries
    }
}
