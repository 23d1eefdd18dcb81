//! Transport channel boundary
//!
//! The authority addresses participants by id and never sees sockets. A
//! `ConnectionId` distinguishes successive connections of the same
//! participant so a stale socket closing cannot evict a newer one.

use super::broadcaster::Delivery;
use crate::errors::TransportError;
use crate::model::ParticipantId;
use crate::protocol::ServerMessage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, reliable delivery to one participant while its connection lives.
pub trait Transport: Send + Sync {
    fn send(&self, to: &ParticipantId, message: ServerMessage) -> Result<(), TransportError>;
}

/// In-process transport that records every delivery.
///
/// Used to drive an `Authority` without sockets. Participants can be marked
/// unreachable to exercise the transport-loss path.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Delivery>>,
    unreachable: Mutex<HashSet<ParticipantId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, participant_id: impl Into<ParticipantId>, unreachable: bool) {
        let participant_id = participant_id.into();
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(participant_id);
        } else {
            set.remove(&participant_id);
        }
    }

    /// Remove and return everything delivered so far.
    pub fn drain(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Remove and return the messages delivered to one participant, keeping
    /// the rest.
    pub fn take_for(&self, participant_id: &str) -> Vec<ServerMessage> {
        let mut sent = self.sent.lock();
        let (mine, rest): (Vec<Delivery>, Vec<Delivery>) =
            sent.drain(..).partition(|d| d.to.as_str() == participant_id);
        *sent = rest;
        mine.into_iter().map(|d| d.message).collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: &ParticipantId, message: ServerMessage) -> Result<(), TransportError> {
        if self.unreachable.lock().contains(to) {
            return Err(TransportError::Closed(to.clone()));
        }
        self.sent.lock().push(Delivery::new(to.clone(), message));
        Ok(())
    }
}
