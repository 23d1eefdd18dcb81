//! Participant liveness
//!
//! A participant whose process dies without a clean disconnect would otherwise
//! hold its locks forever. Each participant's last sign of life is recorded;
//! silence longer than the timeout (a streak of missed heartbeats) is reported
//! so the document can run the normal leave path.

use crate::model::ParticipantId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    last_seen: HashMap<ParticipantId, Instant>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: HashMap::new(),
        }
    }

    pub fn beat(&mut self, participant_id: &ParticipantId, now: Instant) {
        self.last_seen.insert(participant_id.clone(), now);
    }

    pub fn remove(&mut self, participant_id: &ParticipantId) {
        self.last_seen.remove(participant_id);
    }

    pub fn last_seen(&self, participant_id: &ParticipantId) -> Option<Instant> {
        self.last_seen.get(participant_id).copied()
    }

    /// Participants silent for longer than the timeout, in stable order.
    pub fn expired(&self, now: Instant) -> Vec<ParticipantId> {
        let mut expired: Vec<ParticipantId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        expired
    }
}
