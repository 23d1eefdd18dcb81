//! Presence tracking
//!
//! Last-known cursor per participant. Ephemeral, never persisted. Cursor
//! fan-out is throttled per participant; the stored position is always the
//! latest even when an emission is skipped.

use crate::model::{CursorPosition, ParticipantId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Allows at most one emission per `interval`.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns true and records the emission if the interval has elapsed.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

#[derive(Debug)]
pub struct PresenceTracker {
    interval: Duration,
    cursors: HashMap<ParticipantId, CursorPosition>,
    throttles: HashMap<ParticipantId, CursorThrottle>,
}

impl PresenceTracker {
    pub fn new(throttle_interval: Duration) -> Self {
        Self {
            interval: throttle_interval,
            cursors: HashMap::new(),
            throttles: HashMap::new(),
        }
    }

    /// Overwrite the participant's cursor. Returns whether the update should
    /// be fanned out now.
    pub fn update_cursor(&mut self, participant_id: &ParticipantId, position: CursorPosition, now: Instant) -> bool {
        self.cursors.insert(participant_id.clone(), position);
        let interval = self.interval;
        self.throttles
            .entry(participant_id.clone())
            .or_insert_with(|| CursorThrottle::new(interval))
            .should_emit(now)
    }

    pub fn cursor(&self, participant_id: &ParticipantId) -> Option<CursorPosition> {
        self.cursors.get(participant_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<ParticipantId, CursorPosition> {
        self.cursors.clone()
    }

    pub fn remove(&mut self, participant_id: &ParticipantId) {
        self.cursors.remove(participant_id);
        self.throttles.remove(participant_id);
    }
}
