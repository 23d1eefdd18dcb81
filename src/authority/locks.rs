//! Element lock table
//!
//! At most one holder per element. No queueing: a denied requester retries or
//! gives up. Releases from anyone but the holder are ignored so that a late
//! unlock cannot clobber a newer holder's lock.

use crate::model::{ElementId, LockEntry, LockOutcome, ParticipantId, UnlockOutcome};
use chrono::Utc;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<ElementId, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&mut self, element_id: &ElementId, participant_id: &ParticipantId) -> LockOutcome {
        match self.locks.get(element_id) {
            Some(entry) if &entry.holder_participant_id == participant_id => {
                LockOutcome::Granted { newly_acquired: false }
            }
            Some(entry) => LockOutcome::Denied {
                current_holder: entry.holder_participant_id.clone(),
            },
            None => {
                self.locks.insert(
                    element_id.clone(),
                    LockEntry {
                        element_id: element_id.clone(),
                        holder_participant_id: participant_id.clone(),
                        acquired_at: Utc::now(),
                    },
                );
                LockOutcome::Granted { newly_acquired: true }
            }
        }
    }

    pub fn unlock(&mut self, element_id: &ElementId, participant_id: &ParticipantId) -> UnlockOutcome {
        match self.locks.get(element_id) {
            Some(entry) if &entry.holder_participant_id == participant_id => {
                self.locks.remove(element_id);
                UnlockOutcome::Released
            }
            _ => UnlockOutcome::Ignored,
        }
    }

    /// Drop every lock held by `participant_id`, returning the freed elements
    /// in a stable order.
    pub fn release_all_for(&mut self, participant_id: &ParticipantId) -> Vec<ElementId> {
        let mut released: Vec<ElementId> = self
            .locks
            .values()
            .filter(|entry| &entry.holder_participant_id == participant_id)
            .map(|entry| entry.element_id.clone())
            .collect();
        released.sort();
        for element_id in &released {
            self.locks.remove(element_id);
        }
        released
    }

    pub fn holder(&self, element_id: &ElementId) -> Option<&ParticipantId> {
        self.locks.get(element_id).map(|entry| &entry.holder_participant_id)
    }

    /// True when the element is locked by someone other than `participant_id`.
    pub fn is_locked_by_other(&self, element_id: &ElementId, participant_id: &ParticipantId) -> bool {
        self.holder(element_id).is_some_and(|holder| holder != participant_id)
    }

    pub fn held_by(&self, participant_id: &ParticipantId) -> Vec<ElementId> {
        let mut held: Vec<ElementId> = self
            .locks
            .values()
            .filter(|entry| &entry.holder_participant_id == participant_id)
            .map(|entry| entry.element_id.clone())
            .collect();
        held.sort();
        held
    }

    pub fn snapshot(&self) -> Vec<LockEntry> {
        let mut entries: Vec<LockEntry> = self.locks.values().cloned().collect();
        entries.sort_by(|a, b| a.element_id.cmp(&b.element_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
