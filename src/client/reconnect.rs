//! Reconnection coordination
//!
//! Tracks the retry budget after a transport interruption and decides which
//! buffered mutations may be replayed once the participant has re-joined.
//! The coordinator only computes delays; the caller owns the timer.

use crate::config::ReconnectConfig;
use crate::model::{ElementId, Mutation, ParticipantId};
use std::collections::BTreeMap;
use std::time::Duration;

/// Exponential backoff with a cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay before attempt `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        let millis = base
            .checked_shl(attempt)
            .filter(|v| v >> attempt == base)
            .unwrap_or(max);
        Duration::from_millis(millis.min(max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    /// Waiting `delay` before attempt number `attempt` (1-based).
    Waiting { attempt: u32, delay: Duration },
    Offline,
}

#[derive(Debug, Clone)]
pub struct ReconnectCoordinator {
    policy: BackoffPolicy,
    failures: u32,
    state: ReconnectState,
}

impl ReconnectCoordinator {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            state: ReconnectState::Idle,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn is_offline(&self) -> bool {
        self.state == ReconnectState::Offline
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The transport dropped. Returns the delay before the first attempt, or
    /// `None` if no attempts are allowed at all.
    pub fn begin(&mut self) -> Option<Duration> {
        self.failures = 0;
        self.schedule()
    }

    /// A reconnect attempt failed. Returns the next delay, or `None` once the
    /// budget is exhausted and the coordinator is `Offline`.
    pub fn attempt_failed(&mut self) -> Option<Duration> {
        if self.is_offline() {
            return None;
        }
        self.failures += 1;
        self.schedule()
    }

    /// Re-join succeeded.
    pub fn succeeded(&mut self) {
        self.failures = 0;
        self.state = ReconnectState::Idle;
    }

    fn schedule(&mut self) -> Option<Duration> {
        if self.failures >= self.policy.max_attempts {
            self.state = ReconnectState::Offline;
            return None;
        }
        let delay = self.policy.delay(self.failures);
        self.state = ReconnectState::Waiting {
            attempt: self.failures + 1,
            delay,
        };
        Some(delay)
    }
}

// ============================================================================
// Replay planning
// ============================================================================

/// A local mutation tagged with its per-session client sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub client_seq: u64,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplayPlan {
    /// Safe to resend, in original order.
    pub replay: Vec<PendingMutation>,
    /// Dropped because someone else now holds the target element's lock.
    pub conflicts: Vec<(PendingMutation, ParticipantId)>,
}

/// Split `pending` against the authoritative lock snapshot taken on re-join.
pub fn plan_replay(
    pending: impl IntoIterator<Item = PendingMutation>,
    locks: &BTreeMap<ElementId, ParticipantId>,
    me: &ParticipantId,
) -> ReplayPlan {
    let mut plan = ReplayPlan::default();
    for item in pending {
        match locks.get(&item.mutation.element_id) {
            Some(holder) if holder != me => plan.conflicts.push((item, holder.clone())),
            _ => plan.replay.push(item),
        }
    }
    plan
}
