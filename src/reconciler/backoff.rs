//! Per-action retry state
//!
//! Failed actions get an attempt count and a next-eligible time. The
//! reconciler consults the table when planning and sleeps until the earliest
//! deadline, so no timers are owned by individual routes.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{ModuleHandle, RouteKey};

/// What a retry entry refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKey {
    Create(RouteKey),
    Remove(ModuleHandle),
}

/// Exponential backoff policy
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retrying after `attempt` failures (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    attempts: u32,
    next_at: Instant,
}

/// Retry bookkeeping for every failing action
#[derive(Debug)]
pub struct BackoffTable {
    policy: Backoff,
    entries: HashMap<ActionKey, Entry>,
}

impl BackoffTable {
    pub fn new(policy: Backoff) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    pub fn policy(&self) -> Backoff {
        self.policy
    }

    /// Register a failure. Returns the attempt count and the delay applied.
    pub fn record_failure(&mut self, key: ActionKey, now: Instant) -> (u32, Duration) {
        let attempts = self.entries.get(&key).map_or(0, |e| e.attempts) + 1;
        let delay = self.policy.delay(attempts);
        self.entries.insert(
            key,
            Entry {
                attempts,
                next_at: now + delay,
            },
        );
        (attempts, delay)
    }

    pub fn reset(&mut self, key: &ActionKey) {
        self.entries.remove(key);
    }

    /// True when the action has no pending backoff at `now`.
    pub fn is_ready(&self, key: &ActionKey, now: Instant) -> bool {
        self.entries.get(key).map_or(true, |e| e.next_at <= now)
    }

    pub fn attempts(&self, key: &ActionKey) -> u32 {
        self.entries.get(key).map_or(0, |e| e.attempts)
    }

    /// Earliest retry time later than `horizon`.
    ///
    /// Entries due at or before `horizon` were visible to the last plan and
    /// do not wake the loop again. The result may already be in the past.
    pub fn next_deadline(&self, horizon: Instant) -> Option<Instant> {
        self.entries
            .values()
            .map(|e| e.next_at)
            .filter(|at| *at > horizon)
            .min()
    }

    /// Drop entries for actions that are no longer relevant.
    pub fn retain(&mut self, mut keep: impl FnMut(&ActionKey) -> bool) {
        self.entries.retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
