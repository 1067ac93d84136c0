//! Client-side lock tracking for peek-locked deliveries.
//!
//! Every message handed to the caller is recorded against its lock token. A
//! settlement first *claims* the record, which removes it atomically, so two
//! concurrent settlements of the same token can never both proceed. A record
//! whose deadline has passed can no longer be claimed.
//!
//! Records are keyed by lock token alone. Message IDs are chosen by senders and
//! need not be unique, so they never identify a delivery.

use crate::message::{EntityRef, LockToken, MessageId};
use crate::transport::SettleOutcome;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Lifecycle of a single lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Held until `deadline`
    Locked { deadline: Instant },
    Completed,
    Abandoned,
    /// The deadline passed without settlement
    Expired,
}

impl LockState {
    /// Apply the passage of time; a lock at or past its deadline is expired
    pub fn at(self, now: Instant) -> Self {
        match self {
            Self::Locked { deadline } if now >= deadline => Self::Expired,
            other => other,
        }
    }

    /// Attempt a settlement at `now`.
    ///
    /// Only a lock that is still held may be settled. Any other state is
    /// returned unchanged as the error.
    pub fn settle(self, outcome: SettleOutcome, now: Instant) -> Result<Self, Self> {
        match self.at(now) {
            Self::Locked { .. } => Ok(match outcome {
                SettleOutcome::Complete => Self::Completed,
                SettleOutcome::Abandon => Self::Abandoned,
            }),
            other => Err(other),
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Locked { .. })
    }
}

/// A lock held by this client
#[derive(Debug, Clone)]
pub(crate) struct LockRecord {
    pub entity: EntityRef,
    pub message_id: MessageId,
    pub acquired_at: Instant,
    pub deadline: Instant,
}

impl LockRecord {
    pub fn state(&self, now: Instant) -> LockState {
        LockState::Locked {
            deadline: self.deadline,
        }
        .at(now)
    }
}

/// Lock records of one receiver
#[derive(Default)]
pub(crate) struct LockTracker {
    records: Mutex<HashMap<LockToken, LockRecord>>,
}

impl LockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<LockToken, LockRecord>> {
        // The guarded map stays consistent even if a holder panicked
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a lock, or hand back one that was claimed but not settled
    pub fn track(&self, token: LockToken, record: LockRecord) {
        self.records().insert(token, record);
    }

    /// Take exclusive ownership of a lock for settlement.
    ///
    /// Returns `None` if the token is unknown, already claimed, or expired. An
    /// expired record is dropped.
    pub fn claim(&self, token: &LockToken, now: Instant) -> Option<LockRecord> {
        let record = self.records().remove(token)?;
        match record.state(now) {
            LockState::Locked { .. } => Some(record),
            _ => None,
        }
    }

    /// Drop every record whose deadline has passed; returns how many
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| !record.state(now).is_terminal());
        before - records.len()
    }

    /// Number of unexpired locks
    pub fn held(&self, now: Instant) -> usize {
        self.records()
            .values()
            .filter(|record| !record.state(now).is_terminal())
            .count()
    }

    /// Forget every lock
    pub fn clear(&self) {
        self.records().clear();
    }
}

#[cfg(test)]
#[path = "settlement_tests.rs"]
mod tests;
