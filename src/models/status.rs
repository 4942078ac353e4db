//! Aggregate and per-entity sync status models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mutation::MutationStatus;

/// Aggregate queue counts for a global "N pending, M failed" indicator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// All items currently stored.
    pub total: u64,
    /// Items waiting to be sent.
    pub pending: u64,
    /// Items dequeued and awaiting the transport.
    pub in_flight: u64,
    /// Acknowledged items not yet purged.
    pub synced: u64,
    /// Items whose attempts are exhausted.
    pub failed: u64,
    /// Items awaiting conflict resolution.
    pub conflict: u64,
    /// Most recent acknowledgement time.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl QueueSnapshot {
    /// Add `count` items of `status` to the tallies.
    pub fn record(&mut self, status: MutationStatus, count: u64) {
        self.total += count;
        match status {
            MutationStatus::Pending => self.pending += count,
            MutationStatus::InFlight => self.in_flight += count,
            MutationStatus::Synced => self.synced += count,
            MutationStatus::Failed => self.failed += count,
            MutationStatus::Conflict => self.conflict += count,
        }
    }

    /// Items that still need to reach the server.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_flight
    }
}

/// Per-entity indicator rendered next to a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntitySyncState {
    /// Nothing outstanding.
    Synced,
    /// Local changes not yet acknowledged.
    Pending,
    /// A change exhausted its attempts.
    Failed,
    /// The server rejected a change as conflicting.
    Conflict,
}

impl EntitySyncState {
    /// Derive the indicator from the statuses of an entity's queue items.
    ///
    /// Conflict outranks Failed, which outranks Pending.
    #[must_use]
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = MutationStatus>,
    {
        let mut state = Self::Synced;
        for status in statuses {
            let candidate = match status {
                MutationStatus::Conflict => Self::Conflict,
                MutationStatus::Failed => Self::Failed,
                MutationStatus::Pending | MutationStatus::InFlight => Self::Pending,
                MutationStatus::Synced => continue,
            };
            if candidate.rank() > state.rank() {
                state = candidate;
            }
        }
        state
    }

    fn rank(self) -> u8 {
        match self {
            Self::Synced => 0,
            Self::Pending => 1,
            Self::Failed => 2,
            Self::Conflict => 3,
        }
    }
}
