//! Process-wide publish/subscribe channel for sync notifications.
//!
//! One [`SyncEventBus`] is created at process start and handed by `Arc` to
//! the components that publish or observe. Dropping the last handle closes
//! the channel; subscribers then see `RecvError::Closed`.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::mutation::{MutationKind, MutationStatus};
use crate::models::task::Identity;

const DEFAULT_CAPACITY: usize = 256;

/// Notification emitted by the store, the processor, or the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A mutation was queued (or coalesced into a queued item).
    Enqueued {
        /// Queue item identifier.
        item_id: String,
        /// Target entity.
        entity_id: Identity,
        /// Operation kind.
        kind: MutationKind,
    },
    /// The server acknowledged an item.
    Success {
        /// Queue item identifier.
        item_id: String,
        /// Target entity.
        entity_id: Identity,
    },
    /// A send failed; `status` is `Pending` when a retry is scheduled.
    Failure {
        /// Queue item identifier.
        item_id: String,
        /// Target entity.
        entity_id: Identity,
        /// Transport error text.
        error: String,
        /// Status after the failure was recorded.
        status: MutationStatus,
    },
    /// The server rejected an item as conflicting.
    Conflict {
        /// Queue item identifier.
        item_id: String,
        /// Target entity.
        entity_id: Identity,
        /// Server-provided reason.
        reason: String,
    },
    /// A sync pass finished.
    Completed {
        /// Items that reached `Synced` during the pass.
        synced: usize,
    },
    /// A failure with no caller to report to (timer or background context).
    Error {
        /// Error text.
        message: String,
    },
    /// A temporary identity was retired in favour of a permanent one.
    IdentityResolved {
        /// Retired client identity.
        temporary: Identity,
        /// Server-assigned identity.
        permanent: Identity,
    },
}

impl SyncEvent {
    /// Wire name relayed to out-of-process observers.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "SYNC_ENQUEUED",
            Self::Success { .. } | Self::IdentityResolved { .. } => "SYNC_SUCCESS",
            Self::Failure { .. } | Self::Conflict { .. } => "SYNC_FAILURE",
            Self::Completed { .. } => "SYNC_COMPLETED",
            Self::Error { .. } => "SYNC_ERROR",
        }
    }
}

/// Broadcast bus for [`SyncEvent`]s.
#[derive(Debug)]
pub struct SyncEventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SyncEventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many subscribers received it.
    pub fn publish(&self, event: SyncEvent) -> usize {
        trace!(message_type = event.message_type(), ?event, "sync event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
