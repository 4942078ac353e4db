//! Mutation record model for the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{Identity, Task, TaskPatch};

/// Operation kind of a queued mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Entity creation; carries the temporary identity.
    Create,
    /// Partial update; coalesces while not yet acknowledged.
    Update,
    /// Entity removal.
    Delete,
}

/// Typed payload, one variant per operation kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum MutationOp {
    /// Full snapshot of the entity as created locally.
    Create(Task),
    /// Accumulated field changes.
    Update(TaskPatch),
    /// No payload.
    Delete,
}

impl MutationOp {
    /// Kind discriminator for this payload.
    #[must_use]
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Create(_) => MutationKind::Create,
            Self::Update(_) => MutationKind::Update,
            Self::Delete => MutationKind::Delete,
        }
    }
}

/// Lifecycle status for a queue item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be sent (possibly after a scheduled retry time).
    Pending,
    /// Dequeued by a sync pass and awaiting the transport.
    InFlight,
    /// Acknowledged by the server.
    Synced,
    /// Attempts exhausted; only `retry_failed` brings it back.
    Failed,
    /// Server reported a concurrent change; needs explicit resolution.
    Conflict,
}

impl MutationStatus {
    /// `Synced`, `Failed`, and `Conflict` stay put until garbage collection.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::Failed | Self::Conflict)
    }
}

/// One pending change to an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationRecord {
    /// Unique item identifier; also the transport idempotency key.
    pub id: String,
    /// Entity type tag (e.g. `task`).
    pub entity_type: String,
    /// Temporary or permanent identity of the target entity.
    pub entity_id: Identity,
    /// Operation and its payload.
    pub op: MutationOp,
    /// Current lifecycle status.
    pub status: MutationStatus,
    /// Failed send attempts so far.
    pub attempts: u32,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
    /// Earliest time the item may be dequeued again.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Payload changed while in flight; resend after the current send succeeds.
    pub resend: bool,
    /// Opaque caller context recorded alongside the item.
    pub metadata: Option<serde_json::Value>,
    /// Enqueue timestamp, the FIFO ordering key.
    pub created_at: DateTime<Utc>,
    /// Last status or payload change.
    pub updated_at: DateTime<Utc>,
}

impl MutationRecord {
    /// Construct a new pending record with a generated identifier.
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: Identity,
        op: MutationOp,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id,
            op,
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            resend: false,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Kind of the carried operation.
    #[must_use]
    pub fn kind(&self) -> MutationKind {
        self.op.kind()
    }
}
