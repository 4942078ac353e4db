//! Sync processor: drains the mutation queue against the transport.
//!
//! Every send outcome becomes a queue status transition; nothing a single
//! item does can abort the rest of its batch. Concurrent passes (worker
//! tick plus an explicit trigger) are safe because dequeue only claims
//! items that are still `Pending`.

use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::models::mutation::{MutationKind, MutationRecord, MutationStatus};
use crate::models::status::QueueSnapshot;
use crate::models::task::{Identity, Task};
use crate::persistence::queue::{ConflictResolution, MutationQueue};
use crate::{AppError, Result};

use super::events::{SyncEvent, SyncEventBus};
use super::network::NetworkMonitor;
use super::transport::{SendOutcome, Transport};

/// Notified when a create is acknowledged and its temporary identity retired.
///
/// Called after the queue has recorded the alias, so items enqueued from
/// inside the callback already address the permanent identity.
pub trait IdentityListener: Send + Sync {
    /// Rewrite local references from `temporary` to `server_task.id`.
    fn identity_resolved<'a>(
        &'a self,
        temporary: &'a Identity,
        server_task: &'a Task,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Result of [`SyncProcessor::retry_failed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// Failed items returned to `Pending`.
    pub requeued: u64,
    /// Items that reached `Synced` in the follow-up pass.
    pub synced: usize,
}

/// Drives queued mutations to the server.
pub struct SyncProcessor {
    queue: MutationQueue,
    transport: Arc<dyn Transport>,
    network: Arc<dyn NetworkMonitor>,
    events: Arc<SyncEventBus>,
    identity_listener: Option<Arc<dyn IdentityListener>>,
    batch_size: usize,
}

impl SyncProcessor {
    /// Create a processor sending up to `batch_size` items concurrently.
    #[must_use]
    pub fn new(
        queue: MutationQueue,
        transport: Arc<dyn Transport>,
        network: Arc<dyn NetworkMonitor>,
        events: Arc<SyncEventBus>,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            transport,
            network,
            events,
            identity_listener: None,
            batch_size: batch_size.max(1),
        }
    }

    /// Register the component that owns local references to identities.
    #[must_use]
    pub fn with_identity_listener(mut self, listener: Arc<dyn IdentityListener>) -> Self {
        self.identity_listener = Some(listener);
        self
    }

    /// Underlying queue.
    #[must_use]
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Send every due item; returns how many reached `Synced`.
    ///
    /// Does nothing while offline. Otherwise drains batch after batch until
    /// no due item remains or the network drops.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a batch cannot be dequeued. Per-item
    /// failures are recorded on the item, not returned.
    pub async fn trigger_sync(&self) -> Result<usize> {
        if !self.network.is_online() {
            debug!("sync skipped while offline");
            return Ok(0);
        }

        let span = info_span!("sync_pass", batch_size = self.batch_size);
        async {
            let mut synced = 0;
            loop {
                let batch = self.queue.dequeue_next_batch(self.batch_size).await?;
                if batch.is_empty() {
                    break;
                }
                debug!(items = batch.len(), "batch dequeued");

                let sends = batch.into_iter().map(|item| self.process_item(item));
                let results = join_all(sends).await;
                synced += results.into_iter().filter(|done| *done).count();

                if !self.network.is_online() {
                    info!("network dropped mid-pass; stopping");
                    break;
                }
            }

            if synced > 0 {
                info!(synced, "sync pass completed");
            }
            self.events.publish(SyncEvent::Completed { synced });
            Ok(synced)
        }
        .instrument(span)
        .await
    }

    /// Reset `Failed` items, then run a pass if online.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the reset or the follow-up dequeue fails.
    pub async fn retry_failed(&self) -> Result<RetrySummary> {
        let requeued = self.queue.retry_failed().await?;
        info!(requeued, "failed mutations requeued");
        let synced = if self.network.is_online() {
            self.trigger_sync().await?
        } else {
            0
        };
        Ok(RetrySummary { requeued, synced })
    }

    /// Aggregate queue counts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn status(&self) -> Result<QueueSnapshot> {
        self.queue.snapshot().await
    }

    /// Discard every queued item, unsynced work included.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear_queue(&self) -> Result<u64> {
        self.queue.clear_all().await
    }

    /// Discard acknowledged items.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear_synced(&self) -> Result<u64> {
        self.queue.clear_synced().await
    }

    /// Resolve a conflicted item; a retry is sent right away when online.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the item is not in conflict.
    pub async fn resolve_conflict(
        &self,
        item_id: &str,
        resolution: ConflictResolution,
    ) -> Result<()> {
        self.queue.resolve_conflict(item_id, resolution).await?;
        if resolution == ConflictResolution::Retry && self.network.is_online() {
            self.trigger_sync().await?;
        }
        Ok(())
    }

    /// Send one claimed item and record the outcome; returns whether it synced.
    async fn process_item(&self, item: MutationRecord) -> bool {
        let span = info_span!(
            "sync_item",
            item_id = %item.id,
            entity_id = %item.entity_id,
            kind = ?item.kind(),
            attempt = item.attempts + 1,
        );
        async {
            let outcome = self.transport.send(&item).await;
            match self.record_outcome(&item, outcome).await {
                Ok(synced) => synced,
                Err(err) => {
                    error!(%err, "failed to record send outcome");
                    self.events.publish(SyncEvent::Error {
                        message: err.to_string(),
                    });
                    false
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn record_outcome(
        &self,
        item: &MutationRecord,
        outcome: Result<SendOutcome>,
    ) -> Result<bool> {
        match outcome {
            Ok(SendOutcome::Created(server_task)) if item.kind() == MutationKind::Create => {
                self.complete_create(item, server_task).await?;
                Ok(true)
            }
            Ok(SendOutcome::Created(_)) => self.acknowledge(item).await,
            Ok(SendOutcome::Applied) if item.kind() == MutationKind::Create => {
                let reason = "create acknowledged without a server identity";
                self.record_failure(item, reason).await?;
                Ok(false)
            }
            Ok(SendOutcome::Applied) => self.acknowledge(item).await,
            Err(AppError::Conflict(reason)) => {
                self.queue.mark_conflict(&item.id, &reason).await?;
                self.events.publish(SyncEvent::Conflict {
                    item_id: item.id.clone(),
                    entity_id: item.entity_id.clone(),
                    reason,
                });
                Ok(false)
            }
            Err(err) => {
                self.record_failure(item, &err.to_string()).await?;
                Ok(false)
            }
        }
    }

    async fn acknowledge(&self, item: &MutationRecord) -> Result<bool> {
        let synced = self.queue.mark_synced(&item.id).await?;
        if synced {
            debug!("mutation synced");
            self.events.publish(SyncEvent::Success {
                item_id: item.id.clone(),
                entity_id: item.entity_id.clone(),
            });
        }
        Ok(synced)
    }

    async fn complete_create(&self, item: &MutationRecord, server_task: Task) -> Result<()> {
        let permanent = server_task.id.clone();
        self.queue.complete_create(&item.id, &permanent).await?;
        self.events.publish(SyncEvent::Success {
            item_id: item.id.clone(),
            entity_id: permanent.clone(),
        });

        if let Some(listener) = &self.identity_listener {
            if let Err(err) = listener.identity_resolved(&item.entity_id, &server_task).await {
                // The queue already moved on; local references heal on the next refresh.
                warn!(%err, "local identity rewrite failed");
                self.events.publish(SyncEvent::Error {
                    message: err.to_string(),
                });
            }
        }

        self.events.publish(SyncEvent::IdentityResolved {
            temporary: item.entity_id.clone(),
            permanent,
        });
        Ok(())
    }

    async fn record_failure(&self, item: &MutationRecord, error: &str) -> Result<()> {
        let status = self.queue.mark_failed(&item.id, error).await?;
        if status == MutationStatus::Failed {
            warn!(error, "mutation attempts exhausted");
        } else {
            debug!(error, "send failed; retry scheduled");
        }
        self.events.publish(SyncEvent::Failure {
            item_id: item.id.clone(),
            entity_id: item.entity_id.clone(),
            error: error.to_owned(),
            status,
        });
        Ok(())
    }
}
