//! Retention service for acknowledged queue items.
//!
//! Runs as a background task deleting `Synced` items older than the
//! configured retention. `Failed` and `Conflict` items are never purged
//! here; they wait for `retry_failed`, conflict resolution, or an explicit
//! `clear_all`.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::queue::MutationQueue;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly, starting immediately.
#[must_use]
pub fn spawn_retention_task(
    queue: MutationQueue,
    retention_hours: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&queue, retention_hours).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete synced items older than `retention_hours`; returns the count.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(queue: &MutationQueue, retention_hours: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::hours(i64::from(retention_hours));
    let purged = queue.purge_synced_before(cutoff).await?;
    info!(retention_hours, purged, "retention purge completed");
    Ok(purged)
}
