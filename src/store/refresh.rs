//! Re-reconcile the store with the server after each reconnect.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::network::NetworkMonitor;
use crate::sync::transport::Transport;

use super::task_store::TaskStore;

/// Spawn a task that refreshes `store` on every offline→online transition.
///
/// Runs until the `CancellationToken` fires or the network monitor is
/// dropped.
#[must_use]
pub fn spawn_refresh_on_reconnect(
    store: TaskStore,
    network: Arc<dyn NetworkMonitor>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut online = network.subscribe();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("reconnect refresh shutting down");
                    break;
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        debug!("network monitor dropped");
                        break;
                    }
                    if !*online.borrow_and_update() {
                        continue;
                    }
                    if let Err(err) = store.refresh_from_server(transport.as_ref()).await {
                        warn!(%err, "refresh after reconnect failed");
                    }
                }
            }
        }
    })
}
