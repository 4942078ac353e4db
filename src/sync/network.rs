//! Online/offline status and the reachability probe that feeds it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Current connectivity plus a subscription to transitions.
pub trait NetworkMonitor: Send + Sync {
    /// Whether the server is believed reachable.
    fn is_online(&self) -> bool;

    /// Receiver notified on every online/offline transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// [`NetworkMonitor`] backed by a `watch` channel; set by the probe or by hand.
#[derive(Debug)]
pub struct NetworkStatus {
    tx: watch::Sender<bool>,
}

impl NetworkStatus {
    /// Create a status starting at `online`.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Record connectivity; returns `true` if this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "network status changed");
        }
        changed
    }
}

impl NetworkMonitor for NetworkStatus {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Spawn a task that polls `url` and updates `status` from the result.
///
/// Any HTTP response counts as reachable (the server answered); only
/// connection errors and timeouts mark the client offline.
#[must_use]
pub fn spawn_reachability_probe(
    status: Arc<NetworkStatus>,
    client: reqwest::Client,
    url: String,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("reachability probe shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let reachable = match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
                        Ok(response) => {
                            debug!(status = %response.status(), "probe answered");
                            true
                        }
                        Err(err) => {
                            warn!(%err, "probe failed");
                            false
                        }
                    };
                    status.set_online(reachable);
                }
            }
        }
    })
}
