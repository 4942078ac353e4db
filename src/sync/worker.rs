//! Background sync worker.
//!
//! Runs sync passes on a fixed interval, whenever the network comes back,
//! and on request through a command channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::events::SyncEvent;
use super::network::NetworkMonitor;
use super::processor::SyncProcessor;
use super::SyncEventBus;

/// Requests accepted by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Run a sync pass now.
    TriggerSync,
    /// Requeue failed items, then run a pass.
    RetryFailed,
}

/// Why a pass was started; used only for logging.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Interval,
    Reconnect,
    Command(WorkerCommand),
}

/// Spawn the worker loop.
///
/// The task runs until the `CancellationToken` fires. A closed command
/// channel only stops command handling; interval and reconnect triggers
/// keep running.
#[must_use]
pub fn spawn_sync_worker(
    processor: Arc<SyncProcessor>,
    network: Arc<dyn NetworkMonitor>,
    events: Arc<SyncEventBus>,
    interval: Duration,
    mut commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut online = network.subscribe();
        let mut commands_open = true;

        loop {
            let trigger = tokio::select! {
                () = cancel.cancelled() => {
                    info!("sync worker shutting down");
                    break;
                }
                _ = ticker.tick() => Trigger::Interval,
                Ok(()) = online.changed() => {
                    if *online.borrow_and_update() {
                        Trigger::Reconnect
                    } else {
                        debug!("went offline; waiting");
                        continue;
                    }
                }
                maybe_cmd = commands.recv(), if commands_open => {
                    if let Some(cmd) = maybe_cmd {
                        Trigger::Command(cmd)
                    } else {
                        debug!("command channel closed");
                        commands_open = false;
                        continue;
                    }
                }
            };

            debug!(?trigger, "sync worker woke");
            let result = match trigger {
                Trigger::Command(WorkerCommand::RetryFailed) => {
                    processor.retry_failed().await.map(|summary| summary.synced)
                }
                _ => processor.trigger_sync().await,
            };
            if let Err(err) = result {
                error!(%err, ?trigger, "sync pass failed");
                events.publish(SyncEvent::Error {
                    message: err.to_string(),
                });
            }
        }
    })
}
