//! Sync machinery: backoff, transport, processor, worker, and timers.

pub mod backoff;
pub mod events;
pub mod network;
pub mod processor;
pub mod reconciler;
pub mod timers;
pub mod transport;
pub mod worker;

pub use events::{SyncEvent, SyncEventBus};
pub use network::{NetworkMonitor, NetworkStatus};
pub use processor::{IdentityListener, RetrySummary, SyncProcessor};
pub use transport::{HttpTransport, SendOutcome, Transport};
pub use worker::{spawn_sync_worker, WorkerCommand};
