#![forbid(unsafe_code)]

//! `tasksync`: offline-first task sync daemon and queue inspector.
//!
//! `run` hydrates the local task cache, reconciles with the server, and
//! drains the mutation queue in the background until shutdown. The other
//! subcommands inspect or maintain the queue directly.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tasksync::config::TeardownPolicy;
use tasksync::models::MutationStatus;
use tasksync::persistence::local_store::{LocalStore, SqliteLocalStore};
use tasksync::persistence::queue::{ConflictResolution, MutationQueue};
use tasksync::persistence::{db, retention};
use tasksync::store::{spawn_refresh_on_reconnect, TaskStore};
use tasksync::sync::network::spawn_reachability_probe;
use tasksync::sync::{
    spawn_sync_worker, HttpTransport, NetworkMonitor, NetworkStatus, SyncEventBus,
    SyncProcessor, Transport, WorkerCommand,
};
use tasksync::{AppError, Result, SyncConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tasksync", about = "Offline-first task sync engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "tasksync.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the sync daemon until interrupted.
    Run,

    /// Print aggregate queue counts.
    Status,

    /// List queue items in FIFO order.
    List {
        /// Only items with this status.
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// Return failed items to pending; the daemon sends them on its next pass.
    RetryFailed,

    /// Resolve a conflicted item.
    Resolve {
        /// Queue item ID.
        id: String,
        /// Drop the local change or send it again.
        #[arg(value_enum)]
        resolution: Resolution,
    },

    /// Delete acknowledged items.
    ClearSynced,

    /// Delete every queued item, including unsynced work.
    ClearQueue {
        /// Confirm that unsynced work will be lost.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum StatusFilter {
    Pending,
    InFlight,
    Synced,
    Failed,
    Conflict,
}

impl From<StatusFilter> for MutationStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::InFlight => Self::InFlight,
            StatusFilter::Synced => Self::Synced,
            StatusFilter::Failed => Self::Failed,
            StatusFilter::Conflict => Self::Conflict,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Resolution {
    Discard,
    Retry,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(dispatch(args))
}

async fn dispatch(args: Cli) -> Result<()> {
    let config = SyncConfig::load_from_path(&args.config)?;
    let db = Arc::new(db::connect(&config.db_path).await?);
    let queue = MutationQueue::new(Arc::clone(&db), config.sync.max_attempts);

    match args.command {
        Command::Run => run(config, db, queue).await,
        Command::Status => print_json(&queue.snapshot().await?),
        Command::List { status } => print_json(&queue.list(status.map(Into::into)).await?),
        Command::RetryFailed => {
            let requeued = queue.retry_failed().await?;
            println!("{requeued} failed item(s) returned to pending");
            Ok(())
        }
        Command::Resolve { id, resolution } => {
            let resolution = match resolution {
                Resolution::Discard => ConflictResolution::Discard,
                Resolution::Retry => ConflictResolution::Retry,
            };
            queue.resolve_conflict(&id, resolution).await?;
            println!("{id} resolved");
            Ok(())
        }
        Command::ClearSynced => {
            let cleared = queue.clear_synced().await?;
            println!("{cleared} synced item(s) removed");
            Ok(())
        }
        Command::ClearQueue { yes } => {
            if !yes {
                return Err(AppError::Config(
                    "clear-queue discards unsynced work; pass --yes to confirm".into(),
                ));
            }
            let cleared = queue.clear_all().await?;
            println!("{cleared} item(s) removed");
            Ok(())
        }
    }
}

async fn run(mut config: SyncConfig, db: Arc<db::Database>, queue: MutationQueue) -> Result<()> {
    info!("tasksync daemon bootstrap");
    config.load_credentials().await?;

    let recovered = queue.recover_interrupted().await?;
    info!(recovered, "queue ready");

    // ── Shared components ───────────────────────────────
    let events = Arc::new(SyncEventBus::default());
    let cache: Arc<dyn LocalStore> = Arc::new(SqliteLocalStore::new(Arc::clone(&db)));
    let client = reqwest::Client::builder().build()?;
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        client.clone(),
        config.base_url(),
        config.api_token.clone(),
    ));
    let network = Arc::new(NetworkStatus::new(false));
    let monitor: Arc<dyn NetworkMonitor> = Arc::clone(&network) as Arc<dyn NetworkMonitor>;

    let store = TaskStore::new(
        cache,
        queue.clone(),
        Arc::clone(&events),
        config.timers.clone(),
    );
    let processor = Arc::new(
        SyncProcessor::new(
            queue.clone(),
            Arc::clone(&transport),
            Arc::clone(&monitor),
            Arc::clone(&events),
            config.sync.batch_size,
        )
        .with_identity_listener(Arc::new(store.clone())),
    );

    // ── Background tasks ────────────────────────────────
    let ct = CancellationToken::new();
    let event_handle = spawn_event_logger(&events, ct.clone());
    let probe_handle = spawn_reachability_probe(
        Arc::clone(&network),
        client,
        format!("{}{}", config.base_url(), config.network.probe_path),
        config.probe_interval(),
        ct.clone(),
    );
    let (commands, command_rx) = mpsc::channel(16);
    let worker_handle = spawn_sync_worker(
        Arc::clone(&processor),
        Arc::clone(&monitor),
        Arc::clone(&events),
        config.sync_interval(),
        command_rx,
        ct.clone(),
    );
    let refresh_handle = spawn_refresh_on_reconnect(
        store.clone(),
        Arc::clone(&monitor),
        Arc::clone(&transport),
        ct.clone(),
    );
    let retention_handle = retention::spawn_retention_task(
        queue.clone(),
        config.retention.synced_retention_hours,
        ct.clone(),
    );

    let mount_handle = store.mount(Arc::clone(&transport)).await?;
    if commands.send(WorkerCommand::TriggerSync).await.is_err() {
        warn!("sync worker exited before startup pass");
    }
    info!(tasks = store.tasks().await.len(), "tasksync daemon ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();
    mount_handle.abort();
    // Let an in-progress pass finish before the store stops its timers.
    let _ = tokio::join!(worker_handle, refresh_handle);

    let report = store.teardown().await?;
    let committed = report.flushed_updates + report.committed_deletes;
    if config.timers.teardown == TeardownPolicy::Flush && committed > 0 {
        match processor.trigger_sync().await {
            Ok(synced) => info!(synced, "final sync pass complete"),
            Err(err) => error!(%err, "final sync pass failed"),
        }
    }

    let _ = tokio::join!(event_handle, probe_handle, retention_handle);
    db.close().await;
    info!("tasksync shut down");
    Ok(())
}

/// Relay sync events to the log until cancelled.
fn spawn_event_logger(
    events: &SyncEventBus,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => info!(message_type = event.message_type(), ?event, "sync event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event logger lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
