//! Optimistic task store.
//!
//! Mutations apply to the in-memory collection and the local cache
//! immediately; the durable queue receives them on the store's schedule:
//! creates at once, updates after a debounce window, deletes after an
//! undo window. One async mutex serializes the store's logical turns.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{TeardownPolicy, TimerSettings};
use crate::models::mutation::{MutationOp, MutationRecord};
use crate::models::status::EntitySyncState;
use crate::models::task::{Identity, NewTask, Task, TaskPatch, TASK_ENTITY};
use crate::persistence::local_store::LocalStore;
use crate::persistence::queue::MutationQueue;
use crate::sync::events::{SyncEvent, SyncEventBus};
use crate::sync::processor::IdentityListener;
use crate::sync::reconciler::{reconcile, LocalWork, Reconciliation};
use crate::sync::timers::TimerRegistry;
use crate::sync::transport::Transport;
use crate::{AppError, Result};

/// Local cache store holding one JSON task per identity.
pub const TASK_STORE: &str = "tasks";

/// Work handled by [`TaskStore::teardown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Buffered updates written to the queue.
    pub flushed_updates: usize,
    /// Soft deletes committed to the queue.
    pub committed_deletes: usize,
    /// Buffered updates dropped.
    pub discarded_updates: usize,
    /// Soft deletes dropped; the entity stays in the cache.
    pub discarded_deletes: usize,
}

struct PendingDeletion {
    task: Task,
    index: usize,
    deadline: Instant,
}

#[derive(Default)]
struct StoreState {
    tasks: Vec<Task>,
    pending_updates: HashMap<Identity, TaskPatch>,
    pending_deletes: HashMap<Identity, PendingDeletion>,
}

impl StoreState {
    fn position(&self, id: &Identity) -> Option<usize> {
        self.tasks.iter().position(|task| &task.id == id)
    }
}

struct Inner {
    state: Mutex<StoreState>,
    cache: Arc<dyn LocalStore>,
    queue: MutationQueue,
    events: Arc<SyncEventBus>,
    debounce: TimerRegistry<Identity>,
    undo: TimerRegistry<Identity>,
    timers: TimerSettings,
}

/// The task collection callers observe.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Inner>,
}

impl TaskStore {
    /// Create an empty store; call [`hydrate`](Self::hydrate) or
    /// [`mount`](Self::mount) to load the cache.
    #[must_use]
    pub fn new(
        cache: Arc<dyn LocalStore>,
        queue: MutationQueue,
        events: Arc<SyncEventBus>,
        timers: TimerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::default()),
                cache,
                queue,
                events,
                debounce: TimerRegistry::new("debounce"),
                undo: TimerRegistry::new("undo"),
                timers,
            }),
        }
    }

    /// Visible tasks in display order.
    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.state.lock().await.tasks.clone()
    }

    /// One visible task.
    pub async fn get_task(&self, id: &Identity) -> Option<Task> {
        let state = self.inner.state.lock().await;
        state.position(id).map(|pos| state.tasks[pos].clone())
    }

    /// Create a task under a fresh temporary identity and queue its creation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the cache write fails, or the queue's
    /// error if the enqueue fails. Either way the task is not left behind.
    pub async fn create_task(&self, fields: NewTask) -> Result<Task> {
        let mut state = self.inner.state.lock().await;
        let task = Task::from_new(Identity::new_temporary(), fields, Utc::now());
        state.tasks.push(task.clone());

        if let Err(err) = self.write_cache(&task).await {
            state.tasks.retain(|t| t.id != task.id);
            return Err(err);
        }

        let op = MutationOp::Create(task.clone());
        match self.inner.queue.enqueue(TASK_ENTITY, &task.id, op, None).await {
            Ok(record) => {
                info!(entity_id = %task.id, item_id = %record.id, "task created");
                self.publish_enqueued(&record);
                Ok(task)
            }
            Err(err) => {
                state.tasks.retain(|t| t.id != task.id);
                if let Err(cleanup) = self
                    .inner
                    .cache
                    .remove_item(TASK_STORE, &task.id.storage_key())
                    .await
                {
                    warn!(%cleanup, entity_id = %task.id, "cache rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Apply `patch` now; queue it once edits to this task go quiet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown or soft-deleted task and
    /// `AppError::Storage` if the cache write fails (memory is left as it was).
    pub async fn update_task(&self, id: &Identity, patch: TaskPatch) -> Result<Task> {
        let mut state = self.inner.state.lock().await;
        let pos = state
            .position(id)
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
        if patch.is_empty() {
            return Ok(state.tasks[pos].clone());
        }

        let mut updated = state.tasks[pos].clone();
        updated.apply(&patch);
        updated.updated_at = Utc::now();
        self.write_cache(&updated).await?;

        state.tasks[pos] = updated.clone();
        state
            .pending_updates
            .entry(id.clone())
            .or_default()
            .merge(patch);
        drop(state);

        self.schedule_flush(id.clone(), self.inner.timers.debounce());
        debug!(entity_id = %id, "update buffered");
        Ok(updated)
    }

    /// Hide a task now; commit the delete when the undo window closes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown or already deleted task.
    pub async fn delete_task(&self, id: &Identity) -> Result<Task> {
        let mut state = self.inner.state.lock().await;
        let pos = state
            .position(id)
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
        let task = state.tasks.remove(pos);
        let window = self.inner.timers.undo_window();
        state.pending_deletes.insert(
            id.clone(),
            PendingDeletion {
                task: task.clone(),
                index: pos,
                deadline: Instant::now() + window,
            },
        );
        drop(state);

        self.schedule_commit(id.clone(), window);
        debug!(entity_id = %id, undo_ms = self.inner.timers.undo_window_ms, "delete pending");
        Ok(task)
    }

    /// Cancel a pending delete and restore the task where it was.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no delete is pending for `id`
    /// (never deleted, or the undo window already closed).
    pub async fn undo_delete(&self, id: &Identity) -> Result<Task> {
        let mut state = self.inner.state.lock().await;
        let pending = state
            .pending_deletes
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("no pending delete for task {id}")))?;
        self.inner.undo.cancel(id);

        let index = pending.index.min(state.tasks.len());
        state.tasks.insert(index, pending.task.clone());
        debug!(entity_id = %id, "delete undone");
        Ok(pending.task)
    }

    /// Per-entity sync indicator.
    ///
    /// Unflushed edits and uncommitted deletes count as `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the queue lookup fails.
    pub async fn get_task_state(&self, id: &Identity) -> Result<EntitySyncState> {
        let items = self.inner.queue.items_for_entity(TASK_ENTITY, id).await?;
        let state = EntitySyncState::from_statuses(items.iter().map(|item| item.status));
        if state != EntitySyncState::Synced {
            return Ok(state);
        }

        let guard = self.inner.state.lock().await;
        if guard.pending_updates.contains_key(id) || guard.pending_deletes.contains_key(id) {
            Ok(EntitySyncState::Pending)
        } else {
            Ok(state)
        }
    }

    /// Replace the visible collection with the local cache content.
    ///
    /// Entities with a queued or soft delete stay hidden. Returns the number
    /// of visible tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the cache cannot be read or holds a
    /// malformed entry, including one stored under another entity's key.
    pub async fn hydrate(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let work = self.queued_work().await?;

        let mut tasks = Vec::new();
        for key in self.inner.cache.get_all_keys(TASK_STORE).await? {
            let Some(value) = self.inner.cache.get_item(TASK_STORE, &key).await? else {
                continue;
            };
            let id = Identity::from_storage_key(&key)?;
            let task: Task = serde_json::from_value(value)
                .map_err(|err| AppError::Storage(format!("malformed cached task {key}: {err}")))?;
            if task.id != id {
                return Err(AppError::Storage(format!(
                    "cached task {key} holds entity {}",
                    task.id.storage_key()
                )));
            }
            if !work.deletes.contains(&id) && !state.pending_deletes.contains_key(&id) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        state.tasks = tasks;
        info!(tasks = state.tasks.len(), "store hydrated from cache");
        Ok(state.tasks.len())
    }

    /// Hydrate from the cache, then refresh from the server in the background.
    ///
    /// Refresh failures are logged and published; the cached view stays.
    ///
    /// # Errors
    ///
    /// Returns the hydrate error; the refresh is not started in that case.
    pub async fn mount(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        self.hydrate().await?;
        let store = self.clone();
        Ok(tokio::spawn(async move {
            if let Err(err) = store.refresh_from_server(transport.as_ref()).await {
                warn!(%err, "initial refresh failed; keeping cached view");
                store.inner.events.publish(SyncEvent::Error {
                    message: err.to_string(),
                });
            }
        }))
    }

    /// Fetch the server collection and reconcile it with local state.
    ///
    /// The result replaces both the cache and the visible collection.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the fetch fails, `AppError::Db`
    /// if queued work or resolved identities cannot be read, or
    /// `AppError::Storage` if the cache replace fails (the visible
    /// collection is then left unchanged).
    pub async fn refresh_from_server(&self, transport: &dyn Transport) -> Result<Reconciliation> {
        let requested_at = Utc::now();
        let server = transport.fetch_all().await?;

        let mut state = self.inner.state.lock().await;
        let mut work = self.queued_work().await?;
        // The snapshot may predate creates acknowledged while it was in transit.
        for id in self
            .inner
            .queue
            .resolved_since(TASK_ENTITY, requested_at)
            .await?
        {
            work.resolve(id);
        }
        for (id, patch) in &state.pending_updates {
            work.patch(id.clone(), patch.clone());
        }
        for id in state.pending_deletes.keys() {
            work.delete(id.clone());
        }

        let result = reconcile(&state.tasks, server, &work);
        let entries = result
            .tasks
            .iter()
            .chain(state.pending_deletes.values().map(|pending| &pending.task))
            .map(|task| -> Result<(String, Value)> {
                Ok((task.id.storage_key(), to_cache_value(task)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.inner.cache.replace_all(TASK_STORE, entries).await?;
        state.tasks.clone_from(&result.tasks);

        info!(
            tasks = result.tasks.len(),
            server_deleted = result.server_deleted.len(),
            retained_temporary = result.retained_temporary,
            "reconciled with server"
        );
        Ok(result)
    }

    /// Stop all timers according to the configured teardown policy.
    ///
    /// # Errors
    ///
    /// Never fails under `Discard`. Under `Flush`, individual failures are
    /// logged and counted as discarded rather than returned.
    pub async fn teardown(&self) -> Result<TeardownReport> {
        self.inner.debounce.cancel_all();
        self.inner.undo.cancel_all();
        let mut report = TeardownReport::default();

        match self.inner.timers.teardown {
            TeardownPolicy::Discard => {
                let mut state = self.inner.state.lock().await;
                report.discarded_updates = state.pending_updates.len();
                report.discarded_deletes = state.pending_deletes.len();
                state.pending_updates.clear();
                state.pending_deletes.clear();
            }
            TeardownPolicy::Flush => {
                let (updates, deletes): (Vec<Identity>, Vec<Identity>) = {
                    let state = self.inner.state.lock().await;
                    (
                        state.pending_updates.keys().cloned().collect(),
                        state.pending_deletes.keys().cloned().collect(),
                    )
                };
                for id in updates {
                    match self.flush_update(&id).await {
                        Ok(true) => report.flushed_updates += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(%err, entity_id = %id, "could not flush update at teardown");
                            report.discarded_updates += 1;
                        }
                    }
                }
                for id in deletes {
                    match self.commit_delete(&id).await {
                        Ok(true) => report.committed_deletes += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(%err, entity_id = %id, "could not commit delete at teardown");
                            report.discarded_deletes += 1;
                        }
                    }
                }
            }
        }

        if report.discarded_updates > 0 || report.discarded_deletes > 0 {
            warn!(
                discarded_updates = report.discarded_updates,
                discarded_deletes = report.discarded_deletes,
                "unsynced local work discarded at teardown"
            );
        } else {
            info!(?report, "store torn down");
        }
        Ok(report)
    }

    /// Queue the buffered patch for `id`; returns whether one existed.
    async fn flush_update(&self, id: &Identity) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        let Some(patch) = state.pending_updates.remove(id) else {
            return Ok(false);
        };

        let op = MutationOp::Update(patch.clone());
        match self.inner.queue.enqueue(TASK_ENTITY, id, op, None).await {
            Ok(record) => {
                debug!(entity_id = %id, item_id = %record.id, "update flushed");
                self.publish_enqueued(&record);
                Ok(true)
            }
            Err(err) => {
                state.pending_updates.insert(id.clone(), patch);
                Err(err)
            }
        }
    }

    /// Commit a soft delete; returns whether one was pending.
    async fn commit_delete(&self, id: &Identity) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        let Some(pending) = state.pending_deletes.remove(id) else {
            return Ok(false);
        };

        match self.inner.queue.enqueue(TASK_ENTITY, id, MutationOp::Delete, None).await {
            Ok(record) => {
                self.inner.debounce.cancel(id);
                state.pending_updates.remove(id);
                info!(entity_id = %id, item_id = %record.id, "delete committed");
                self.publish_enqueued(&record);
                // The queued delete keeps the entity hidden even if this fails.
                self.inner
                    .cache
                    .remove_item(TASK_STORE, &id.storage_key())
                    .await?;
                Ok(true)
            }
            Err(err) => {
                let index = pending.index.min(state.tasks.len());
                state.tasks.insert(index, pending.task);
                Err(err)
            }
        }
    }

    fn schedule_flush(&self, id: Identity, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let key = id.clone();
        self.inner.debounce.schedule(id, delay, move || async move {
            if let Some(store) = Self::from_weak(&weak) {
                if let Err(err) = store.flush_update(&key).await {
                    store.report_timer_error("debounce flush", &key, &err);
                }
            }
        });
    }

    fn schedule_commit(&self, id: Identity, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let key = id.clone();
        self.inner.undo.schedule(id, delay, move || async move {
            if let Some(store) = Self::from_weak(&weak) {
                if let Err(err) = store.commit_delete(&key).await {
                    store.report_timer_error("delete commit", &key, &err);
                }
            }
        });
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn report_timer_error(&self, what: &str, id: &Identity, err: &AppError) {
        error!(%err, entity_id = %id, "{what} failed");
        self.inner.events.publish(SyncEvent::Error {
            message: format!("{what} for {id}: {err}"),
        });
    }

    fn publish_enqueued(&self, record: &MutationRecord) {
        self.inner.events.publish(SyncEvent::Enqueued {
            item_id: record.id.clone(),
            entity_id: record.entity_id.clone(),
            kind: record.kind(),
        });
    }

    async fn write_cache(&self, task: &Task) -> Result<()> {
        let value = to_cache_value(task)?;
        self.inner
            .cache
            .set_item(TASK_STORE, &task.id.storage_key(), value)
            .await
    }

    /// Deletes and patches still sitting in the queue, oldest first.
    async fn queued_work(&self) -> Result<LocalWork> {
        let mut work = LocalWork::default();
        for item in self.inner.queue.list(None).await? {
            if item.status.is_terminal() || item.entity_type != TASK_ENTITY {
                continue;
            }
            match item.op {
                MutationOp::Delete => work.delete(item.entity_id),
                MutationOp::Update(patch) => work.patch(item.entity_id, patch),
                MutationOp::Create(_) => {}
            }
        }
        Ok(work)
    }

    async fn rewrite_identity(&self, temporary: &Identity, permanent: &Identity) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let temp_key = temporary.storage_key();
        let perm_key = permanent.storage_key();

        if let Some(pos) = state.position(temporary) {
            if state.position(permanent).is_some() {
                // A refresh already brought in the server copy.
                state.tasks.remove(pos);
                self.inner.cache.remove_item(TASK_STORE, &temp_key).await?;
            } else {
                let mut task = state.tasks[pos].clone();
                task.id = permanent.clone();
                self.inner
                    .cache
                    .rekey(TASK_STORE, &temp_key, &perm_key, to_cache_value(&task)?)
                    .await?;
                state.tasks[pos] = task;
            }
        }

        if let Some(mut pending) = state.pending_deletes.remove(temporary) {
            pending.task.id = permanent.clone();
            self.inner
                .cache
                .rekey(TASK_STORE, &temp_key, &perm_key, to_cache_value(&pending.task)?)
                .await?;
            let remaining = pending.deadline.saturating_duration_since(Instant::now());
            state.pending_deletes.insert(permanent.clone(), pending);
            // A timer that already fired will find nothing under the old key.
            self.inner.undo.cancel(temporary);
            self.schedule_commit(permanent.clone(), remaining);
        }

        if let Some(patch) = state.pending_updates.remove(temporary) {
            state
                .pending_updates
                .entry(permanent.clone())
                .or_default()
                .merge(patch);
            self.inner.debounce.cancel(temporary);
            self.schedule_flush(permanent.clone(), self.inner.timers.debounce());
        }

        debug!(temporary = %temporary, permanent = %permanent, "local identity rewritten");
        Ok(())
    }
}

impl IdentityListener for TaskStore {
    fn identity_resolved<'a>(
        &'a self,
        temporary: &'a Identity,
        server_task: &'a Task,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.rewrite_identity(temporary, &server_task.id))
    }
}

fn to_cache_value(task: &Task) -> Result<Value> {
    serde_json::to_value(task).map_err(|err| AppError::Storage(format!("encode task: {err}")))
}
