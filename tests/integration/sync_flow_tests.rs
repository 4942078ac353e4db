//! End-to-end sync flows: offline creation, identity resolution, retries,
//! conflicts, and duplicate-send protection.

use tasksync::config::TeardownPolicy;
use tasksync::models::{MutationKind, MutationStatus, NewTask, TaskPatch};
use tasksync::persistence::local_store::LocalStore;
use tasksync::persistence::queue::ConflictResolution;
use tasksync::sync::SyncEvent;
use tasksync::AppError;

use super::test_helpers::{after, harness, harness_with, DEBOUNCE};

#[tokio::test]
async fn offline_create_resolves_to_permanent_identity() {
    let h = harness().await;
    h.network.set_online(false);

    let task = h
        .store
        .create_task(NewTask::titled("written offline"))
        .await
        .expect("create");
    assert_eq!(h.processor.trigger_sync().await.expect("offline pass"), 0);
    assert_eq!(h.transport.send_count(), 0);

    h.network.set_online(true);
    let synced = h.processor.trigger_sync().await.expect("online pass");
    assert_eq!(synced, 1);

    let tasks = h.store.tasks().await;
    assert_eq!(tasks.len(), 1, "no duplicate after resolution");
    assert!(!tasks[0].id.is_temporary());
    assert_eq!(tasks[0].title, "written offline");
    assert!(h.store.get_task(&task.id).await.is_none());
    assert_eq!(h.transport.server_tasks()[0].id, tasks[0].id);
}

#[tokio::test]
async fn identity_resolution_rekeys_cache() {
    let h = harness().await;
    let task = h
        .store
        .create_task(NewTask::titled("rekey"))
        .await
        .expect("create");

    h.processor.trigger_sync().await.expect("sync");
    let permanent = h.store.tasks().await[0].id.clone();

    let keys = h
        .cache
        .get_all_keys(tasksync::store::TASK_STORE)
        .await
        .expect("keys");
    assert_eq!(keys, vec![permanent.storage_key()]);
    assert_ne!(keys[0], task.id.storage_key());
}

#[tokio::test]
async fn update_queued_before_create_ack_follows_permanent_identity() {
    let h = harness().await;
    h.network.set_online(false);
    let task = h
        .store
        .create_task(NewTask::titled("v1"))
        .await
        .expect("create");
    h.store
        .update_task(&task.id, TaskPatch::default().title("v2"))
        .await
        .expect("update");
    after(DEBOUNCE).await;

    h.network.set_online(true);
    let synced = h.processor.trigger_sync().await.expect("sync");
    assert_eq!(synced, 2);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].kind(), MutationKind::Create);
    assert_eq!(sent[1].kind(), MutationKind::Update);
    assert!(!sent[1].entity_id.is_temporary(), "update addressed by server id");
    assert_eq!(h.transport.server_tasks()[0].title, "v2");
}

#[tokio::test]
async fn edit_buffered_across_resolution_is_sent_to_permanent_id() {
    let h = harness().await;
    let task = h
        .store
        .create_task(NewTask::titled("before"))
        .await
        .expect("create");
    h.store
        .update_task(&task.id, TaskPatch::default().title("after"))
        .await
        .expect("update");

    // Resolve the create while the edit is still buffered.
    h.processor.trigger_sync().await.expect("sync create");
    let permanent = h.store.tasks().await[0].id.clone();
    assert!(!permanent.is_temporary());

    after(DEBOUNCE).await;
    h.processor.trigger_sync().await.expect("sync update");

    let sent = h.transport.sent();
    assert_eq!(
        sent.last().map(tasksync::models::MutationRecord::kind),
        Some(MutationKind::Update)
    );
    assert_eq!(sent.last().map(|item| item.entity_id.clone()), Some(permanent));
    assert_eq!(h.transport.server_tasks()[0].title, "after");
}

#[tokio::test]
async fn back_to_back_triggers_do_not_resend() {
    let h = harness().await;
    h.store.create_task(NewTask::titled("a")).await.expect("create");
    h.store.create_task(NewTask::titled("b")).await.expect("create");

    let first = h.processor.trigger_sync().await.expect("first");
    let second = h.processor.trigger_sync().await.expect("second");

    assert_eq!(first, 2);
    assert_eq!(second, 0);
    assert_eq!(h.transport.send_count(), 2);
}

#[tokio::test]
async fn concurrent_triggers_send_each_item_once() {
    let h = harness().await;
    for n in 0..5 {
        h.store
            .create_task(NewTask::titled(format!("task {n}")))
            .await
            .expect("create");
    }

    let (a, b) = tokio::join!(h.processor.trigger_sync(), h.processor.trigger_sync());
    assert_eq!(a.expect("a") + b.expect("b"), 5);
    assert_eq!(h.transport.send_count(), 5);
}

#[tokio::test]
async fn transient_failure_schedules_retry() {
    let h = harness().await;
    h.store.create_task(NewTask::titled("flaky")).await.expect("create");
    h.transport
        .fail_next(AppError::Transport("server returned 503".into()));

    let synced = h.processor.trigger_sync().await.expect("sync");
    assert_eq!(synced, 0);

    let item = &h.queue.list(None).await.expect("list")[0];
    assert_eq!(item.status, MutationStatus::Pending);
    assert_eq!(item.attempts, 1);
    assert!(item.last_error.as_deref().unwrap_or_default().contains("503"));
    assert!(item.next_retry_at.is_some());

    // Not due yet: an immediate pass sends nothing.
    assert_eq!(h.processor.trigger_sync().await.expect("sync"), 0);
    assert_eq!(h.transport.send_count(), 1);
}

#[tokio::test]
async fn exhausted_attempts_fail_until_retry_failed() {
    let h = harness_with(1, TeardownPolicy::Discard).await;
    h.store.create_task(NewTask::titled("stubborn")).await.expect("create");
    h.transport
        .fail_next(AppError::Transport("server returned 500".into()));
    let mut rx = h.events.subscribe();

    h.processor.trigger_sync().await.expect("sync");
    let snapshot = h.processor.status().await.expect("status");
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.pending, 0);

    match rx.recv().await.expect("event") {
        SyncEvent::Failure { status, .. } => assert_eq!(status, MutationStatus::Failed),
        other => panic!("unexpected event {other:?}"),
    }

    let summary = h.processor.retry_failed().await.expect("retry");
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.synced, 1);
    assert_eq!(h.processor.status().await.expect("status").failed, 0);
}

#[tokio::test]
async fn conflict_is_not_retried_until_resolved() {
    let h = harness().await;
    h.store.create_task(NewTask::titled("contested")).await.expect("create");
    h.transport
        .fail_next(AppError::Conflict("server returned 409".into()));

    h.processor.trigger_sync().await.expect("sync");
    let item = h.queue.list(None).await.expect("list").remove(0);
    assert_eq!(item.status, MutationStatus::Conflict);

    assert_eq!(h.processor.trigger_sync().await.expect("sync"), 0);
    assert_eq!(h.transport.send_count(), 1);

    h.processor
        .resolve_conflict(&item.id, ConflictResolution::Retry)
        .await
        .expect("resolve");
    assert_eq!(h.transport.send_count(), 2);
    assert_eq!(h.processor.status().await.expect("status").synced, 1);
}

#[tokio::test]
async fn update_to_server_deleted_entity_conflicts() {
    let h = harness().await;
    h.store.create_task(NewTask::titled("shared")).await.expect("create");
    h.processor.trigger_sync().await.expect("sync");
    let id = h.store.tasks().await[0].id.clone();

    h.transport.set_server_tasks(Vec::new());
    h.store
        .update_task(&id, TaskPatch::default().completed(true))
        .await
        .expect("update");
    after(DEBOUNCE).await;
    h.processor.trigger_sync().await.expect("sync");

    assert_eq!(
        h.store.get_task_state(&id).await.expect("state"),
        tasksync::models::EntitySyncState::Conflict
    );
}

#[tokio::test]
async fn failures_do_not_halt_the_batch() {
    let h = harness().await;
    for n in 0..3 {
        h.store
            .create_task(NewTask::titled(format!("t{n}")))
            .await
            .expect("create");
    }
    h.transport
        .fail_next(AppError::Transport("reset by peer".into()));

    let synced = h.processor.trigger_sync().await.expect("sync");
    assert_eq!(synced, 2);
    let snapshot = h.processor.status().await.expect("status");
    assert_eq!(snapshot.synced, 2);
    assert_eq!(snapshot.pending, 1);
}

#[tokio::test]
async fn deleting_unsynced_task_sends_create_then_delete() {
    let h = harness().await;
    h.network.set_online(false);
    let task = h
        .store
        .create_task(NewTask::titled("ephemeral"))
        .await
        .expect("create");
    h.store.delete_task(&task.id).await.expect("delete");
    after(super::test_helpers::UNDO).await;

    h.network.set_online(true);
    assert_eq!(h.processor.trigger_sync().await.expect("sync"), 2);
    assert!(h.transport.server_tasks().is_empty());
    assert!(h.store.tasks().await.is_empty());
}

#[tokio::test]
async fn success_and_identity_events_are_published() {
    let h = harness().await;
    let task = h
        .store
        .create_task(NewTask::titled("events"))
        .await
        .expect("create");
    let mut rx = h.events.subscribe();

    h.processor.trigger_sync().await.expect("sync");

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(SyncEvent::Success { .. })));
    assert!(seen.iter().any(|event| matches!(
        event,
        SyncEvent::IdentityResolved { temporary, .. } if *temporary == task.id
    )));
    assert!(matches!(seen.last(), Some(SyncEvent::Completed { synced: 1 })));
}

#[tokio::test]
async fn clear_synced_then_clear_queue() {
    let h = harness().await;
    h.store
        .create_task(NewTask::titled("acked"))
        .await
        .expect("create");
    h.processor.trigger_sync().await.expect("sync");
    h.network.set_online(false);
    h.store
        .create_task(NewTask::titled("unsent"))
        .await
        .expect("create");

    assert_eq!(h.processor.clear_synced().await.expect("clear synced"), 1);
    let snapshot = h.processor.status().await.expect("status");
    assert_eq!(snapshot.total, 1);
    assert_eq!(snapshot.pending, 1);

    assert_eq!(h.processor.clear_queue().await.expect("clear queue"), 1);
    assert_eq!(h.processor.status().await.expect("status").total, 0);
}
