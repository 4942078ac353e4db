//! Durability across process restarts, using an on-disk database.

use std::sync::Arc;

use tasksync::config::TeardownPolicy;
use tasksync::models::task::Identity;
use tasksync::models::{MutationOp, MutationStatus, NewTask, TASK_ENTITY};
use tasksync::persistence::db;
use tasksync::persistence::local_store::{LocalStore, SqliteLocalStore};
use tasksync::persistence::queue::MutationQueue;
use tasksync::store::TaskStore;
use tasksync::sync::SyncEventBus;

use super::test_helpers::test_timers;

fn store_over(db: &Arc<db::Database>, queue: &MutationQueue) -> TaskStore {
    TaskStore::new(
        Arc::new(SqliteLocalStore::new(Arc::clone(db))) as Arc<dyn LocalStore>,
        queue.clone(),
        Arc::new(SyncEventBus::default()),
        test_timers(TeardownPolicy::Discard),
    )
}

#[tokio::test]
async fn queue_and_cache_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("data").join("tasksync.db");

    let created = {
        let db = Arc::new(db::connect(&path).await.expect("connect"));
        let queue = MutationQueue::new(Arc::clone(&db), 5);
        let store = store_over(&db, &queue);
        let task = store
            .create_task(NewTask::titled("durable"))
            .await
            .expect("create");
        db.close().await;
        task
    };

    let db = Arc::new(db::connect(&path).await.expect("reconnect"));
    let queue = MutationQueue::new(Arc::clone(&db), 5);
    let store = store_over(&db, &queue);

    assert_eq!(store.hydrate().await.expect("hydrate"), 1);
    assert_eq!(store.tasks().await, vec![created.clone()]);

    let items = queue.list(None).await.expect("list");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].entity_id, created.id);
    assert!(matches!(&items[0].op, MutationOp::Create(task) if task.title == "durable"));
}

#[tokio::test]
async fn interrupted_in_flight_items_return_to_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tasksync.db");

    let item_id = {
        let db = Arc::new(db::connect(&path).await.expect("connect"));
        let queue = MutationQueue::new(Arc::clone(&db), 5);
        let record = queue
            .enqueue(
                TASK_ENTITY,
                &Identity::Permanent("42".into()),
                MutationOp::Delete,
                None,
            )
            .await
            .expect("enqueue");
        let batch = queue.dequeue_next_batch(10).await.expect("dequeue");
        assert_eq!(batch.len(), 1);
        db.close().await;
        record.id
    };

    let db = Arc::new(db::connect(&path).await.expect("reconnect"));
    let queue = MutationQueue::new(Arc::clone(&db), 5);
    assert_eq!(
        queue.get(&item_id).await.expect("get").expect("present").status,
        MutationStatus::InFlight
    );

    assert_eq!(queue.recover_interrupted().await.expect("recover"), 1);
    let item = queue.get(&item_id).await.expect("get").expect("present");
    assert_eq!(item.status, MutationStatus::Pending);
    assert_eq!(item.attempts, 0, "recovery is not a failed attempt");
    assert_eq!(queue.dequeue_next_batch(10).await.expect("dequeue").len(), 1);
}
