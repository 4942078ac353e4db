//! Sync event bus fan-out and wire names.

use tasksync::models::task::Identity;
use tasksync::models::{MutationKind, MutationStatus};
use tasksync::sync::{SyncEvent, SyncEventBus};

#[tokio::test]
async fn every_subscriber_receives_published_events() {
    let bus = SyncEventBus::default();
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    let delivered = bus.publish(SyncEvent::Completed { synced: 3 });
    assert_eq!(delivered, 2);

    assert_eq!(first.recv().await.expect("recv"), SyncEvent::Completed { synced: 3 });
    assert_eq!(second.recv().await.expect("recv"), SyncEvent::Completed { synced: 3 });
}

#[test]
fn publish_without_subscribers_is_harmless() {
    let bus = SyncEventBus::new(4);
    assert_eq!(bus.publish(SyncEvent::Completed { synced: 0 }), 0);
}

#[tokio::test]
async fn late_subscriber_misses_earlier_events() {
    let bus = SyncEventBus::default();
    let _keepalive = bus.subscribe();
    bus.publish(SyncEvent::Completed { synced: 1 });

    let mut late = bus.subscribe();
    bus.publish(SyncEvent::Completed { synced: 2 });
    assert_eq!(late.recv().await.expect("recv"), SyncEvent::Completed { synced: 2 });
}

#[test]
fn message_types_match_wire_names() {
    let id = Identity::Permanent("1".into());
    let cases = [
        (
            SyncEvent::Enqueued {
                item_id: "q".into(),
                entity_id: id.clone(),
                kind: MutationKind::Update,
            },
            "SYNC_ENQUEUED",
        ),
        (
            SyncEvent::Success {
                item_id: "q".into(),
                entity_id: id.clone(),
            },
            "SYNC_SUCCESS",
        ),
        (
            SyncEvent::Failure {
                item_id: "q".into(),
                entity_id: id.clone(),
                error: "502".into(),
                status: MutationStatus::Pending,
            },
            "SYNC_FAILURE",
        ),
        (
            SyncEvent::Conflict {
                item_id: "q".into(),
                entity_id: id.clone(),
                reason: "stale".into(),
            },
            "SYNC_FAILURE",
        ),
        (SyncEvent::Completed { synced: 0 }, "SYNC_COMPLETED"),
        (
            SyncEvent::Error {
                message: "x".into(),
            },
            "SYNC_ERROR",
        ),
        (
            SyncEvent::IdentityResolved {
                temporary: Identity::new_temporary(),
                permanent: id,
            },
            "SYNC_SUCCESS",
        ),
    ];
    for (event, expected) in cases {
        assert_eq!(event.message_type(), expected);
    }
}
