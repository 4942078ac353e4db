//! Task, identity, mutation, and status model behaviour.

use chrono::Utc;
use tasksync::models::task::Identity;
use tasksync::models::{
    EntitySyncState, MutationKind, MutationOp, MutationRecord, MutationStatus, NewTask, Priority,
    QueueSnapshot, Task, TaskPatch, TASK_ENTITY,
};

#[test]
fn temporary_identity_displays_with_prefix() {
    let tmp = Identity::new_temporary();
    assert!(tmp.is_temporary());
    assert!(tmp.to_string().starts_with("tmp-"));

    let perm = Identity::Permanent("42".into());
    assert!(!perm.is_temporary());
    assert_eq!(perm.to_string(), "42");
}

#[test]
fn fresh_temporary_identities_are_distinct() {
    assert_ne!(Identity::new_temporary(), Identity::new_temporary());
}

#[test]
fn from_parts_rejects_unknown_kind_and_bad_token() {
    assert!(Identity::from_parts("other", "x").is_err());
    assert!(Identity::from_parts("temporary", "not-a-uuid").is_err());
    assert_eq!(
        Identity::from_parts("permanent", "abc").expect("permanent"),
        Identity::Permanent("abc".into())
    );
}

#[test]
fn malformed_storage_key_is_a_storage_error() {
    let err = Identity::from_storage_key("nokind").expect_err("no separator");
    assert!(matches!(err, tasksync::AppError::Storage(_)));

    let err = Identity::from_storage_key("temporary:not-a-uuid").expect_err("bad token");
    assert!(matches!(err, tasksync::AppError::Storage(_)));

    let id = Identity::new_temporary();
    assert_eq!(Identity::from_storage_key(&id.storage_key()).expect("round trip"), id);
}

#[test]
fn new_task_starts_incomplete_with_equal_timestamps() {
    let now = Utc::now();
    let task = Task::from_new(
        Identity::new_temporary(),
        NewTask {
            priority: Priority::High,
            tags: vec!["home".into()],
            ..NewTask::titled("buy milk")
        },
        now,
    );

    assert!(!task.completed);
    assert_eq!(task.title, "buy milk");
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.tags, vec!["home".to_owned()]);
    assert_eq!(task.created_at, now);
    assert_eq!(task.updated_at, now);
}

#[test]
fn apply_overwrites_only_present_fields() {
    let mut task = Task::from_new(
        Identity::Permanent("1".into()),
        NewTask::titled("a"),
        Utc::now(),
    );
    task.apply(&TaskPatch::default().completed(true));

    assert!(task.completed);
    assert_eq!(task.title, "a");
    assert_eq!(task.priority, Priority::Medium);
}

#[test]
fn patch_serializes_only_set_fields() {
    let json = serde_json::to_value(TaskPatch::default().title("x")).expect("serialize");
    assert_eq!(json, serde_json::json!({ "title": "x" }));

    let cleared = serde_json::to_value(TaskPatch::default().description(None)).expect("serialize");
    assert_eq!(cleared, serde_json::json!({ "description": null }));
}

#[test]
fn mutation_record_starts_pending_with_unique_id() {
    let target = Identity::Permanent("1".into());
    let a = MutationRecord::new(TASK_ENTITY, target.clone(), MutationOp::Delete, None);
    let b = MutationRecord::new(TASK_ENTITY, target, MutationOp::Delete, None);

    assert_ne!(a.id, b.id);
    assert_eq!(a.status, MutationStatus::Pending);
    assert_eq!(a.attempts, 0);
    assert!(!a.resend);
    assert_eq!(a.kind(), MutationKind::Delete);
}

#[test]
fn op_payload_is_tagged_by_kind() {
    let op = MutationOp::Update(TaskPatch::default().completed(true));
    let json = serde_json::to_value(&op).expect("serialize");
    assert_eq!(json["kind"], "update");
    assert_eq!(json["payload"]["completed"], true);

    let back: MutationOp = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back, op);
}

#[test]
fn terminal_statuses() {
    assert!(MutationStatus::Synced.is_terminal());
    assert!(MutationStatus::Failed.is_terminal());
    assert!(MutationStatus::Conflict.is_terminal());
    assert!(!MutationStatus::Pending.is_terminal());
    assert!(!MutationStatus::InFlight.is_terminal());
}

#[test]
fn snapshot_tallies_and_outstanding() {
    let mut snapshot = QueueSnapshot::default();
    snapshot.record(MutationStatus::Pending, 3);
    snapshot.record(MutationStatus::InFlight, 1);
    snapshot.record(MutationStatus::Failed, 2);

    assert_eq!(snapshot.total, 6);
    assert_eq!(snapshot.outstanding(), 4);
    assert_eq!(snapshot.failed, 2);
}

#[test]
fn failed_outranks_pending() {
    assert_eq!(
        EntitySyncState::from_statuses([MutationStatus::Pending, MutationStatus::Failed]),
        EntitySyncState::Failed
    );
    assert_eq!(
        EntitySyncState::from_statuses(std::iter::empty::<MutationStatus>()),
        EntitySyncState::Synced
    );
}
