//! Merge a server snapshot into the optimistic local view.
//!
//! Pure: callers gather the local work still outstanding, call
//! [`reconcile`], then write the result back as one atomic replace.

use std::collections::{HashMap, HashSet};

use crate::models::task::{Identity, Task, TaskPatch};

/// Local changes the server has not acknowledged yet.
#[derive(Debug, Clone, Default)]
pub struct LocalWork {
    /// Entities with a queued or pending-undo delete.
    pub deletes: HashSet<Identity>,
    /// Field changes queued or buffered per entity, merged oldest first.
    pub patches: HashMap<Identity, TaskPatch>,
    /// Creates acknowledged after the server snapshot was requested.
    pub resolved: HashSet<Identity>,
}

impl LocalWork {
    /// Record a pending delete.
    pub fn delete(&mut self, id: Identity) {
        self.deletes.insert(id);
    }

    /// Fold `patch` into the changes already recorded for `id`.
    pub fn patch(&mut self, id: Identity, patch: TaskPatch) {
        self.patches.entry(id).or_default().merge(patch);
    }

    /// Record a permanent identity the snapshot may predate.
    pub fn resolve(&mut self, id: Identity) {
        self.resolved.insert(id);
    }
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Visible collection after the merge, ordered by creation time.
    pub tasks: Vec<Task>,
    /// Local permanent entities the server no longer has.
    pub server_deleted: Vec<Identity>,
    /// Unacknowledged local creates carried over untouched.
    pub retained_temporary: usize,
}

/// Merge `server` into `local`, keeping unacknowledged local work.
///
/// Server entities replace their local copies wholesale, with any pending
/// local patch laid back on top. Temporary entities are kept as they are.
/// Local permanent entities missing from the server are dropped and
/// reported, unless a local delete is already pending for them or their
/// create was acknowledged after the snapshot was requested.
#[must_use]
pub fn reconcile(local: &[Task], server: Vec<Task>, work: &LocalWork) -> Reconciliation {
    let server_ids: HashSet<Identity> = server.iter().map(|task| task.id.clone()).collect();
    let mut result = Reconciliation::default();

    for mut task in server {
        if work.deletes.contains(&task.id) {
            continue;
        }
        if let Some(patch) = work.patches.get(&task.id) {
            task.apply(patch);
        }
        result.tasks.push(task);
    }

    for task in local {
        if task.id.is_temporary() {
            result.retained_temporary += 1;
            result.tasks.push(task.clone());
        } else if !server_ids.contains(&task.id) && !work.deletes.contains(&task.id) {
            if work.resolved.contains(&task.id) {
                result.tasks.push(task.clone());
            } else {
                result.server_deleted.push(task.id.clone());
            }
        }
    }

    result
        .tasks
        .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    result
}
