//! Domain model module declarations.

pub mod mutation;
pub mod status;
pub mod task;

pub use mutation::{MutationKind, MutationOp, MutationRecord, MutationStatus};
pub use status::{EntitySyncState, QueueSnapshot};
pub use task::{Identity, NewTask, Priority, Task, TaskPatch, TASK_ENTITY};
