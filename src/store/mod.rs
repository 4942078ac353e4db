//! Optimistic entity store and its reconnect hook.

pub mod refresh;
pub mod task_store;

pub use refresh::spawn_refresh_on_reconnect;
pub use task_store::{TaskStore, TeardownReport, TASK_STORE};
