#![forbid(unsafe_code)]

//! Offline-first task synchronization engine.
//!
//! Local mutations land in an optimistic [`store::TaskStore`] and a durable
//! [`persistence::queue::MutationQueue`]; a [`sync::SyncProcessor`] drains
//! the queue to the server when it is reachable.

pub mod config;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use errors::{AppError, Result};
