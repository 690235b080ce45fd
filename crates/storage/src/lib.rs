//! Durable local storage for the sync engine
//!
//! This crate provides the SQLite-backed store that keeps a user's state
//! snapshot, the offline mutation queue, and a generic expiring cache
//! available without network access and across restarts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod database;
pub mod local_store;
pub mod models;
pub mod schema;

pub use database::{DatabaseConfig, DatabaseError, SqliteDatabase, SynchronousMode};
pub use local_store::{LocalStore, StoreError, SyncStore};
pub use models::{CachedItem, NewOperation, OperationType, QueuedOperation, StateSnapshot};
