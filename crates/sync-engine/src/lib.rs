//! Offline-first synchronization for pet-care state
//!
//! This crate ties the durable local store, connectivity monitoring and the
//! remote state API together: saves fall back to a persistent queue while
//! offline, the queue drains when connectivity returns, and realtime change
//! notifications pull remote updates back in.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod auto_sync;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod realtime;

#[cfg(test)]
mod test_utils;

pub use adapter::{AppStateAdapter, RestoreReport};
pub use auto_sync::AutoSync;
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use orchestrator::{
    QueueDrainResult, RestoreResult, RestoreSource, SaveResult, SyncEvent, SyncOrchestrator,
    BACKEND_UNAVAILABLE, INVALID_USER, OFFLINE,
};
pub use realtime::{setup_realtime_sync, sync_channel_name, RealtimeRefresher, RealtimeSubscription};
