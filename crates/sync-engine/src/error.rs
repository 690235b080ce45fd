//! Sync engine errors

use networking::RemoteError;
use storage::StoreError;
use thiserror::Error;

/// Errors raised inside the sync engine
///
/// Public orchestrator entry points fold these into result values; they only
/// escape through helpers such as [`crate::SyncOrchestrator::pending_operations`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Remote store failure
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Application state could not be captured
    #[error("Failed to capture state: {0}")]
    Capture(String),

    /// Application state could not be restored
    #[error("Failed to restore state: {0}")]
    Restore(String),
}

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;
