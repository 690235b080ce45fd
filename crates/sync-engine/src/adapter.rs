//! Application state collaborator
//!
//! The sync engine never inspects a snapshot. Capturing live state into a
//! document and applying a document back are the application's job, done
//! through [`AppStateAdapter`].

use async_trait::async_trait;
use serde_json::Value;

/// Outcome of applying a snapshot to live application state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Whether anything was applied
    pub restored: bool,
    /// Non-fatal problems encountered while applying
    pub errors: Vec<String>,
}

impl RestoreReport {
    /// A report for a snapshot applied without problems
    pub fn applied() -> Self {
        Self {
            restored: true,
            errors: Vec::new(),
        }
    }
}

/// Capture/restore hooks implemented by the application
#[async_trait]
pub trait AppStateAdapter: Send + Sync {
    /// Serialize the user's live state into an opaque snapshot
    async fn capture_app_state(&self, user_id: &str) -> anyhow::Result<Value>;

    /// Apply `snapshot` to the user's live state
    async fn restore_app_state(
        &self,
        user_id: &str,
        snapshot: &Value,
    ) -> anyhow::Result<RestoreReport>;
}
