//! Sync orchestration
//!
//! [`SyncOrchestrator`] is the reconciliation protocol between live
//! application state, the durable queue and the remote store:
//!
//! - `save` pushes the captured state, or queues it when the push cannot be
//!   applied (offline, or a failure that outlived the inline retries)
//! - `restore` pulls remote state, falling back to the local snapshot
//! - `process_sync_queue` replays queued operations in FIFO order
//!
//! None of the entry points return `Err`: expected failures are reported in
//! the result value with a human-readable `error`.

use networking::{
    retry, Conflict, ConnectivityProbe, MutationKind, PushOutcome, RemoteError, RemoteMutation,
    RemoteState, RemoteStateApi, RetryPolicy,
};
use serde_json::{json, Value};
use std::sync::Arc;
use storage::models::now_millis;
use storage::{NewOperation, OperationType, QueuedOperation, SyncStore};
use tokio::sync::{broadcast, Mutex};

use crate::adapter::AppStateAdapter;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Error marker for a save made while offline
pub const OFFLINE: &str = "Offline";

/// Error marker for a call without an authenticated user
pub const INVALID_USER: &str = "Invalid user";

/// Error marker for a save made without a remote backend
pub const BACKEND_UNAVAILABLE: &str = "Backend unavailable";

/// Outcome of [`SyncOrchestrator::save`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveResult {
    /// Whether the remote store accepted the state
    pub success: bool,
    /// Failure reason
    pub error: Option<String>,
    /// Conflicts reported by the remote store, unresolved
    pub conflicts: Vec<Conflict>,
    /// Version assigned by the remote store
    pub version: Option<u64>,
    /// Id of the queued operation when the save was deferred
    pub queued_operation: Option<String>,
}

impl SaveResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Where restored state came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    /// Fetched from the remote store
    Remote,
    /// Loaded from the local snapshot
    Local,
}

/// Outcome of [`SyncOrchestrator::restore`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreResult {
    /// Whether the restore completed (nothing to restore still counts)
    pub success: bool,
    /// Whether state was applied
    pub restored: bool,
    /// Failure reason
    pub error: Option<String>,
    /// Origin of the applied state
    pub source: Option<RestoreSource>,
    /// Timestamp of the applied state in milliseconds
    pub timestamp: Option<i64>,
    /// Non-fatal problems reported while applying
    pub errors: Vec<String>,
}

impl RestoreResult {
    fn nothing_to_restore(source: Option<RestoreSource>) -> Self {
        Self {
            success: true,
            source,
            ..Default::default()
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Outcome of [`SyncOrchestrator::process_sync_queue`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDrainResult {
    /// Whether the drain ran to completion (or had nothing to do)
    pub success: bool,
    /// Operations applied and removed
    pub processed: usize,
    /// Operations that failed this cycle, dropped ones included
    pub failed: usize,
    /// Operations removed after exhausting their retries
    pub dropped: Vec<QueuedOperation>,
    /// Set when another drain was already running
    pub skipped: bool,
    /// Failure reason
    pub error: Option<String>,
}

impl QueueDrainResult {
    fn idle() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }
}

/// Notifications for sync indicators
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The remote store accepted a save
    Saved {
        /// User whose state was saved
        user_id: String,
        /// New remote version
        version: u64,
        /// Number of conflicts reported
        conflicts: usize,
    },
    /// A save was kept locally and queued
    SavedOffline {
        /// User whose state was saved
        user_id: String,
        /// Queued operation id, if queueing succeeded
        operation_id: Option<String>,
        /// Why the push was not applied
        reason: String,
    },
    /// State was applied to the application
    Restored {
        /// User whose state was restored
        user_id: String,
        /// Origin of the state
        source: RestoreSource,
    },
    /// A drain cycle finished
    QueueDrained {
        /// Operations applied
        processed: usize,
        /// Operations that failed
        failed: usize,
    },
    /// A queued operation was permanently dropped
    OperationDropped(QueuedOperation),
}

/// Coordinates local state, the durable queue and the remote store
///
/// Constructed without a remote the orchestrator runs in backend-unavailable
/// mode: saves are kept locally only and the queue is never drained.
pub struct SyncOrchestrator {
    store: Arc<dyn SyncStore>,
    connectivity: Arc<dyn ConnectivityProbe>,
    remote: Option<Arc<dyn RemoteStateApi>>,
    app: Arc<dyn AppStateAdapter>,
    config: SyncConfig,
    drain_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    /// Create an orchestrator without a remote backend
    pub fn new(
        store: Arc<dyn SyncStore>,
        connectivity: Arc<dyn ConnectivityProbe>,
        app: Arc<dyn AppStateAdapter>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        Self {
            store,
            connectivity,
            remote: None,
            app,
            config,
            drain_lock: Mutex::new(()),
            events,
        }
    }

    /// Attach the remote store
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStateApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Whether a remote backend is attached
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Get the configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Number of operations waiting in the queue
    pub async fn pending_operations(&self) -> Result<usize> {
        Ok(self.store.get_queued_operations().await?.len())
    }

    /// Enqueue a mutation against a table other than the state document
    ///
    /// Drained through [`RemoteStateApi::apply_mutation`].
    pub async fn queue_mutation(
        &self,
        table: &str,
        op_type: OperationType,
        data: Value,
    ) -> Result<String> {
        let id = self
            .store
            .queue_operation(NewOperation::new(op_type, table, data))
            .await?;

        tracing::debug!(id = %id, table, op_type = %op_type, "Mutation queued");
        Ok(id)
    }

    /// Capture the user's state and push it to the remote store
    ///
    /// An accepted push supersedes every state save queued for the user
    /// before the capture; those are removed instead of being replayed.
    pub async fn save(&self, user_id: &str) -> SaveResult {
        if !is_valid_user(user_id) {
            tracing::warn!("Save skipped: no authenticated user");
            return SaveResult::failure(INVALID_USER);
        }

        let snapshot = match self.app.capture_app_state(user_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let err = SyncError::Capture(e.to_string());
                tracing::error!(user_id, error = %err, "Save failed");
                return SaveResult::failure(err.to_string());
            }
        };
        let captured_at = now_millis();

        if self.connectivity.is_offline() {
            tracing::info!(user_id, "Offline, queueing save");
            return self.save_offline(user_id, &snapshot, OFFLINE).await;
        }

        let Some(remote) = &self.remote else {
            self.keep_locally(user_id, &snapshot).await;
            tracing::debug!(user_id, "No remote backend, state kept locally");
            return SaveResult::failure(BACKEND_UNAVAILABLE);
        };

        // A drain must not replay an older save after this one lands.
        let _guard = self.drain_lock.lock().await;
        let superseded = self.queued_saves(user_id, captured_at).await;

        let policy = self.config.push_policy();
        match self
            .push_state(remote.as_ref(), user_id, &snapshot, &policy)
            .await
        {
            Ok(outcome) => {
                for id in &superseded {
                    if let Err(e) = self.store.remove_queued_operation(id).await {
                        tracing::warn!(id = %id, error = %e, "Failed to remove superseded save");
                    }
                }
                if !superseded.is_empty() {
                    tracing::debug!(user_id, count = superseded.len(), "Superseded queued saves");
                }
                self.accept(user_id, outcome).await
            }
            Err(e) if !e.is_transient() => {
                tracing::warn!(user_id, error = %e, "Push rejected");
                self.keep_locally(user_id, &snapshot).await;
                SaveResult::failure(e.to_string())
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Push failed, queueing save");
                self.save_offline(user_id, &snapshot, &e.to_string()).await
            }
        }
    }

    /// Pull the user's state and apply it to the application
    pub async fn restore(&self, user_id: &str) -> RestoreResult {
        if !is_valid_user(user_id) {
            tracing::warn!("Restore skipped: no authenticated user");
            return RestoreResult::failure(INVALID_USER);
        }

        match &self.remote {
            Some(_) if self.connectivity.is_offline() => {
                tracing::debug!(user_id, "Offline, restoring from local store");
            }
            Some(remote) => match remote.fetch_remote_state(user_id).await {
                Ok(remote_state) => return self.restore_remote(user_id, remote_state).await,
                Err(e) => {
                    tracing::warn!(
                        user_id,
                        error = %e,
                        "Remote fetch failed, restoring from local store"
                    );
                }
            },
            None => {}
        }

        self.restore_local(user_id).await
    }

    /// Replay queued operations against the remote store, oldest first
    ///
    /// Returns immediately while offline or without a backend, and stops
    /// early if connectivity drops mid-cycle. A drain requested while another
    /// is running is skipped; operations queued during a drain are picked up
    /// by the next one.
    pub async fn process_sync_queue(&self, user_id: &str) -> QueueDrainResult {
        if self.connectivity.is_offline() {
            tracing::debug!("Offline, not draining sync queue");
            return QueueDrainResult::idle();
        }

        let Some(remote) = &self.remote else {
            return QueueDrainResult::idle();
        };

        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("Sync queue drain already in progress");
            return QueueDrainResult::skipped();
        };

        let operations = match self.store.get_queued_operations().await {
            Ok(operations) => operations,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read sync queue");
                return QueueDrainResult {
                    error: Some(SyncError::from(e).to_string()),
                    ..Default::default()
                };
            }
        };

        if operations.is_empty() {
            return QueueDrainResult::idle();
        }

        tracing::info!(count = operations.len(), "Draining sync queue");
        let mut result = QueueDrainResult::idle();

        for op in operations {
            if self.connectivity.is_offline() {
                tracing::info!(
                    processed = result.processed,
                    "Went offline, stopping sync queue drain"
                );
                break;
            }

            match self.apply_operation(remote.as_ref(), user_id, &op).await {
                Ok(()) => {
                    if let Err(e) = self.store.remove_queued_operation(&op.id).await {
                        tracing::warn!(
                            id = %op.id,
                            error = %e,
                            "Failed to remove applied operation"
                        );
                    }
                    result.processed += 1;
                }
                Err(e) => {
                    result.failed += 1;
                    let attempts = op.retries.saturating_add(1);

                    if attempts >= self.config.max_retries {
                        tracing::error!(
                            id = %op.id,
                            table = %op.table,
                            op_type = %op.op_type,
                            attempts,
                            error = %e,
                            "Dropping queued operation after exhausting retries"
                        );
                        if let Err(e) = self.store.remove_queued_operation(&op.id).await {
                            tracing::warn!(
                                id = %op.id,
                                error = %e,
                                "Failed to remove dropped operation"
                            );
                        }
                        self.emit(SyncEvent::OperationDropped(op.clone()));
                        result.dropped.push(op);
                    } else {
                        tracing::warn!(
                            id = %op.id,
                            attempts,
                            error = %e,
                            "Queued operation failed"
                        );
                        if let Err(e) = self.store.increment_retry(&op.id).await {
                            tracing::warn!(id = %op.id, error = %e, "Failed to record retry");
                        }
                    }
                }
            }
        }

        tracing::info!(processed = result.processed, failed = result.failed, "Sync queue drained");
        self.emit(SyncEvent::QueueDrained {
            processed: result.processed,
            failed: result.failed,
        });
        result
    }

    async fn push_state(
        &self,
        remote: &dyn RemoteStateApi,
        user_id: &str,
        snapshot: &Value,
        policy: &RetryPolicy,
    ) -> std::result::Result<PushOutcome, RemoteError> {
        let baseline = remote.fetch_remote_state(user_id).await?.map(|r| r.version);
        tracing::debug!(user_id, baseline = ?baseline, "Pushing state");

        retry(policy, RemoteError::is_transient, || {
            remote.push_remote_state(user_id, snapshot, baseline)
        })
        .await
    }

    async fn accept(&self, user_id: &str, outcome: PushOutcome) -> SaveResult {
        if let Err(e) = self
            .store
            .save_state(user_id, &outcome.state, outcome.version)
            .await
        {
            tracing::warn!(user_id, error = %e, "Failed to cache accepted state");
        }
        if !outcome.conflicts.is_empty() {
            tracing::info!(
                user_id,
                conflicts = outcome.conflicts.len(),
                "Remote reported conflicts"
            );
        }

        tracing::info!(user_id, version = outcome.version, "State saved");
        self.emit(SyncEvent::Saved {
            user_id: user_id.to_string(),
            version: outcome.version,
            conflicts: outcome.conflicts.len(),
        });

        SaveResult {
            success: true,
            error: None,
            conflicts: outcome.conflicts,
            version: Some(outcome.version),
            queued_operation: None,
        }
    }

    async fn save_offline(&self, user_id: &str, snapshot: &Value, reason: &str) -> SaveResult {
        let existing = match self.store.load_state(user_id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to read local state");
                None
            }
        };

        let op_type = if existing.is_some() {
            OperationType::Update
        } else {
            OperationType::Create
        };
        let version = existing.map_or(0, |s| s.version);

        let op = NewOperation::new(
            op_type,
            self.config.state_table.clone(),
            json!({ "userId": user_id, "snapshot": snapshot }),
        );
        let operation_id = match self.store.queue_operation(op).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to queue save");
                None
            }
        };

        if let Err(e) = self.store.save_state(user_id, snapshot, version).await {
            tracing::warn!(user_id, error = %e, "Failed to keep state locally");
        }

        self.emit(SyncEvent::SavedOffline {
            user_id: user_id.to_string(),
            operation_id: operation_id.clone(),
            reason: reason.to_string(),
        });

        SaveResult {
            queued_operation: operation_id,
            ..SaveResult::failure(reason)
        }
    }

    /// Store the snapshot locally under the known version, without queueing
    async fn keep_locally(&self, user_id: &str, snapshot: &Value) {
        let version = match self.store.load_state(user_id).await {
            Ok(state) => state.map_or(0, |s| s.version),
            Err(_) => 0,
        };
        if let Err(e) = self.store.save_state(user_id, snapshot, version).await {
            tracing::warn!(user_id, error = %e, "Failed to keep state locally");
        }
    }

    /// Ids of state saves queued for `user_id` at or before `cutoff`
    async fn queued_saves(&self, user_id: &str, cutoff: i64) -> Vec<String> {
        match self.store.get_queued_operations().await {
            Ok(operations) => operations
                .into_iter()
                .filter(|op| op.timestamp <= cutoff)
                .filter(|op| self.state_owner(op, user_id) == Some(user_id))
                .map(|op| op.id)
                .collect(),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to read sync queue");
                Vec::new()
            }
        }
    }

    /// Whether a state save for `owner` is queued behind `op`
    async fn newer_save_queued(&self, owner: &str, op: &QueuedOperation) -> bool {
        match self.store.get_queued_operations().await {
            Ok(operations) => operations
                .iter()
                .skip_while(|queued| queued.id != op.id)
                .skip(1)
                .any(|queued| self.state_owner(queued, owner) == Some(owner)),
            Err(_) => false,
        }
    }

    /// Owner of a queued state save, or `None` for any other operation
    ///
    /// Saves without a `userId` belong to `fallback`.
    fn state_owner<'a>(&self, op: &'a QueuedOperation, fallback: &'a str) -> Option<&'a str> {
        if op.table != self.config.state_table || op.op_type == OperationType::Delete {
            return None;
        }
        Some(op.data.get("userId").and_then(Value::as_str).unwrap_or(fallback))
    }

    async fn restore_remote(
        &self,
        user_id: &str,
        remote_state: Option<RemoteState>,
    ) -> RestoreResult {
        let Some(remote_state) = remote_state else {
            tracing::debug!(user_id, "No remote state to restore");
            return RestoreResult::nothing_to_restore(Some(RestoreSource::Remote));
        };

        if let Err(e) = self
            .store
            .save_state(user_id, &remote_state.state, remote_state.version)
            .await
        {
            tracing::warn!(user_id, error = %e, "Failed to cache remote state");
        }

        self.apply(user_id, &remote_state.state, RestoreSource::Remote, now_millis())
            .await
    }

    async fn restore_local(&self, user_id: &str) -> RestoreResult {
        match self.store.load_state(user_id).await {
            Ok(Some(local)) => {
                self.apply(user_id, &local.snapshot, RestoreSource::Local, local.last_modified)
                    .await
            }
            Ok(None) => {
                tracing::debug!(user_id, "No local state to restore");
                RestoreResult::nothing_to_restore(None)
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, "Failed to read local state");
                RestoreResult::failure(SyncError::from(e).to_string())
            }
        }
    }

    async fn apply(
        &self,
        user_id: &str,
        snapshot: &Value,
        source: RestoreSource,
        timestamp: i64,
    ) -> RestoreResult {
        match self.app.restore_app_state(user_id, snapshot).await {
            Ok(report) => {
                tracing::info!(
                    user_id,
                    source = ?source,
                    restored = report.restored,
                    "State restored"
                );
                if report.restored {
                    self.emit(SyncEvent::Restored {
                        user_id: user_id.to_string(),
                        source,
                    });
                }

                RestoreResult {
                    success: true,
                    restored: report.restored,
                    error: None,
                    source: Some(source),
                    timestamp: Some(timestamp),
                    errors: report.errors,
                }
            }
            Err(e) => {
                let err = SyncError::Restore(e.to_string());
                tracing::error!(user_id, error = %err, "Restore failed");
                RestoreResult {
                    source: Some(source),
                    ..RestoreResult::failure(err.to_string())
                }
            }
        }
    }

    async fn apply_operation(
        &self,
        remote: &dyn RemoteStateApi,
        user_id: &str,
        op: &QueuedOperation,
    ) -> Result<()> {
        if let Some(owner) = self.state_owner(op, user_id) {
            let snapshot = op.data.get("snapshot").unwrap_or(&op.data);

            // The queue's retry counter is the retry budget here.
            let outcome = self
                .push_state(remote, owner, snapshot, &RetryPolicy::immediate(0))
                .await?;

            // The local copy already holds the newer snapshot.
            if self.newer_save_queued(owner, op).await {
                tracing::debug!(user_id = owner, "Newer save still queued, keeping local state");
                return Ok(());
            }

            if let Err(e) = self
                .store
                .save_state(owner, &outcome.state, outcome.version)
                .await
            {
                tracing::warn!(user_id = owner, error = %e, "Failed to cache accepted state");
            }
            return Ok(());
        }

        let mutation = RemoteMutation {
            table: op.table.clone(),
            kind: mutation_kind(op.op_type),
            data: op.data.clone(),
        };
        remote.apply_mutation(user_id, &mutation).await?;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn is_valid_user(user_id: &str) -> bool {
    !user_id.trim().is_empty()
}

fn mutation_kind(op_type: OperationType) -> MutationKind {
    match op_type {
        OperationType::Create => MutationKind::Create,
        OperationType::Update => MutationKind::Update,
        OperationType::Delete => MutationKind::Delete,
    }
}
