//! Durable local store
//!
//! [`LocalStore`] is the single handle through which the sync engine reads and
//! writes its three tables. Every operation is one SQLite statement (and so one
//! transaction); a table is never left partially written.
//!
//! If the database cannot be opened, [`LocalStore::init`] does not fail. The
//! handle degrades to a no-op store: reads resolve to empty results and writes
//! are rejected with [`StoreError::Unavailable`], which callers treat as a soft
//! failure.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};
use std::time::Duration;
use thiserror::Error;

use crate::database::{DatabaseConfig, DatabaseError, SqliteDatabase};
use crate::models::{now_millis, CachedItem, NewOperation, QueuedOperation, StateSnapshot};
use crate::schema;

/// Local store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database setup error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Query error
    #[error("Query error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistence is disabled or could not be opened
    #[error("Local storage unavailable")]
    Unavailable,

    /// A stored row could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result type for local store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage contract used by the sync orchestrator
///
/// Implemented by [`LocalStore`]; tests may substitute their own fakes.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Upsert the snapshot row for `user_id`, stamping `last_modified` with now
    async fn save_state(&self, user_id: &str, snapshot: &Value, version: u64) -> Result<()>;

    /// Load the snapshot row for `user_id`
    async fn load_state(&self, user_id: &str) -> Result<Option<StateSnapshot>>;

    /// Insert a queued operation with a fresh id and zero retries, returning the id
    async fn queue_operation(&self, op: NewOperation) -> Result<String>;

    /// All queued operations, oldest first
    async fn get_queued_operations(&self) -> Result<Vec<QueuedOperation>>;

    /// Delete a queued operation; unknown ids are ignored
    async fn remove_queued_operation(&self, id: &str) -> Result<()>;

    /// Atomically bump the retry counter, returning the new value
    ///
    /// Returns `None` if the operation no longer exists.
    async fn increment_retry(&self, id: &str) -> Result<Option<u32>>;

    /// Write a cache entry that expires after `ttl`
    async fn set_cached_item(&self, key: &str, data: &Value, ttl: Duration) -> Result<()>;

    /// Read a cache entry; expired entries read as `None`
    async fn get_cached_item(&self, key: &str) -> Result<Option<CachedItem>>;

    /// Delete expired cache entries, returning how many were removed
    async fn clear_expired_cache(&self) -> Result<u64>;
}

/// SQLite-backed local store handle
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Option<SqliteDatabase>,
}

impl LocalStore {
    /// Open (or create) the store described by `config`
    ///
    /// Never fails: an unusable database yields a degraded store, see
    /// [`LocalStore::is_available`].
    pub async fn init(config: &DatabaseConfig) -> Self {
        match Self::open(config).await {
            Ok(db) => {
                tracing::info!(path = %config.path, "Local store ready");
                Self { db: Some(db) }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config.path,
                    error = %e,
                    "Local store unavailable, continuing without persistence"
                );
                Self::unavailable()
            }
        }
    }

    async fn open(config: &DatabaseConfig) -> Result<SqliteDatabase> {
        let db = SqliteDatabase::new(config).await?;
        db.migrate(&schema::migrations()).await?;
        Ok(db)
    }

    /// Create a migrated in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        let db = SqliteDatabase::in_memory().await?;
        db.migrate(&schema::migrations()).await?;
        Ok(Self { db: Some(db) })
    }

    /// A store with no backing database
    pub fn unavailable() -> Self {
        Self { db: None }
    }

    /// Whether a database is backing this store
    pub fn is_available(&self) -> bool {
        self.db.is_some()
    }

    fn db(&self) -> Result<&SqliteDatabase> {
        self.db.as_ref().ok_or(StoreError::Unavailable)
    }

    /// Number of operations waiting in the queue
    pub async fn pending_operation_count(&self) -> Result<u64> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(db.pool())
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Serialize and cache a typed value
    pub async fn set_cached<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let data = serde_json::to_value(value)?;
        self.set_cached_item(key, &data, ttl).await
    }

    /// Read and deserialize a cached value
    pub async fn get_cached<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get_cached_item(key).await? {
            Some(item) => Ok(Some(serde_json::from_value(item.data)?)),
            None => Ok(None),
        }
    }

    /// Close the underlying connections
    pub async fn close(&self) {
        if let Some(db) = &self.db {
            db.close().await;
        }
    }
}

#[async_trait]
impl SyncStore for LocalStore {
    async fn save_state(&self, user_id: &str, snapshot: &Value, version: u64) -> Result<()> {
        let db = self.db()?;
        let payload = serde_json::to_string(snapshot)?;

        sqlx::query(
            "INSERT INTO app_state (user_id, snapshot, last_modified, version)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                last_modified = excluded.last_modified,
                version = excluded.version",
        )
        .bind(user_id)
        .bind(payload)
        .bind(now_millis())
        .bind(version as i64)
        .execute(db.pool())
        .await?;

        tracing::debug!(user_id, version, "Saved local state snapshot");
        Ok(())
    }

    async fn load_state(&self, user_id: &str) -> Result<Option<StateSnapshot>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT user_id, snapshot, last_modified, version FROM app_state WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(db.pool())
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn queue_operation(&self, op: NewOperation) -> Result<String> {
        let db = self.db()?;
        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&op.data)?;

        sqlx::query(
            "INSERT INTO sync_queue (id, op_type, table_name, data, timestamp, retries)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(&id)
        .bind(op.op_type.as_str())
        .bind(&op.table)
        .bind(payload)
        .bind(op.timestamp)
        .execute(db.pool())
        .await?;

        tracing::debug!(id = %id, table = %op.table, op_type = %op.op_type, "Queued operation");
        Ok(id)
    }

    async fn get_queued_operations(&self) -> Result<Vec<QueuedOperation>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        // rowid breaks timestamp ties in insertion order
        let rows = sqlx::query(
            "SELECT id, op_type, table_name, data, timestamp, retries
             FROM sync_queue ORDER BY timestamp ASC, rowid ASC",
        )
        .fetch_all(db.pool())
        .await?;

        rows.iter().map(operation_from_row).collect()
    }

    async fn remove_queued_operation(&self, id: &str) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await?;
        Ok(())
    }

    async fn increment_retry(&self, id: &str) -> Result<Option<u32>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        let retries: Option<i64> = sqlx::query_scalar(
            "UPDATE sync_queue SET retries = retries + 1 WHERE id = ? RETURNING retries",
        )
        .bind(id)
        .fetch_optional(db.pool())
        .await?;

        retries
            .map(|r| u32::try_from(r).map_err(|_| StoreError::Corrupt(format!("retries {}", r))))
            .transpose()
    }

    async fn set_cached_item(&self, key: &str, data: &Value, ttl: Duration) -> Result<()> {
        let db = self.db()?;
        let payload = serde_json::to_string(data)?;
        let now = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO cache (key, data, timestamp, expires_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                timestamp = excluded.timestamp,
                expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(payload)
        .bind(now)
        .bind(now.saturating_add(ttl_ms))
        .execute(db.pool())
        .await?;
        Ok(())
    }

    async fn get_cached_item(&self, key: &str) -> Result<Option<CachedItem>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        let row = sqlx::query("SELECT key, data, timestamp, expires_at FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(db.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let item = cached_item_from_row(&row)?;
        if item.is_expired_at(now_millis()) {
            return Ok(None);
        }
        Ok(Some(item))
    }

    async fn clear_expired_cache(&self) -> Result<u64> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(db.pool())
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::debug!(removed, "Cleared expired cache entries");
        }
        Ok(removed)
    }
}

fn snapshot_from_row(row: &SqliteRow) -> Result<StateSnapshot> {
    let snapshot: String = row.try_get("snapshot")?;
    let version: i64 = row.try_get("version")?;

    Ok(StateSnapshot {
        user_id: row.try_get("user_id")?,
        snapshot: serde_json::from_str(&snapshot)?,
        last_modified: row.try_get("last_modified")?,
        version: u64::try_from(version)
            .map_err(|_| StoreError::Corrupt(format!("negative version {}", version)))?,
    })
}

fn operation_from_row(row: &SqliteRow) -> Result<QueuedOperation> {
    let op_type: String = row.try_get("op_type")?;
    let data: String = row.try_get("data")?;
    let retries: i64 = row.try_get("retries")?;

    Ok(QueuedOperation {
        id: row.try_get("id")?,
        op_type: op_type.parse().map_err(StoreError::Corrupt)?,
        table: row.try_get("table_name")?,
        data: serde_json::from_str(&data)?,
        timestamp: row.try_get("timestamp")?,
        retries: u32::try_from(retries)
            .map_err(|_| StoreError::Corrupt(format!("retries {}", retries)))?,
    })
}

fn cached_item_from_row(row: &SqliteRow) -> Result<CachedItem> {
    let data: String = row.try_get("data")?;

    Ok(CachedItem {
        key: row.try_get("key")?,
        data: serde_json::from_str(&data)?,
        timestamp: row.try_get("timestamp")?,
        expires_at: row.try_get("expires_at")?,
    })
}
