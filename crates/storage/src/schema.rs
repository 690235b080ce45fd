//! Local store schema
//!
//! Three tables: the per-user state snapshot, the FIFO sync queue (indexed by
//! enqueue time) and the expiring cache (indexed by expiry for sweeping).

use crate::database::MigrationDefinition;

/// Schema version the store expects after migrating
pub const SCHEMA_VERSION: i64 = 1;

/// Table holding one state snapshot per user
pub const STATE_TABLE: &str = "app_state";
/// Table holding queued mutations
pub const QUEUE_TABLE: &str = "sync_queue";
/// Table holding expiring cache entries
pub const CACHE_TABLE: &str = "cache";

/// All migrations for the local store, in order
pub fn migrations() -> Vec<MigrationDefinition> {
    vec![MigrationDefinition::new(
        1,
        "Create state, sync queue and cache tables",
        "CREATE TABLE IF NOT EXISTS app_state (
            user_id TEXT PRIMARY KEY NOT NULL,
            snapshot TEXT NOT NULL,
            last_modified INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY NOT NULL,
            op_type TEXT NOT NULL,
            table_name TEXT NOT NULL,
            data TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp);
        CREATE TABLE IF NOT EXISTS cache (
            key TEXT PRIMARY KEY NOT NULL,
            data TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at);",
    )]
}
