//! Records held by the local store
//!
//! Payloads are opaque `serde_json::Value`s; the store never looks inside them.
//! All timestamps are milliseconds since the Unix epoch (UTC).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cached copy of a user's full application state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Owner of the snapshot (primary key)
    pub user_id: String,
    /// Application-defined payload
    pub snapshot: Value,
    /// Time of the last local write
    pub last_modified: i64,
    /// Version last assigned by the remote store
    pub version: u64,
}

/// Kind of mutation a queued operation describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Create a remote record
    Create,
    /// Update a remote record
    Update,
    /// Delete a remote record
    Delete,
}

impl OperationType {
    /// Stable name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

/// A mutation waiting in the durable queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Locally generated identifier
    pub id: String,
    /// Mutation kind
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Logical remote resource the mutation targets
    pub table: String,
    /// Mutation payload
    pub data: Value,
    /// Enqueue time; defines processing order
    pub timestamp: i64,
    /// Failed drain attempts so far
    pub retries: u32,
}

/// Input for [`crate::SyncStore::queue_operation`]
///
/// The store assigns the id and starts `retries` at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Mutation kind
    pub op_type: OperationType,
    /// Logical remote resource the mutation targets
    pub table: String,
    /// Mutation payload
    pub data: Value,
    /// Enqueue time
    pub timestamp: i64,
}

impl NewOperation {
    /// Create an operation stamped with the current time
    pub fn new(op_type: OperationType, table: impl Into<String>, data: Value) -> Self {
        Self {
            op_type,
            table: table.into(),
            data,
            timestamp: now_millis(),
        }
    }

    /// Override the enqueue time
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Generic expiring cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedItem {
    /// Cache key
    pub key: String,
    /// Cached payload
    pub data: Value,
    /// Write time
    pub timestamp: i64,
    /// Absolute expiry time
    pub expires_at: i64,
}

impl CachedItem {
    /// Whether the entry has expired at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_type_parse() {
        for op in [OperationType::Create, OperationType::Update, OperationType::Delete] {
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
        assert!("upsert".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_queued_operation_wire_names() {
        let op = QueuedOperation {
            id: "op-1".to_string(),
            op_type: OperationType::Update,
            table: "user_state".to_string(),
            data: json!({"coins": 10}),
            timestamp: 1,
            retries: 0,
        };

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["table"], "user_state");
        assert!(value.get("opType").is_none());
    }

    #[test]
    fn test_new_operation_at() {
        let op = NewOperation::new(OperationType::Create, "pets", json!({})).at(42);
        assert_eq!(op.timestamp, 42);
        assert_eq!(op.table, "pets");
    }

    #[test]
    fn test_cached_item_expiry_boundary() {
        let item = CachedItem {
            key: "k".to_string(),
            data: json!(null),
            timestamp: 0,
            expires_at: 100,
        };
        assert!(!item.is_expired_at(99));
        assert!(item.is_expired_at(100));
    }
}
