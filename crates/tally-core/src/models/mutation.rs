//! Queued mutation models

use crate::error::Error;
use crate::models::ClientId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of write a queue entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Stable string form used in storage and on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("Unknown operation: {other}"))),
        }
    }
}

/// Local state of a queue entry
///
/// `Syncing` is persisted while a batch is in flight so a crashed run can be
/// detected and released back to `Pending` on the next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Syncing,
    Failed,
}

impl EntryState {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("Unknown entry state: {other}"))),
        }
    }
}

/// A single pending mutation in the local log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Idempotency key, stable across retries
    pub client_id: ClientId,
    /// Owner of the mutation
    pub user_id: String,
    /// Domain kind of the target entity
    pub entity_type: String,
    /// Target entity identifier
    pub entity_id: String,
    /// View the entity is filed under locally
    pub view_key: String,
    /// What to do with the payload
    pub operation: Operation,
    /// Opaque domain payload; `Null` for deletes
    pub payload: serde_json::Value,
    /// Client wall-clock time at enqueue (Unix ms)
    pub enqueued_at: i64,
    /// Per-user monotonic order; drained ascending
    pub sequence: i64,
    /// Current local state
    pub state: EntryState,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Message from the most recent failure
    pub last_error: Option<String>,
    /// Set when the server rejected the payload; never retried automatically
    pub rejected: bool,
}

impl QueueEntry {
    /// Whether the entry may still be picked up by a sync run
    #[must_use]
    pub fn is_retryable(&self, max_retries: u32) -> bool {
        !self.rejected && self.retry_count < max_retries
    }
}

/// A mutation handed to the sync manager for enqueueing
#[derive(Debug, Clone, PartialEq)]
pub struct MutationWrite {
    pub entity_type: String,
    pub entity_id: String,
    pub view_key: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
}

impl MutationWrite {
    /// A create carrying the given payload
    #[must_use]
    pub fn create(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        view_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            view_key: view_key.into(),
            operation: Operation::Create,
            payload,
        }
    }

    /// An update replacing the entity's payload
    #[must_use]
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        view_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            view_key: view_key.into(),
            operation: Operation::Update,
            payload,
        }
    }

    /// A delete; carries no payload
    #[must_use]
    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        view_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            view_key: view_key.into(),
            operation: Operation::Delete,
            payload: serde_json::Value::Null,
        }
    }
}

/// Counts of log entries by state, the observable sync status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusCounts {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
}

impl SyncStatusCounts {
    /// True when nothing is queued, in flight, or failed
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.pending == 0 && self.syncing == 0 && self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_round_trips_through_str() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            let parsed: Operation = op.as_str().parse().unwrap();
            assert_eq!(op, parsed);
        }
    }

    #[test]
    fn operation_rejects_unknown() {
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn entry_state_round_trips_through_str() {
        for state in [EntryState::Pending, EntryState::Syncing, EntryState::Failed] {
            let parsed: EntryState = state.as_str().parse().unwrap();
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn delete_write_has_null_payload() {
        let write = MutationWrite::delete("activity", "e1", "2026-08-25");
        assert_eq!(write.operation, Operation::Delete);
        assert!(write.payload.is_null());
    }

    #[test]
    fn create_write_keeps_payload() {
        let write = MutationWrite::create("activity", "e1", "inbox", json!({"name": "Run"}));
        assert_eq!(write.payload["name"], "Run");
    }

    #[test]
    fn retryable_respects_rejection_and_budget() {
        let mut entry = QueueEntry {
            client_id: ClientId::new(),
            user_id: "u1".into(),
            entity_type: "activity".into(),
            entity_id: "e1".into(),
            view_key: "inbox".into(),
            operation: Operation::Create,
            payload: serde_json::Value::Null,
            enqueued_at: 0,
            sequence: 1,
            state: EntryState::Failed,
            retry_count: 2,
            last_error: None,
            rejected: false,
        };
        assert!(entry.is_retryable(3));
        entry.retry_count = 3;
        assert!(!entry.is_retryable(3));
        entry.retry_count = 0;
        entry.rejected = true;
        assert!(!entry.is_retryable(3));
    }
}
