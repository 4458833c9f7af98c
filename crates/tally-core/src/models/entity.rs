//! Entity envelope models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Idempotency key for a queued mutation, using UUID v7 (time-sortable)
///
/// Assigned once when the mutation is enqueued and stable across every retry
/// of that mutation; the server deduplicates on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new unique client ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// An entity as the sync layer sees it: an opaque domain payload plus the
/// envelope needed to file, order, and reconcile it
///
/// The same shape serves cached server snapshots, locally pending entities,
/// and pull changes on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Owner of the entity
    pub user_id: String,
    /// Domain kind, e.g. `activity` or `habit`; never interpreted here
    pub entity_type: String,
    /// Client-generated entity identifier
    pub entity_id: String,
    /// View the entity is filed under locally (a date or a named list)
    pub view_key: String,
    /// Domain payload; opaque to the sync layer
    pub payload: serde_json::Value,
    /// Last-write timestamp (Unix ms)
    pub updated_at: i64,
    /// Soft-delete marker propagated through pull
    #[serde(default)]
    pub deleted: bool,
    /// Server-assigned change sequence; 0 until the server confirms the entity
    #[serde(default)]
    pub server_seq: i64,
}
