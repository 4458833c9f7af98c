//! Wire types shared by the engine and the sync API

use crate::models::{ClientId, EntityRecord, Operation, QueueEntry};
use serde::{Deserialize, Serialize};

/// One queued mutation as sent to the server
///
/// The owning user is not part of the wire shape; the server takes it from
/// the authenticated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEntry {
    pub client_id: ClientId,
    pub entity_type: String,
    pub entity_id: String,
    pub view_key: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    /// Client wall-clock time of the write (Unix ms); used for last-write-wins
    pub enqueued_at: i64,
    /// Per-user client sequence; the server applies batches in this order
    pub sequence: i64,
}

impl From<&QueueEntry> for PushEntry {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            client_id: entry.client_id,
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            view_key: entry.view_key.clone(),
            operation: entry.operation,
            payload: entry.payload.clone(),
            enqueued_at: entry.enqueued_at,
            sequence: entry.sequence,
        }
    }
}

/// A batch of mutations for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub entries: Vec<PushEntry>,
}

/// Per-entry application status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    /// Applied; `server_id` names the authoritative entity
    Success,
    /// Already applied or already present; success-equivalent
    Duplicate,
    /// Rejected; `error_kind` says whether a retry could help
    Error,
}

/// Classification of a rejected entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionKind {
    /// The payload or envelope is invalid; retrying the same bytes cannot succeed
    Validation,
    /// The server failed while applying; safe to retry
    Internal,
}

/// Result of applying one pushed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub client_id: ClientId,
    pub status: PushStatus,
    /// Authoritative entity id after a success or duplicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Server change sequence assigned to a success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<RejectionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PushResult {
    /// A confirmed application
    #[must_use]
    pub fn success(client_id: ClientId, server_id: impl Into<String>, server_seq: i64) -> Self {
        Self {
            client_id,
            status: PushStatus::Success,
            server_id: Some(server_id.into()),
            server_seq: Some(server_seq),
            error_kind: None,
            message: None,
        }
    }

    /// An entry the server had already applied or otherwise resolved
    #[must_use]
    pub fn duplicate(client_id: ClientId, server_id: Option<String>) -> Self {
        Self {
            client_id,
            status: PushStatus::Duplicate,
            server_id,
            server_seq: None,
            error_kind: None,
            message: None,
        }
    }

    /// A rejected entry
    #[must_use]
    pub fn error(client_id: ClientId, kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            client_id,
            status: PushStatus::Error,
            server_id: None,
            server_seq: None,
            error_kind: Some(kind),
            message: Some(message.into()),
        }
    }
}

/// Results for the processed prefix of a push batch
///
/// The server stops at the first hard failure, so entries after it get no
/// result and the client releases them for the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
}

/// Candidate for the pre-flight duplicate check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateProbe {
    pub entity_type: String,
    /// Content fingerprint as produced by [`crate::sync::fingerprint`]
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCheckRequest {
    pub probes: Vec<DuplicateProbe>,
}

/// Answers in probe order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCheckResponse {
    pub results: Vec<bool>,
}

/// A page of server-side changes, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<EntityRecord>,
    /// Position to persist once this page is merged
    pub cursor: i64,
    pub has_more: bool,
}
