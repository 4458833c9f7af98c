//! Authoritative sync ledger
//!
//! The server half of the wire protocol: one row per entity, per-entity sync
//! metadata, and an append-only operation log keyed by client id. The
//! operation log is the idempotency boundary that makes client retries safe;
//! a global counter hands out `server_seq` so every applied change has a
//! total order for pull paging.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tally_core::models::{EntityRecord, Operation};
use tally_core::sync::fingerprint;
use tally_core::sync::protocol::{
    DuplicateProbe, PullResponse, PushEntry, PushResult, RejectionKind,
};
use tally_core::util::unix_millis_now;

use crate::error::AppError;

const STATUS_SYNCING: &str = "syncing";
const STATUS_SYNCED: &str = "synced";
const STATUS_FAILED: &str = "failed";

/// Authoritative store behind the sync endpoints
///
/// Everything on it is synchronous; the connection sits behind a mutex and
/// statements stay short, the same discipline the engine applies to its
/// local store.
pub struct SyncLedger {
    conn: Mutex<Connection>,
    entity_types: Vec<String>,
}

/// Per-status row counts over `sync_metadata`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
}

impl SyncLedger {
    /// Open a ledger at the given path, creating it if it doesn't exist
    pub fn open(path: impl AsRef<Path>, entity_types: Vec<String>) -> Result<Self, AppError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::internal(format!("Cannot create ledger directory: {e}")))?;
        }
        Self::from_connection(Connection::open(path)?, entity_types)
    }

    /// Open an in-memory ledger (useful for testing)
    pub fn open_in_memory(entity_types: Vec<String>) -> Result<Self, AppError> {
        Self::from_connection(Connection::open_in_memory()?, entity_types)
    }

    fn from_connection(conn: Connection, entity_types: Vec<String>) -> Result<Self, AppError> {
        // WAL is unavailable for in-memory databases; ignore the outcome
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            entity_types,
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<(), AppError> {
        let statements = [
            // One row per entity, kept after deletion so pulls can propagate it
            "CREATE TABLE IF NOT EXISTS entities (
                user_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                view_key TEXT NOT NULL,
                payload TEXT,
                fingerprint TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                server_seq INTEGER NOT NULL,
                PRIMARY KEY (user_id, entity_type, entity_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_entities_user_seq
             ON entities(user_id, server_seq)",
            "CREATE INDEX IF NOT EXISTS idx_entities_fingerprint
             ON entities(user_id, entity_type, fingerprint)",
            // Per-entity sync state for operator visibility
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                user_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'syncing', 'synced', 'failed')),
                origin_client_id TEXT NOT NULL,
                last_synced_at INTEGER,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, entity_type, entity_id)
            )",
            // Applied operations keyed by client id; replays resolve here
            "CREATE TABLE IF NOT EXISTS sync_operations (
                client_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                server_seq INTEGER NOT NULL,
                applied_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_operations_user
             ON sync_operations(user_id, server_seq)",
            // Global change counter; one row
            "CREATE TABLE IF NOT EXISTS ledger_counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
        ];

        for stmt in statements {
            conn.execute(stmt, [])?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a push batch in the order given (clients send ascending sequence)
    ///
    /// Returns one result per processed entry. A hard storage failure answers
    /// for the entry that hit it and stops the batch there; unanswered
    /// entries stay queued on the client for the next run.
    pub fn apply_batch(
        &self,
        user_id: &str,
        entries: &[PushEntry],
    ) -> Result<Vec<PushResult>, AppError> {
        let conn = self.lock();
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            match Self::apply_entry(&conn, &self.entity_types, user_id, entry) {
                Ok(result) => results.push(result),
                Err(error) => {
                    tracing::error!(
                        entity_type = entry.entity_type,
                        operation = entry.operation.as_str(),
                        error = %error,
                        "Failed to apply push entry"
                    );
                    let message = error.to_string();
                    Self::set_metadata(&conn, user_id, entry, STATUS_FAILED, Some(&message)).ok();
                    results.push(PushResult::error(
                        entry.client_id,
                        RejectionKind::Internal,
                        message,
                    ));
                    break;
                }
            }
        }

        Ok(results)
    }

    /// Changes after `cursor` for one user, oldest first, including deletions
    pub fn changes_since(
        &self,
        user_id: &str,
        cursor: i64,
        limit: usize,
    ) -> Result<PullResponse, AppError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, entity_type, entity_id, view_key, payload,
                    updated_at, deleted, server_seq
             FROM entities
             WHERE user_id = ? AND server_seq > ?
             ORDER BY server_seq
             LIMIT ?",
        )?;

        // One extra row decides has_more without a second query
        let fetch = i64::try_from(limit)
            .map_err(|_| AppError::bad_request("limit is out of range"))?
            .saturating_add(1);
        let mut rows = stmt.query(params![user_id, cursor, fetch])?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(Self::parse_record(row)?);
        }

        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let cursor = changes.last().map_or(cursor, |record| record.server_seq);

        Ok(PullResponse {
            changes,
            cursor,
            has_more,
        })
    }

    /// Whether each probed fingerprint matches a live entity; answers in
    /// probe order, no side effects
    pub fn check_duplicates(
        &self,
        user_id: &str,
        probes: &[DuplicateProbe],
    ) -> Result<Vec<bool>, AppError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT EXISTS(
                SELECT 1 FROM entities
                WHERE user_id = ? AND entity_type = ? AND fingerprint = ? AND deleted = 0
             )",
        )?;

        let mut results = Vec::with_capacity(probes.len());
        for probe in probes {
            let hit: bool = stmt.query_row(
                params![user_id, probe.entity_type, probe.fingerprint],
                |row| row.get(0),
            )?;
            results.push(hit);
        }
        Ok(results)
    }

    /// Per-status metadata counts for one user
    pub fn status_summary(&self, user_id: &str) -> Result<StatusSummary, AppError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM sync_metadata WHERE user_id = ? GROUP BY status",
        )?;

        let mut summary = StatusSummary::default();
        let mut rows = stmt.query(params![user_id])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: u64 = row.get(1)?;
            match status.as_str() {
                "pending" => summary.pending = count,
                STATUS_SYNCING => summary.syncing = count,
                STATUS_SYNCED => summary.synced = count,
                STATUS_FAILED => summary.failed = count,
                other => tracing::warn!(status = other, "Unknown sync metadata status"),
            }
        }
        Ok(summary)
    }

    /// Apply one entry inside its own transaction
    fn apply_entry(
        conn: &Connection,
        entity_types: &[String],
        user_id: &str,
        entry: &PushEntry,
    ) -> rusqlite::Result<PushResult> {
        // Replay of an operation the ledger already applied; answer with the
        // entity it resolved to and change nothing.
        if let Some(prior) = Self::replayed_entity(conn, entry)? {
            return Ok(PushResult::duplicate(entry.client_id, Some(prior)));
        }

        if let Some(reason) = Self::validate(entity_types, entry) {
            Self::set_metadata(conn, user_id, entry, STATUS_FAILED, Some(&reason))?;
            return Ok(PushResult::error(
                entry.client_id,
                RejectionKind::Validation,
                reason,
            ));
        }

        conn.execute("BEGIN IMMEDIATE", [])?;
        let applied = match entry.operation {
            Operation::Create => Self::apply_create(conn, user_id, entry),
            Operation::Update => Self::apply_update(conn, user_id, entry),
            Operation::Delete => Self::apply_delete(conn, user_id, entry),
        };
        match applied {
            Ok(result) => {
                conn.execute("COMMIT", [])?;
                Ok(result)
            }
            Err(error) => {
                conn.execute("ROLLBACK", []).ok();
                Err(error)
            }
        }
    }

    /// Entity id a previously applied operation with this client id produced
    fn replayed_entity(conn: &Connection, entry: &PushEntry) -> rusqlite::Result<Option<String>> {
        conn.query_row(
            "SELECT entity_id FROM sync_operations WHERE client_id = ?",
            params![entry.client_id.as_str()],
            |row| row.get(0),
        )
        .optional()
    }

    /// Boundary validation: entity-type registry plus payload shape
    fn validate(entity_types: &[String], entry: &PushEntry) -> Option<String> {
        if !entity_types.iter().any(|t| t == &entry.entity_type) {
            return Some(format!("Unknown entity type `{}`", entry.entity_type));
        }
        if entry.entity_id.trim().is_empty() {
            return Some("Entity id must not be empty".to_string());
        }
        if entry.operation != Operation::Delete && !entry.payload.is_object() {
            return Some("Payload must be a JSON object".to_string());
        }
        None
    }

    fn apply_create(
        conn: &Connection,
        user_id: &str,
        entry: &PushEntry,
    ) -> rusqlite::Result<PushResult> {
        // An entity already lives under this id: the earlier copy is
        // authoritative and the retried create resolves as a duplicate.
        let existing: Option<String> = conn
            .query_row(
                "SELECT entity_id FROM entities
                 WHERE user_id = ? AND entity_type = ? AND entity_id = ? AND deleted = 0",
                params![user_id, entry.entity_type, entry.entity_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(PushResult::duplicate(entry.client_id, Some(id)));
        }

        // Same content under a different id: a double submit; point the
        // client at the surviving entity.
        let print = fingerprint(&entry.entity_type, &entry.payload);
        let twin: Option<String> = conn
            .query_row(
                "SELECT entity_id FROM entities
                 WHERE user_id = ? AND entity_type = ? AND fingerprint = ? AND deleted = 0
                 ORDER BY server_seq
                 LIMIT 1",
                params![user_id, entry.entity_type, print],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = twin {
            return Ok(PushResult::duplicate(entry.client_id, Some(id)));
        }

        Self::set_metadata(conn, user_id, entry, STATUS_SYNCING, None)?;
        let server_seq = Self::next_server_seq(conn)?;
        conn.execute(
            "INSERT INTO entities
             (user_id, entity_type, entity_id, view_key, payload, fingerprint,
              updated_at, deleted, server_seq)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
            params![
                user_id,
                entry.entity_type,
                entry.entity_id,
                entry.view_key,
                entry.payload,
                print,
                entry.enqueued_at,
                server_seq,
            ],
        )?;
        Self::record_operation(conn, user_id, entry, server_seq)?;
        Self::set_metadata(conn, user_id, entry, STATUS_SYNCED, None)?;

        Ok(PushResult::success(
            entry.client_id,
            entry.entity_id.clone(),
            server_seq,
        ))
    }

    fn apply_update(
        conn: &Connection,
        user_id: &str,
        entry: &PushEntry,
    ) -> rusqlite::Result<PushResult> {
        Self::set_metadata(conn, user_id, entry, STATUS_SYNCING, None)?;

        // Last write wins in server arrival order; an update for an entity
        // the ledger has never seen (or has seen deleted) re-materializes it.
        let print = fingerprint(&entry.entity_type, &entry.payload);
        let server_seq = Self::next_server_seq(conn)?;
        conn.execute(
            "INSERT INTO entities
             (user_id, entity_type, entity_id, view_key, payload, fingerprint,
              updated_at, deleted, server_seq)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(user_id, entity_type, entity_id) DO UPDATE SET
                 view_key = excluded.view_key,
                 payload = excluded.payload,
                 fingerprint = excluded.fingerprint,
                 updated_at = excluded.updated_at,
                 deleted = 0,
                 server_seq = excluded.server_seq",
            params![
                user_id,
                entry.entity_type,
                entry.entity_id,
                entry.view_key,
                entry.payload,
                print,
                entry.enqueued_at,
                server_seq,
            ],
        )?;
        Self::record_operation(conn, user_id, entry, server_seq)?;
        Self::set_metadata(conn, user_id, entry, STATUS_SYNCED, None)?;

        Ok(PushResult::success(
            entry.client_id,
            entry.entity_id.clone(),
            server_seq,
        ))
    }

    fn apply_delete(
        conn: &Connection,
        user_id: &str,
        entry: &PushEntry,
    ) -> rusqlite::Result<PushResult> {
        Self::set_metadata(conn, user_id, entry, STATUS_SYNCING, None)?;

        // The row survives as a deletion marker so pulls propagate it;
        // deleting an unknown entity is a no-op that still succeeds.
        let server_seq = Self::next_server_seq(conn)?;
        let marked = conn.execute(
            "UPDATE entities
             SET deleted = 1, payload = ?, fingerprint = '', updated_at = ?, server_seq = ?
             WHERE user_id = ? AND entity_type = ? AND entity_id = ?",
            params![
                serde_json::Value::Null,
                entry.enqueued_at,
                server_seq,
                user_id,
                entry.entity_type,
                entry.entity_id,
            ],
        )?;
        if marked == 0 {
            tracing::debug!(
                entity_type = entry.entity_type,
                "Delete for an unknown entity; treating as already applied"
            );
        }
        Self::record_operation(conn, user_id, entry, server_seq)?;
        Self::set_metadata(conn, user_id, entry, STATUS_SYNCED, None)?;

        Ok(PushResult::success(
            entry.client_id,
            entry.entity_id.clone(),
            server_seq,
        ))
    }

    fn next_server_seq(conn: &Connection) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO ledger_counters (name, value) VALUES ('server_seq', 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            [],
        )?;
        conn.query_row(
            "SELECT value FROM ledger_counters WHERE name = 'server_seq'",
            [],
            |row| row.get(0),
        )
    }

    fn record_operation(
        conn: &Connection,
        user_id: &str,
        entry: &PushEntry,
        server_seq: i64,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO sync_operations
             (client_id, user_id, entity_type, entity_id, operation, server_seq, applied_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.client_id.as_str(),
                user_id,
                entry.entity_type,
                entry.entity_id,
                entry.operation.as_str(),
                server_seq,
                unix_millis_now(),
            ],
        )?;
        Ok(())
    }

    /// Upsert the metadata row for an entry's entity
    ///
    /// `last_synced_at` only moves on a synced write; `retry_count` only
    /// grows on a failed one; an error message is cleared by any non-failed
    /// transition.
    fn set_metadata(
        conn: &Connection,
        user_id: &str,
        entry: &PushEntry,
        status: &str,
        error: Option<&str>,
    ) -> rusqlite::Result<()> {
        let synced_at = (status == STATUS_SYNCED).then(unix_millis_now);
        conn.execute(
            "INSERT INTO sync_metadata
             (user_id, entity_type, entity_id, status, origin_client_id,
              last_synced_at, error_message, retry_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, entity_type, entity_id) DO UPDATE SET
                 status = excluded.status,
                 origin_client_id = excluded.origin_client_id,
                 last_synced_at = COALESCE(excluded.last_synced_at, last_synced_at),
                 error_message = excluded.error_message,
                 retry_count = retry_count + (excluded.status = 'failed')",
            params![
                user_id,
                entry.entity_type,
                entry.entity_id,
                status,
                entry.client_id.as_str(),
                synced_at,
                error,
                i64::from(status == STATUS_FAILED),
            ],
        )?;
        Ok(())
    }

    /// Parse an entity record from a ledger row
    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        Ok(EntityRecord {
            user_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            view_key: row.get(3)?,
            payload: row.get(4)?,
            updated_at: row.get(5)?,
            deleted: row.get(6)?,
            server_seq: row.get(7)?,
        })
    }
}
