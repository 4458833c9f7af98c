//! Mutation log repository

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // SQLite counts are i64

use crate::error::{Error, Result};
use crate::models::{ClientId, EntryState, MutationWrite, QueueEntry, SyncStatusCounts};
use crate::util::unix_millis_now;
use rusqlite::{params, Connection};

/// Trait for the durable local mutation log
///
/// Entries are append-only apart from retry bookkeeping; they leave the log
/// only when the server confirms them or the user discards them.
pub trait MutationLog {
    /// Append a mutation, assigning its idempotency key and the next
    /// per-user sequence number
    fn enqueue(&self, user_id: &str, write: &MutationWrite) -> Result<QueueEntry>;

    /// Get an entry by its idempotency key
    fn get(&self, client_id: &ClientId) -> Result<Option<QueueEntry>>;

    /// Entries awaiting or undergoing sync, ascending by sequence,
    /// optionally restricted to one entity type
    fn list_pending(&self, user_id: &str, entity_type: Option<&str>) -> Result<Vec<QueueEntry>>;

    /// Entries that failed, ascending by sequence
    fn list_failed(&self, user_id: &str) -> Result<Vec<QueueEntry>>;

    /// Mark every due entry as syncing and return them ascending by sequence
    ///
    /// Due means pending, or failed with retries left and not rejected. An
    /// entry queued behind a parked one for the same `(entity_type,
    /// entity_id)` is not due: pushing it would apply that entity's
    /// operations out of order. Unrelated entities are unaffected.
    fn claim_for_sync(&self, user_id: &str, max_retries: u32) -> Result<Vec<QueueEntry>>;

    /// Return claimed entries to pending, optionally for one entity type only
    fn release_claims(&self, user_id: &str, entity_type: Option<&str>) -> Result<()>;

    /// Remove an entry; removing an already-removed entry is a no-op
    fn remove(&self, client_id: &ClientId) -> Result<()>;

    /// Record a failed attempt and return the updated entry
    fn record_failure(&self, client_id: &ClientId, error: &str) -> Result<QueueEntry>;

    /// Mark an entry rejected by the server; it will not be retried
    fn mark_rejected(&self, client_id: &ClientId, error: &str) -> Result<()>;

    /// Clear failure bookkeeping so the entry is drained again
    fn reset_for_retry(&self, client_id: &ClientId) -> Result<()>;

    /// Remove every entry and the sequence counter for a user
    fn clear(&self, user_id: &str) -> Result<()>;

    /// Entry counts by state
    fn counts(&self, user_id: &str) -> Result<SyncStatusCounts>;
}

/// `SQLite` implementation of `MutationLog`
pub struct SqliteMutationLog<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMutationLog<'a> {
    /// Create a new log over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Advance and return the per-user sequence counter
    fn next_sequence(conn: &Connection, user_id: &str) -> Result<i64> {
        conn.execute(
            "INSERT INTO sync_counters (user_id, next_seq) VALUES (?, 1)
             ON CONFLICT(user_id) DO UPDATE SET next_seq = next_seq + 1",
            params![user_id],
        )?;

        let seq: i64 = conn.query_row(
            "SELECT next_seq FROM sync_counters WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )?;

        Ok(seq)
    }

    /// Parse a queue entry from a database row
    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
        let text_err = |idx: usize, e: Error| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        };

        let client_id: String = row.get(0)?;
        let operation: String = row.get(5)?;
        let state: String = row.get(9)?;

        Ok(QueueEntry {
            client_id: client_id
                .parse()
                .map_err(|e: uuid::Error| text_err(0, Error::InvalidInput(e.to_string())))?,
            user_id: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            view_key: row.get(4)?,
            operation: operation.parse().map_err(|e| text_err(5, e))?,
            payload: row.get(6)?,
            enqueued_at: row.get(7)?,
            sequence: row.get(8)?,
            state: state.parse().map_err(|e| text_err(9, e))?,
            retry_count: row.get::<_, i64>(10)? as u32,
            last_error: row.get(11)?,
            rejected: row.get::<_, i32>(12)? != 0,
        })
    }
}

const ENTRY_COLUMNS: &str = "client_id, user_id, entity_type, entity_id, view_key, \
     operation, payload, enqueued_at, sequence, state, retry_count, last_error, rejected";

impl MutationLog for SqliteMutationLog<'_> {
    fn enqueue(&self, user_id: &str, write: &MutationWrite) -> Result<QueueEntry> {
        if write.entity_type.trim().is_empty() || write.entity_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "entity_type and entity_id must be non-empty".into(),
            ));
        }

        // the counter bump and the insert land together or not at all
        let tx = self.conn.unchecked_transaction()?;
        let entry = QueueEntry {
            client_id: ClientId::new(),
            user_id: user_id.to_string(),
            entity_type: write.entity_type.clone(),
            entity_id: write.entity_id.clone(),
            view_key: write.view_key.clone(),
            operation: write.operation,
            payload: write.payload.clone(),
            enqueued_at: unix_millis_now(),
            sequence: Self::next_sequence(&tx, user_id)?,
            state: EntryState::Pending,
            retry_count: 0,
            last_error: None,
            rejected: false,
        };

        tx.execute(
            "INSERT INTO sync_queue
             (client_id, user_id, entity_type, entity_id, view_key,
              operation, payload, enqueued_at, sequence, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.client_id.as_str(),
                entry.user_id,
                entry.entity_type,
                entry.entity_id,
                entry.view_key,
                entry.operation.as_str(),
                entry.payload,
                entry.enqueued_at,
                entry.sequence,
                entry.state.as_str(),
            ],
        )?;
        tx.commit()?;

        Ok(entry)
    }

    fn get(&self, client_id: &ClientId) -> Result<Option<QueueEntry>> {
        let result = self.conn.query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE client_id = ?"),
            params![client_id.as_str()],
            Self::parse_entry,
        );

        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_pending(&self, user_id: &str, entity_type: Option<&str>) -> Result<Vec<QueueEntry>> {
        let entries = if let Some(entity_type) = entity_type {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue
                 WHERE user_id = ? AND state IN ('pending', 'syncing') AND entity_type = ?
                 ORDER BY sequence ASC"
            ))?;
            let rows = stmt.query_map(params![user_id, entity_type], Self::parse_entry)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue
                 WHERE user_id = ? AND state IN ('pending', 'syncing')
                 ORDER BY sequence ASC"
            ))?;
            let rows = stmt.query_map(params![user_id], Self::parse_entry)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        Ok(entries)
    }

    fn list_failed(&self, user_id: &str) -> Result<Vec<QueueEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE user_id = ? AND state = 'failed'
             ORDER BY sequence ASC"
        ))?;

        let entries = stmt
            .query_map(params![user_id], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    fn claim_for_sync(&self, user_id: &str, max_retries: u32) -> Result<Vec<QueueEntry>> {
        // A parked entry (rejected, or out of retries) holds back everything
        // enqueued after it for the same entity until it is retried or
        // discarded.
        self.conn.execute(
            "UPDATE sync_queue SET state = 'syncing'
             WHERE user_id = ?1
               AND (state = 'pending'
                    OR (state = 'failed' AND rejected = 0 AND retry_count < ?2))
               AND NOT EXISTS (
                   SELECT 1 FROM sync_queue AS parked
                    WHERE parked.user_id = sync_queue.user_id
                      AND parked.entity_type = sync_queue.entity_type
                      AND parked.entity_id = sync_queue.entity_id
                      AND parked.sequence < sync_queue.sequence
                      AND parked.state = 'failed'
                      AND (parked.rejected = 1 OR parked.retry_count >= ?2))",
            params![user_id, i64::from(max_retries)],
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE user_id = ? AND state = 'syncing'
             ORDER BY sequence ASC"
        ))?;

        let entries = stmt
            .query_map(params![user_id], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    fn release_claims(&self, user_id: &str, entity_type: Option<&str>) -> Result<()> {
        if let Some(entity_type) = entity_type {
            self.conn.execute(
                "UPDATE sync_queue SET state = 'pending'
                 WHERE user_id = ? AND state = 'syncing' AND entity_type = ?",
                params![user_id, entity_type],
            )?;
        } else {
            self.conn.execute(
                "UPDATE sync_queue SET state = 'pending'
                 WHERE user_id = ? AND state = 'syncing'",
                params![user_id],
            )?;
        }
        Ok(())
    }

    fn remove(&self, client_id: &ClientId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_queue WHERE client_id = ?",
            params![client_id.as_str()],
        )?;
        Ok(())
    }

    fn record_failure(&self, client_id: &ClientId, error: &str) -> Result<QueueEntry> {
        let rows = self.conn.execute(
            "UPDATE sync_queue
             SET state = 'failed', retry_count = retry_count + 1, last_error = ?
             WHERE client_id = ?",
            params![error, client_id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(client_id.to_string()));
        }

        self.get(client_id)?
            .ok_or_else(|| Error::NotFound(client_id.to_string()))
    }

    fn mark_rejected(&self, client_id: &ClientId, error: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE sync_queue
             SET state = 'failed', rejected = 1,
                 retry_count = retry_count + 1, last_error = ?
             WHERE client_id = ?",
            params![error, client_id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(client_id.to_string()));
        }

        Ok(())
    }

    fn reset_for_retry(&self, client_id: &ClientId) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE sync_queue
             SET state = 'pending', rejected = 0, retry_count = 0, last_error = NULL
             WHERE client_id = ?",
            params![client_id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(client_id.to_string()));
        }

        Ok(())
    }

    fn clear(&self, user_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_queue WHERE user_id = ?",
            params![user_id],
        )?;
        self.conn.execute(
            "DELETE FROM sync_counters WHERE user_id = ?",
            params![user_id],
        )?;
        Ok(())
    }

    fn counts(&self, user_id: &str) -> Result<SyncStatusCounts> {
        let mut stmt = self.conn.prepare(
            "SELECT state, COUNT(*) FROM sync_queue WHERE user_id = ? GROUP BY state",
        )?;

        let mut counts = SyncStatusCounts::default();
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;

        for row in rows {
            let (state, count) = row?;
            match state.as_str() {
                "pending" => counts.pending = count,
                "syncing" => counts.syncing = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }

        Ok(counts)
    }
}
