//! Snapshot cache repository
//!
//! Holds the last server-confirmed entities per view, entities written
//! locally but not yet confirmed, and tombstones for unconfirmed deletes.
//! The reconciliation view reads all three; sync confirmations prune them.

use crate::error::Result;
use crate::models::EntityRecord;
use rusqlite::{params, Connection};
use std::collections::HashSet;

/// Trait for the local snapshot cache
pub trait SnapshotCache {
    /// Apply one pulled server change: upsert a live entity, drop a deleted one
    fn apply_server_change(&self, record: &EntityRecord) -> Result<()>;

    /// Remove a server-cached entity (used when its delete is confirmed)
    fn remove_server(&self, user_id: &str, entity_type: &str, entity_id: &str) -> Result<()>;

    /// Server-confirmed entities for a view, in server change order
    fn list_server(&self, user_id: &str, entity_type: &str, view_key: &str)
        -> Result<Vec<EntityRecord>>;

    /// Get one server-cached entity regardless of view
    fn get_server(&self, user_id: &str, entity_type: &str, entity_id: &str)
        -> Result<Option<EntityRecord>>;

    /// Insert or replace a locally written, not-yet-confirmed entity
    fn upsert_offline(&self, record: &EntityRecord) -> Result<()>;

    /// Remove a locally written entity (confirmed, superseded, or discarded)
    fn remove_offline(&self, user_id: &str, entity_type: &str, entity_id: &str) -> Result<()>;

    /// Locally written entities for a view, oldest write first
    fn list_offline(&self, user_id: &str, entity_type: &str, view_key: &str)
        -> Result<Vec<EntityRecord>>;

    /// Record an unconfirmed local delete
    fn add_tombstone(
        &self,
        user_id: &str,
        entity_type: &str,
        entity_id: &str,
        view_key: &str,
    ) -> Result<()>;

    /// Drop a tombstone once its delete is confirmed or discarded
    fn remove_tombstone(&self, user_id: &str, entity_type: &str, entity_id: &str) -> Result<()>;

    /// Tombstoned ids for a view
    fn tombstones(&self, user_id: &str, entity_type: &str, view_key: &str)
        -> Result<HashSet<String>>;

    /// Pull position for a user; 0 when never pulled
    fn cursor(&self, user_id: &str) -> Result<i64>;

    /// Persist the pull position; called only after a page is merged
    fn set_cursor(&self, user_id: &str, cursor: i64) -> Result<()>;

    /// Remove every cached row for a user (logout path)
    fn clear(&self, user_id: &str) -> Result<()>;
}

/// `SQLite` implementation of `SnapshotCache`
pub struct SqliteSnapshotCache<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSnapshotCache<'a> {
    /// Create a new cache over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an entity record from a cache row
    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        Ok(EntityRecord {
            user_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            view_key: row.get(3)?,
            payload: row.get(4)?,
            updated_at: row.get(5)?,
            deleted: false,
            server_seq: row.get(6)?,
        })
    }
}

impl SnapshotCache for SqliteSnapshotCache<'_> {
    fn apply_server_change(&self, record: &EntityRecord) -> Result<()> {
        if record.deleted {
            self.remove_server(&record.user_id, &record.entity_type, &record.entity_id)?;
            return Ok(());
        }

        self.conn.execute(
            "INSERT INTO server_cache
             (user_id, entity_type, entity_id, view_key, payload, updated_at, server_seq)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, entity_type, entity_id) DO UPDATE SET
                 view_key = excluded.view_key,
                 payload = excluded.payload,
                 updated_at = excluded.updated_at,
                 server_seq = excluded.server_seq",
            params![
                record.user_id,
                record.entity_type,
                record.entity_id,
                record.view_key,
                record.payload,
                record.updated_at,
                record.server_seq,
            ],
        )?;

        Ok(())
    }

    fn remove_server(&self, user_id: &str, entity_type: &str, entity_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM server_cache
             WHERE user_id = ? AND entity_type = ? AND entity_id = ?",
            params![user_id, entity_type, entity_id],
        )?;
        Ok(())
    }

    fn list_server(
        &self,
        user_id: &str,
        entity_type: &str,
        view_key: &str,
    ) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, entity_type, entity_id, view_key, payload, updated_at, server_seq
             FROM server_cache
             WHERE user_id = ? AND entity_type = ? AND view_key = ?
             ORDER BY server_seq ASC, entity_id ASC",
        )?;

        let records = stmt
            .query_map(params![user_id, entity_type, view_key], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn get_server(
        &self,
        user_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntityRecord>> {
        let result = self.conn.query_row(
            "SELECT user_id, entity_type, entity_id, view_key, payload, updated_at, server_seq
             FROM server_cache
             WHERE user_id = ? AND entity_type = ? AND entity_id = ?",
            params![user_id, entity_type, entity_id],
            Self::parse_record,
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upsert_offline(&self, record: &EntityRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO offline_entities
             (user_id, entity_type, entity_id, view_key, payload, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, entity_type, entity_id) DO UPDATE SET
                 view_key = excluded.view_key,
                 payload = excluded.payload,
                 updated_at = excluded.updated_at",
            params![
                record.user_id,
                record.entity_type,
                record.entity_id,
                record.view_key,
                record.payload,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn remove_offline(&self, user_id: &str, entity_type: &str, entity_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM offline_entities
             WHERE user_id = ? AND entity_type = ? AND entity_id = ?",
            params![user_id, entity_type, entity_id],
        )?;
        Ok(())
    }

    fn list_offline(
        &self,
        user_id: &str,
        entity_type: &str,
        view_key: &str,
    ) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, entity_type, entity_id, view_key, payload, updated_at, 0
             FROM offline_entities
             WHERE user_id = ? AND entity_type = ? AND view_key = ?
             ORDER BY updated_at ASC, entity_id ASC",
        )?;

        let records = stmt
            .query_map(params![user_id, entity_type, view_key], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn add_tombstone(
        &self,
        user_id: &str,
        entity_type: &str,
        entity_id: &str,
        view_key: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO tombstones
             (user_id, entity_type, entity_id, view_key, deleted_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                user_id,
                entity_type,
                entity_id,
                view_key,
                crate::util::unix_millis_now(),
            ],
        )?;
        Ok(())
    }

    fn remove_tombstone(&self, user_id: &str, entity_type: &str, entity_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM tombstones
             WHERE user_id = ? AND entity_type = ? AND entity_id = ?",
            params![user_id, entity_type, entity_id],
        )?;
        Ok(())
    }

    fn tombstones(
        &self,
        user_id: &str,
        entity_type: &str,
        view_key: &str,
    ) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id FROM tombstones
             WHERE user_id = ? AND entity_type = ? AND view_key = ?",
        )?;

        let ids = stmt
            .query_map(params![user_id, entity_type, view_key], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;

        Ok(ids)
    }

    fn cursor(&self, user_id: &str) -> Result<i64> {
        let result = self.conn.query_row(
            "SELECT cursor FROM sync_cursors WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        );

        match result {
            Ok(cursor) => Ok(cursor),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn set_cursor(&self, user_id: &str, cursor: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_cursors (user_id, cursor) VALUES (?, ?)",
            params![user_id, cursor],
        )?;
        Ok(())
    }

    fn clear(&self, user_id: &str) -> Result<()> {
        for table in ["server_cache", "offline_entities", "tombstones", "sync_cursors"] {
            self.conn.execute(
                &format!("DELETE FROM {table} WHERE user_id = ?"),
                params![user_id],
            )?;
        }
        Ok(())
    }
}
