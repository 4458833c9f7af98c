//! Local store connection management

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;

use super::migrations;

/// Handle to the engine's local `SQLite` store
///
/// Holds the mutation log, the per-view snapshot cache, tombstones, and the
/// pull cursor. Everything on it is synchronous; callers that share a store
/// across tasks wrap it in a mutex and keep statements short.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Open a store at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        store.release_stale_claims()?;
        Ok(store)
    }

    /// Configure `SQLite` for optimal performance
    fn configure(&self) -> Result<()> {
        // WAL is unavailable for in-memory databases; ignore the outcome
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Run store migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Entries claimed by a run that never finished go back to pending
    fn release_stale_claims(&self) -> Result<()> {
        let released = self.conn.execute(
            "UPDATE sync_queue SET state = 'pending' WHERE state = 'syncing'",
            [],
        )?;
        if released > 0 {
            tracing::info!(released, "Released queue entries from an interrupted sync run");
        }
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let store = LocalStore::open_in_memory().unwrap();
        let one: i32 = store
            .connection()
            .query_row("SELECT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_open_on_disk_persists() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("tally.db");

        {
            let store = LocalStore::open(&path).unwrap();
            store
                .connection()
                .execute(
                    "INSERT INTO sync_cursors (user_id, cursor) VALUES ('u1', 42)",
                    [],
                )
                .unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        let cursor: i64 = store
            .connection()
            .query_row(
                "SELECT cursor FROM sync_cursors WHERE user_id = 'u1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(cursor, 42);
    }

    #[test]
    fn test_open_releases_interrupted_claims() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("tally.db");

        {
            let store = LocalStore::open(&path).unwrap();
            store
                .connection()
                .execute(
                    "INSERT INTO sync_queue
                     (client_id, user_id, entity_type, entity_id, view_key,
                      operation, payload, enqueued_at, sequence, state)
                     VALUES ('c1', 'u1', 'activity', 'e1', 'inbox',
                             'create', '{}', 0, 1, 'syncing')",
                    [],
                )
                .unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        let state: String = store
            .connection()
            .query_row(
                "SELECT state FROM sync_queue WHERE client_id = 'c1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(state, "pending");
    }
}
