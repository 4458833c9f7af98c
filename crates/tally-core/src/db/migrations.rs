//! Local store schema migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| Ok(row.get::<_, i32>(0)? != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: mutation log, snapshot cache, tombstones, counters
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", [])?;

    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Durable mutation log, drained in per-user sequence order
        "CREATE TABLE IF NOT EXISTS sync_queue (
            client_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            view_key TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT,
            enqueued_at INTEGER NOT NULL,
            sequence INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            rejected INTEGER NOT NULL DEFAULT 0,
            UNIQUE (user_id, sequence)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_user_state ON sync_queue(user_id, state)",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(user_id, entity_type, entity_id)",
        // Per-user sequence counters for the log
        "CREATE TABLE IF NOT EXISTS sync_counters (
            user_id TEXT PRIMARY KEY,
            next_seq INTEGER NOT NULL
        )",
        // Server-confirmed entities, cached per view
        "CREATE TABLE IF NOT EXISTS server_cache (
            user_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            view_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            server_seq INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, entity_type, entity_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_server_cache_view ON server_cache(user_id, entity_type, view_key)",
        // Entities written locally but not yet confirmed by the server
        "CREATE TABLE IF NOT EXISTS offline_entities (
            user_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            view_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, entity_type, entity_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_offline_entities_view ON offline_entities(user_id, entity_type, view_key)",
        // Ids deleted locally whose deletes are not yet confirmed
        "CREATE TABLE IF NOT EXISTS tombstones (
            user_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            view_key TEXT NOT NULL,
            deleted_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, entity_type, entity_id)
        )",
        // Pull position per user; advanced only after a page is merged
        "CREATE TABLE IF NOT EXISTS sync_cursors (
            user_id TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL DEFAULT 0
        )",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, []) {
            conn.execute("ROLLBACK", []).ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", []) {
        conn.execute("ROLLBACK", []).ok();
        return Err(e.into());
    }

    tracing::info!("Migrated local store to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v1_creates_sync_tables() {
        let conn = setup();
        run(&conn).unwrap();

        for table in [
            "sync_queue",
            "sync_counters",
            "server_cache",
            "offline_entities",
            "tombstones",
            "sync_cursors",
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(
                        SELECT 1 FROM sqlite_master
                        WHERE type = 'table' AND name = ?
                    )",
                    [table],
                    |row| Ok(row.get::<_, i32>(0)? != 0),
                )
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }
}
