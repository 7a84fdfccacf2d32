//! SQLite schema for the local note store.
//!
//! This module defines the database schema and the versioning helpers used
//! when a store is opened.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist. Returns the version found on disk
/// so the caller can refuse databases written by a newer release.
pub fn init_schema(conn: &Connection) -> Result<i32> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        return Ok(SCHEMA_VERSION);
    }

    Ok(current_version)
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
///
/// Array-valued columns (`etags`, `ptags`, `urls`, `tags_full`) hold JSON text.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Kind 0 projections, one per author
        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pubkey TEXT NOT NULL UNIQUE,
            name TEXT,
            display_name TEXT,
            about TEXT,
            picture TEXT,
            website TEXT,
            nip05 TEXT,
            lud16 TEXT,
            raw TEXT NOT NULL,
            urls TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Kind 1 projections; id is the pagination cursor
        CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            pubkey TEXT NOT NULL,
            kind INTEGER NOT NULL,
            event_created_at INTEGER NOT NULL,
            content TEXT NOT NULL,
            tags_full TEXT NOT NULL DEFAULT '[]',
            etags TEXT NOT NULL DEFAULT '[]',
            ptags TEXT NOT NULL DEFAULT '[]',
            sig TEXT NOT NULL,
            garbage INTEGER NOT NULL DEFAULT 0,
            raw TEXT NOT NULL,
            root INTEGER NOT NULL DEFAULT 0,
            profile_id INTEGER,
            urls TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        );

        -- Thread edges, one per non-root note
        CREATE TABLE IF NOT EXISTS trees (
            event_id TEXT PRIMARY KEY,
            root_event_id TEXT NOT NULL,
            reply_event_id TEXT NOT NULL DEFAULT ''
        );

        -- One counted reaction per voter per target
        CREATE TABLE IF NOT EXISTS reactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pubkey TEXT NOT NULL,
            content TEXT NOT NULL,
            vote TEXT NOT NULL CHECK (vote IN ('like', 'dislike')),
            target_event_id TEXT NOT NULL,
            from_event_id TEXT NOT NULL,
            note_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (pubkey, target_event_id)
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            note_id INTEGER NOT NULL UNIQUE,
            seen INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        -- Notes already returned by a feed page
        CREATE TABLE IF NOT EXISTS seen (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            note_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS follows (
            pubkey TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blocks (
            pubkey TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bookmarks (
            event_id TEXT PRIMARY KEY,
            note_id INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS relays (
            url TEXT PRIMARY KEY,
            read INTEGER NOT NULL DEFAULT 1,
            write INTEGER NOT NULL DEFAULT 0,
            search INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notes_pubkey ON notes(pubkey);
        CREATE INDEX IF NOT EXISTS idx_notes_root ON notes(root, garbage);
        CREATE INDEX IF NOT EXISTS idx_notes_event_created_at ON notes(event_created_at);
        CREATE INDEX IF NOT EXISTS idx_notes_created_at ON notes(created_at);
        CREATE INDEX IF NOT EXISTS idx_trees_root ON trees(root_event_id);
        CREATE INDEX IF NOT EXISTS idx_reactions_note ON reactions(note_id);
        CREATE INDEX IF NOT EXISTS idx_seen_note ON seen(note_id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_init_schema_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(init_schema(&conn).unwrap(), SCHEMA_VERSION);

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "profiles",
            "notes",
            "trees",
            "reactions",
            "notifications",
            "seen",
            "follows",
            "blocks",
            "bookmarks",
            "relays",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(init_schema(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_init_schema_reports_newer_version() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();

        assert_eq!(init_schema(&conn).unwrap(), SCHEMA_VERSION + 1);
    }

    #[test]
    fn test_reaction_uniqueness() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let insert = "INSERT OR IGNORE INTO reactions
            (pubkey, content, vote, target_event_id, from_event_id, note_id, created_at)
            VALUES ('pk', '+', 'like', 'target', ?, 1, 0)";
        conn.execute(insert, ["from1"]).unwrap();
        conn.execute(insert, ["from2"]).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM reactions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
