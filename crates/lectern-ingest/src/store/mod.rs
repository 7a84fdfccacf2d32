//! SQLite-backed note store.
//!
//! The `Store` owns the single SQLite connection shared by the ingestion
//! pipeline, the feed paginator and the admin operations. Writes go through
//! `INSERT OR IGNORE` or upserts so replaying a batch is harmless.
//!
//! Methods are grouped by concern:
//! - `notes`: ingestion writes and point lookups
//! - `admin`: follows, blocks, bookmarks and the relay table

mod admin;
mod notes;
pub mod schema;

use std::path::Path;

use lectern_core::RawEvent;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, Row};
use serde::Serialize;

pub use admin::RelayRow;
pub use notes::{NewNote, ProfileMetadata};

use crate::resolve::References;
use crate::{Error, Result};

/// Persisted projection of a kind-1 event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    /// Row id, used as the pagination cursor.
    pub id: i64,
    pub event_id: String,
    pub pubkey: String,
    pub kind: u16,
    /// Timestamp claimed by the author.
    pub created_at: i64,
    /// Sanitized content.
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub etags: Vec<String>,
    pub ptags: Vec<String>,
    pub sig: String,
    pub garbage: bool,
    pub root: bool,
    pub profile_id: Option<i64>,
    /// Relays the note was seen on.
    pub urls: Vec<String>,
}

/// Persisted projection of a kind-0 event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Profile {
    pub id: i64,
    pub pubkey: String,
    pub name: String,
    pub display_name: String,
    pub about: String,
    pub picture: String,
    pub website: String,
    pub nip05: String,
    pub lud16: String,
    pub urls: Vec<String>,
    pub followed: bool,
    pub blocked: bool,
    pub updated_at: i64,
}

impl Profile {
    /// Best name to show for this profile: display name, name, then pubkey.
    pub fn label(&self) -> &str {
        if !self.display_name.is_empty() {
            &self.display_name
        } else if !self.name.is_empty() {
            &self.name
        } else {
            &self.pubkey
        }
    }
}

/// A note joined with its author, local flags and reaction counts.
///
/// Feed pages and threads are trees of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteView {
    pub note: Note,
    pub author: Option<Profile>,
    pub bookmarked: bool,
    pub likes: i64,
    pub dislikes: i64,
    /// Depth in the reply tree; 1 for a thread root.
    pub depth: u8,
    /// Content with inline references rewritten for display.
    pub display_content: String,
    pub references: References,
    pub children: Vec<NoteView>,
}

/// Columns read by [`note_view_from_row`].
const NOTE_VIEW_FIELDS: &str = "
    n.id, n.event_id, n.pubkey, n.kind, n.event_created_at, n.content, n.tags_full,
    n.etags, n.ptags, n.sig, n.garbage, n.root, n.profile_id, n.urls,
    p.id, p.name, p.display_name, p.about, p.picture, p.website, p.nip05, p.lud16,
    p.urls, p.updated_at,
    f.pubkey IS NOT NULL,
    b.pubkey IS NOT NULL,
    bm.event_id IS NOT NULL,
    (SELECT COUNT(*) FROM reactions r WHERE r.note_id = n.id AND r.vote = 'like'),
    (SELECT COUNT(*) FROM reactions r WHERE r.note_id = n.id AND r.vote = 'dislike')";

const NOTE_VIEW_JOINS: &str = "
    FROM notes n
    LEFT JOIN profiles p ON p.pubkey = n.pubkey
    LEFT JOIN follows f ON f.pubkey = n.pubkey
    LEFT JOIN blocks b ON b.pubkey = n.pubkey
    LEFT JOIN bookmarks bm ON bm.event_id = n.event_id";

/// Number of note view columns; `extra` columns start at this index.
pub(crate) const NOTE_VIEW_COLUMNS: usize = 29;

/// Build a note view query.
///
/// `extra` is appended to the column list (with a leading comma when set) and
/// `clause` follows the joins, so it may add further joins, filters and ordering.
pub(crate) fn note_view_sql(extra: &str, clause: &str) -> String {
    let extra = if extra.is_empty() {
        String::new()
    } else {
        format!(", {}", extra)
    };
    format!("SELECT {}{} {} {}", NOTE_VIEW_FIELDS, extra, NOTE_VIEW_JOINS, clause)
}

/// Map a row selected with [`note_view_sql`].
pub(crate) fn note_view_from_row(row: &Row<'_>) -> rusqlite::Result<NoteView> {
    let pubkey: String = row.get(2)?;
    let note = Note {
        id: row.get(0)?,
        event_id: row.get(1)?,
        pubkey: pubkey.clone(),
        kind: row.get(3)?,
        created_at: row.get(4)?,
        content: row.get(5)?,
        tags: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        etags: json_list(&row.get::<_, String>(7)?),
        ptags: json_list(&row.get::<_, String>(8)?),
        sig: row.get(9)?,
        garbage: row.get(10)?,
        root: row.get(11)?,
        profile_id: row.get(12)?,
        urls: json_list(&row.get::<_, String>(13)?),
    };

    let followed: bool = row.get(24)?;
    let blocked: bool = row.get(25)?;

    let author = match row.get::<_, Option<i64>>(14)? {
        Some(id) => Some(Profile {
            id,
            pubkey,
            name: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
            display_name: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
            about: row.get::<_, Option<String>>(17)?.unwrap_or_default(),
            picture: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
            website: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
            nip05: row.get::<_, Option<String>>(20)?.unwrap_or_default(),
            lud16: row.get::<_, Option<String>>(21)?.unwrap_or_default(),
            urls: json_list(&row.get::<_, Option<String>>(22)?.unwrap_or_default()),
            followed,
            blocked,
            updated_at: row.get::<_, Option<i64>>(23)?.unwrap_or_default(),
        }),
        None => None,
    };

    let display_content = note.content.clone();
    Ok(NoteView {
        note,
        author,
        bookmarked: row.get(26)?,
        likes: row.get(27)?,
        dislikes: row.get(28)?,
        depth: 1,
        display_content,
        references: References::default(),
        children: Vec::new(),
    })
}

/// Columns read by [`profile_from_row`].
pub(crate) const PROFILE_SELECT: &str = "
    SELECT p.id, p.pubkey, p.name, p.display_name, p.about, p.picture, p.website,
           p.nip05, p.lud16, p.urls, p.updated_at,
           f.pubkey IS NOT NULL,
           b.pubkey IS NOT NULL
    FROM profiles p
    LEFT JOIN follows f ON f.pubkey = p.pubkey
    LEFT JOIN blocks b ON b.pubkey = p.pubkey";

pub(crate) fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        display_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        about: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        picture: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        website: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        nip05: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        lud16: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        urls: json_list(&row.get::<_, String>(9)?),
        updated_at: row.get(10)?,
        followed: row.get(11)?,
        blocked: row.get(12)?,
    })
}

/// Decode a JSON string array column, treating malformed text as empty.
pub(crate) fn json_list(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

/// Encode a string list for a JSON array column.
pub(crate) fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Local note store.
pub struct Store {
    /// SQLite connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open SQLite: {}", e)))?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Database(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let version = schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        if version > schema::SCHEMA_VERSION {
            return Err(Error::Database(format!(
                "Schema version {} is newer than supported version {}",
                version,
                schema::SCHEMA_VERSION
            )));
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection. Never hold the guard across another store call.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Look up a note with its author and flags.
    pub fn find_event(&self, event_id: &str) -> Result<NoteView> {
        let conn = self.conn.lock();
        let sql = note_view_sql("", "WHERE n.event_id = ?1");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Database(format!("Failed to prepare event lookup: {}", e)))?;
        let mut rows = stmt
            .query_map([event_id], note_view_from_row)
            .map_err(|e| Error::Database(format!("Failed to find event: {}", e)))?;

        match rows.next() {
            Some(row) => row.map_err(|e| Error::Database(format!("Failed to read event: {}", e))),
            None => Err(Error::NotFound(format!("event {}", event_id))),
        }
    }

    /// Look up the original event JSON of a stored note.
    pub fn find_raw_event(&self, event_id: &str) -> Result<RawEvent> {
        let conn = self.conn.lock();
        let raw = conn.query_row(
            "SELECT raw FROM notes WHERE event_id = ?",
            [event_id],
            |row| row.get::<_, String>(0),
        );

        match raw {
            Ok(raw) => Ok(RawEvent::from_json(&raw)?),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(Error::NotFound(format!("event {}", event_id)))
            }
            Err(e) => Err(Error::Database(format!("Failed to find raw event: {}", e))),
        }
    }

    /// Look up a profile by author pubkey.
    pub fn find_profile(&self, pubkey: &str) -> Result<Profile> {
        let conn = self.conn.lock();
        find_profile_with(&conn, pubkey)
    }

    /// Newest author timestamp among stored notes, or 0 for an empty store.
    pub fn last_timestamp(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(event_created_at), 0) FROM notes",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("Failed to read last timestamp: {}", e)))
    }

    /// Delete notes stored more than `days` days ago, with their dependent rows.
    ///
    /// Returns the number of notes removed.
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = unix_now() - i64::from(days) * 86_400;
        let mut conn = self.conn.lock();

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("Failed to begin purge: {}", e)))?;

        let old = "SELECT id FROM notes WHERE created_at <= ?1";
        let old_events = "SELECT event_id FROM notes WHERE created_at <= ?1";
        let statements = [
            format!("DELETE FROM reactions WHERE note_id IN ({})", old),
            format!("DELETE FROM notifications WHERE note_id IN ({})", old),
            format!("DELETE FROM seen WHERE note_id IN ({})", old),
            format!("DELETE FROM trees WHERE event_id IN ({})", old_events),
        ];
        for sql in &statements {
            tx.execute(sql, [cutoff])
                .map_err(|e| Error::Database(format!("Failed to purge: {}", e)))?;
        }

        let removed = tx
            .execute("DELETE FROM notes WHERE created_at <= ?1", [cutoff])
            .map_err(|e| Error::Database(format!("Failed to purge notes: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::Database(format!("Failed to commit purge: {}", e)))?;

        tracing::info!("Purged {} notes older than {} days", removed, days);
        Ok(removed)
    }
}

pub(crate) fn find_profile_with(conn: &Connection, pubkey: &str) -> Result<Profile> {
    let sql = format!("{} WHERE p.pubkey = ?1", PROFILE_SELECT);
    let profile = conn.query_row(&sql, [pubkey], profile_from_row);

    match profile {
        Ok(profile) => Ok(profile),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(Error::NotFound(format!("profile {}", pubkey)))
        }
        Err(e) => Err(Error::Database(format!("Failed to find profile: {}", e))),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    const ALICE: &str = "a1863ef588572c83daeb8946c47ed6a715ce0cdd79248fa3cd3f4183907d85f0";

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("lectern.db");

        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.last_timestamp().unwrap(), 0);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lectern.db");

        {
            let store = Store::open(&path).unwrap();
            store.insert_note(&NewNote::from_event(&note_event(1, ALICE, vec![]))).unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(store.find_event(&id(1)).is_ok());
    }

    #[test]
    fn test_find_event_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.find_event(&id(9)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_find_raw_event_round_trips_original() {
        let store = Store::open_in_memory().unwrap();
        let event = note_event(3, ALICE, vec![vec!["t", "rust"]]);
        store.insert_note(&NewNote::from_event(&event)).unwrap();

        let raw = store.find_raw_event(&id(3)).unwrap();
        assert_eq!(raw, event);
        assert!(matches!(
            store.find_raw_event(&id(4)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_find_profile_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.find_profile(ALICE),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_find_event_joins_author() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_profile(&profile_event(ALICE, r#"{"name":"alice"}"#), &[])
            .unwrap();
        store.insert_note(&NewNote::from_event(&note_event(1, ALICE, vec![]))).unwrap();

        let view = store.find_event(&id(1)).unwrap();
        let author = view.author.unwrap();
        assert_eq!(author.name, "alice");
        assert_eq!(author.label(), "alice");
        assert!(!view.bookmarked);
        assert_eq!(view.depth, 1);
    }

    #[test]
    fn test_last_timestamp() {
        let store = Store::open_in_memory().unwrap();
        for n in [5, 2, 9] {
            store
                .insert_note(&NewNote::from_event(&note_event(n, ALICE, vec![])))
                .unwrap();
        }
        assert_eq!(store.last_timestamp().unwrap(), 1_700_000_009);
    }

    #[test]
    fn test_purge_older_than_removes_dependents() {
        let store = Store::open_in_memory().unwrap();
        let old = store
            .insert_note(&NewNote::from_event(&note_event(1, ALICE, vec![])))
            .unwrap()
            .unwrap();
        store
            .insert_note(&NewNote::from_event(&note_event(2, ALICE, vec![])))
            .unwrap();
        store.insert_notification(old).unwrap();

        {
            let conn = store.conn();
            conn.execute(
                "UPDATE notes SET created_at = created_at - 40 * 86400 WHERE id = ?",
                [old],
            )
            .unwrap();
        }

        assert_eq!(store.purge_older_than(30).unwrap(), 1);
        assert!(store.find_event(&id(1)).is_err());
        assert!(store.find_event(&id(2)).is_ok());

        let conn = store.conn();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lectern.db");
        drop(Store::open(&path).unwrap());

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("UPDATE schema_version SET version = 99", [])
                .unwrap();
        }

        assert!(matches!(Store::open(&path), Err(Error::Database(_))));
    }
}
