//! Local curation state: follows, blocks, bookmarks and the relay table.

use rusqlite::params;
use serde::Serialize;

use super::notes::note_row_id_with;
use super::{PROFILE_SELECT, Profile, Store, profile_from_row, unix_now};
use crate::{Error, Result};

/// Persisted relay row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRow {
    pub url: String,
    pub read: bool,
    pub write: bool,
    pub search: bool,
}

impl Store {
    pub fn follow(&self, pubkey: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO follows (pubkey, created_at) VALUES (?1, ?2)",
            params![pubkey, unix_now()],
        )
        .map_err(|e| Error::Database(format!("Failed to follow: {}", e)))?;
        Ok(())
    }

    pub fn unfollow(&self, pubkey: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM follows WHERE pubkey = ?", [pubkey])
            .map_err(|e| Error::Database(format!("Failed to unfollow: {}", e)))?;
        Ok(())
    }

    /// Profiles of followed authors. Follows without a stored profile are omitted.
    pub fn followed_profiles(&self) -> Result<Vec<Profile>> {
        let conn = self.conn.lock();
        let sql = format!("{} WHERE f.pubkey IS NOT NULL ORDER BY p.id", PROFILE_SELECT);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Database(format!("Failed to prepare follows query: {}", e)))?;

        let profiles = stmt
            .query_map([], profile_from_row)
            .map_err(|e| Error::Database(format!("Failed to query follows: {}", e)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(profiles)
    }

    /// Hide an author from every feed. Blocking twice is a no-op.
    pub fn block(&self, pubkey: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO blocks (pubkey, created_at) VALUES (?1, ?2)",
            params![pubkey, unix_now()],
        )
        .map_err(|e| Error::Database(format!("Failed to block: {}", e)))?;
        Ok(())
    }

    pub fn unblock(&self, pubkey: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM blocks WHERE pubkey = ?", [pubkey])
            .map_err(|e| Error::Database(format!("Failed to unblock: {}", e)))?;
        Ok(())
    }

    pub fn is_blocked(&self, pubkey: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM blocks WHERE pubkey = ?")
            .map_err(|e| Error::Database(format!("Failed to prepare block check: {}", e)))?;
        stmt.exists([pubkey])
            .map_err(|e| Error::Database(format!("Failed to check block: {}", e)))
    }

    /// Bookmark an event. The note link is filled in when the note is stored.
    pub fn add_bookmark(&self, event_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let note_id = note_row_id_with(&conn, event_id)?;
        conn.execute(
            "INSERT OR IGNORE INTO bookmarks (event_id, note_id, created_at) VALUES (?1, ?2, ?3)",
            params![event_id, note_id, unix_now()],
        )
        .map_err(|e| Error::Database(format!("Failed to add bookmark: {}", e)))?;
        Ok(())
    }

    pub fn remove_bookmark(&self, event_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM bookmarks WHERE event_id = ?", [event_id])
            .map_err(|e| Error::Database(format!("Failed to remove bookmark: {}", e)))?;
        Ok(())
    }

    /// Insert a relay or replace its capabilities.
    pub fn upsert_relay(&self, relay: &RelayRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO relays (url, read, write, search, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(url) DO UPDATE SET
                read = excluded.read,
                write = excluded.write,
                search = excluded.search",
            params![relay.url, relay.read, relay.write, relay.search, unix_now()],
        )
        .map_err(|e| Error::Database(format!("Failed to upsert relay: {}", e)))?;
        Ok(())
    }

    /// Remove a relay. Returns false if it was not configured.
    pub fn remove_relay(&self, url: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM relays WHERE url = ?", [url])
            .map_err(|e| Error::Database(format!("Failed to remove relay: {}", e)))?;
        Ok(removed > 0)
    }

    pub fn list_relays(&self) -> Result<Vec<RelayRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT url, read, write, search FROM relays ORDER BY url")
            .map_err(|e| Error::Database(format!("Failed to prepare relay query: {}", e)))?;

        let relays = stmt
            .query_map([], |row| {
                Ok(RelayRow {
                    url: row.get(0)?,
                    read: row.get(1)?,
                    write: row.get(2)?,
                    search: row.get(3)?,
                })
            })
            .map_err(|e| Error::Database(format!("Failed to query relays: {}", e)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(relays)
    }
}

#[cfg(test)]
mod tests {
    use super::super::NewNote;
    use super::super::test_support::*;
    use super::*;

    const ALICE: &str = "a1863ef588572c83daeb8946c47ed6a715ce0cdd79248fa3cd3f4183907d85f0";
    const BOB: &str = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";

    fn relay(url: &str, read: bool, write: bool, search: bool) -> RelayRow {
        RelayRow {
            url: url.to_string(),
            read,
            write,
            search,
        }
    }

    #[test]
    fn test_follow_and_unfollow() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_profile(&profile_event(ALICE, r#"{"name":"alice"}"#), &[])
            .unwrap();
        store
            .upsert_profile(&profile_event(BOB, r#"{"name":"bob"}"#), &[])
            .unwrap();

        store.follow(ALICE).unwrap();
        store.follow(ALICE).unwrap();
        let followed = store.followed_profiles().unwrap();
        assert_eq!(followed.len(), 1);
        assert_eq!(followed[0].pubkey, ALICE);
        assert!(followed[0].followed);

        store.unfollow(ALICE).unwrap();
        assert!(store.followed_profiles().unwrap().is_empty());
    }

    #[test]
    fn test_block_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.block(BOB).unwrap();
        store.block(BOB).unwrap();
        assert!(store.is_blocked(BOB).unwrap());

        store.unblock(BOB).unwrap();
        assert!(!store.is_blocked(BOB).unwrap());
    }

    #[test]
    fn test_bookmark_flag_on_note() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_note(&NewNote::from_event(&note_event(1, ALICE, vec![])))
            .unwrap();

        store.add_bookmark(&id(1)).unwrap();
        assert!(store.find_event(&id(1)).unwrap().bookmarked);

        store.remove_bookmark(&id(1)).unwrap();
        assert!(!store.find_event(&id(1)).unwrap().bookmarked);
    }

    #[test]
    fn test_relay_crud() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_relay(&relay("wss://b.example", true, false, false))
            .unwrap();
        store
            .upsert_relay(&relay("wss://a.example", true, true, false))
            .unwrap();
        store
            .upsert_relay(&relay("wss://b.example", true, true, true))
            .unwrap();

        let relays = store.list_relays().unwrap();
        assert_eq!(
            relays,
            vec![
                relay("wss://a.example", true, true, false),
                relay("wss://b.example", true, true, true),
            ]
        );

        assert!(store.remove_relay("wss://a.example").unwrap());
        assert!(!store.remove_relay("wss://a.example").unwrap());
        assert_eq!(store.list_relays().unwrap().len(), 1);
    }
}
