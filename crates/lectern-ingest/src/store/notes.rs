//! Ingestion writes and the lookups the pipeline needs while writing.

use lectern_core::{KIND_TEXT_NOTE, RawEvent};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{Store, to_json_list, unix_now};
use crate::{Error, Result};

/// Row to insert into `notes`.
#[derive(Debug, Clone)]
pub struct NewNote {
    pub event_id: String,
    pub pubkey: String,
    pub kind: u16,
    pub created_at: i64,
    pub content: String,
    pub tags_json: String,
    pub etags: Vec<String>,
    pub ptags: Vec<String>,
    pub sig: String,
    pub garbage: bool,
    /// Original event JSON.
    pub raw: String,
    pub root: bool,
    pub profile_id: Option<i64>,
    pub urls: Vec<String>,
}

impl NewNote {
    /// Plain projection of an event with no sanitizing or tag analysis.
    pub fn from_event(event: &RawEvent) -> Self {
        Self {
            event_id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            kind: KIND_TEXT_NOTE,
            created_at: event.created_at,
            content: event.content.clone(),
            tags_json: event.tags_json(),
            etags: Vec::new(),
            ptags: Vec::new(),
            sig: event.sig.clone(),
            garbage: false,
            raw: event.to_json().unwrap_or_default(),
            root: true,
            profile_id: None,
            urls: Vec::new(),
        }
    }
}

/// Kind-0 content. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl ProfileMetadata {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Store {
    /// Insert a note unless its event id is already stored.
    ///
    /// Returns the new row id, or `None` for a duplicate.
    pub fn insert_note(&self, note: &NewNote) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO notes
                 (event_id, pubkey, kind, event_created_at, content, tags_full, etags, ptags,
                  sig, garbage, raw, root, profile_id, urls, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    note.event_id,
                    note.pubkey,
                    note.kind,
                    note.created_at,
                    note.content,
                    note.tags_json,
                    to_json_list(&note.etags),
                    to_json_list(&note.ptags),
                    note.sig,
                    note.garbage,
                    note.raw,
                    note.root,
                    note.profile_id,
                    to_json_list(&note.urls),
                    unix_now(),
                ],
            )
            .map_err(|e| Error::Database(format!("Failed to insert note: {}", e)))?;

        Ok((inserted == 1).then(|| conn.last_insert_rowid()))
    }

    /// Row id of a stored note.
    pub fn note_row_id(&self, event_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        note_row_id_with(&conn, event_id)
    }

    pub fn has_note(&self, event_id: &str) -> Result<bool> {
        Ok(self.note_row_id(event_id)?.is_some())
    }

    /// Record a thread edge. An existing edge for the event is kept.
    pub fn insert_tree_edge(&self, event_id: &str, root: &str, reply: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO trees (event_id, root_event_id, reply_event_id)
             VALUES (?1, ?2, ?3)",
            params![event_id, root, reply.unwrap_or_default()],
        )
        .map_err(|e| Error::Database(format!("Failed to insert tree edge: {}", e)))?;
        Ok(())
    }

    pub fn insert_notification(&self, note_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO notifications (note_id, created_at) VALUES (?1, ?2)",
            params![note_id, unix_now()],
        )
        .map_err(|e| Error::Database(format!("Failed to insert notification: {}", e)))?;
        Ok(())
    }

    /// Row id of the author's profile, if one is stored.
    pub fn profile_id(&self, pubkey: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id FROM profiles WHERE pubkey = ?",
            [pubkey],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("Failed to look up profile id: {}", e)))
    }

    /// Insert or replace the profile of `event.pubkey` from kind-0 content.
    ///
    /// Notes by the same author that have no profile link yet are attached
    /// to it. Returns the parsed metadata.
    pub fn upsert_profile(&self, event: &RawEvent, urls: &[String]) -> Result<ProfileMetadata> {
        let meta = ProfileMetadata::from_json(&event.content)?;
        let now = unix_now();

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("Failed to begin profile upsert: {}", e)))?;

        tx.execute(
            "INSERT INTO profiles
             (pubkey, name, display_name, about, picture, website, nip05, lud16, raw, urls,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(pubkey) DO UPDATE SET
                name = excluded.name,
                display_name = excluded.display_name,
                about = excluded.about,
                picture = excluded.picture,
                website = excluded.website,
                nip05 = excluded.nip05,
                lud16 = excluded.lud16,
                raw = excluded.raw,
                urls = excluded.urls,
                updated_at = excluded.updated_at",
            params![
                event.pubkey,
                meta.name,
                meta.display_name,
                meta.about,
                meta.picture,
                meta.website,
                meta.nip05,
                meta.lud16,
                event.content,
                to_json_list(urls),
                now,
            ],
        )
        .map_err(|e| Error::Database(format!("Failed to upsert profile: {}", e)))?;

        tx.execute(
            "UPDATE notes SET profile_id = (SELECT id FROM profiles WHERE pubkey = ?1)
             WHERE pubkey = ?1 AND profile_id IS NULL",
            [&event.pubkey],
        )
        .map_err(|e| Error::Database(format!("Failed to backfill profile ids: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::Database(format!("Failed to commit profile upsert: {}", e)))?;

        Ok(meta)
    }

    /// Record a reaction. Only the first reaction per voter and target counts.
    ///
    /// Returns true if the reaction was new.
    pub fn insert_reaction(
        &self,
        event: &RawEvent,
        target_event_id: &str,
        note_id: i64,
    ) -> Result<bool> {
        let vote = if event.content == "-" { "dislike" } else { "like" };
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO reactions
                 (pubkey, content, vote, target_event_id, from_event_id, note_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.pubkey,
                    event.content,
                    vote,
                    target_event_id,
                    event.id,
                    note_id,
                    unix_now(),
                ],
            )
            .map_err(|e| Error::Database(format!("Failed to insert reaction: {}", e)))?;
        Ok(inserted == 1)
    }

    /// Pubkeys from `pubkeys` with no profile updated after `threshold`.
    ///
    /// Keeps input order and drops duplicates.
    pub fn check_profiles(&self, pubkeys: &[String], threshold: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM profiles WHERE pubkey = ?1 AND updated_at > ?2")
            .map_err(|e| Error::Database(format!("Failed to prepare profile check: {}", e)))?;

        let mut stale: Vec<String> = Vec::new();
        for pubkey in pubkeys {
            if stale.contains(pubkey) {
                continue;
            }
            let fresh = stmt
                .exists(params![pubkey, threshold])
                .map_err(|e| Error::Database(format!("Failed to check profile: {}", e)))?;
            if !fresh {
                stale.push(pubkey.clone());
            }
        }
        Ok(stale)
    }

    /// Highest note id ever returned by a feed page, or 0.
    pub fn last_seen_id(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COALESCE(MAX(note_id), 0) FROM seen", [], |row| {
            row.get(0)
        })
        .map_err(|e| Error::Database(format!("Failed to read last seen id: {}", e)))
    }

    /// Record notes as seen. Already-seen notes are ignored.
    pub fn mark_seen(&self, notes: &[(i64, String)]) -> Result<()> {
        if notes.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("Failed to begin seen update: {}", e)))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO seen (event_id, note_id, created_at) VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| Error::Database(format!("Failed to prepare seen insert: {}", e)))?;
            let now = unix_now();
            for (note_id, event_id) in notes {
                stmt.execute(params![event_id, note_id, now])
                    .map_err(|e| Error::Database(format!("Failed to mark seen: {}", e)))?;
            }
        }
        tx.commit()
            .map_err(|e| Error::Database(format!("Failed to commit seen update: {}", e)))?;
        Ok(())
    }
}

pub(crate) fn note_row_id_with(conn: &Connection, event_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM notes WHERE event_id = ?",
        [event_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| Error::Database(format!("Failed to look up note: {}", e)))
}
