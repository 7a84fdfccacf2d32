//! Keyset cursor pagination over thread roots.
//!
//! A page request carries three cursors. Which one drives the query depends
//! on the state, with later rules taking precedence:
//!
//! | State   | Set when              | Query                         |
//! |---------|-----------------------|-------------------------------|
//! | Init    | `cursor == 0`         | `id > cursor` ascending       |
//! | Refresh | `cursor > 0`          | `id > cursor` ascending       |
//! | Next    | `next_cursor != 0`    | `id > next_cursor` ascending  |
//! | Prev    | `previous_cursor != 0`| `id < previous_cursor` descending |
//!
//! After the query the cursors are recomputed from the page ids and the page
//! is reordered newest first for display. Row ids only grow, so adjacent pages
//! never overlap or leave gaps.

use std::str::FromStr;
use std::sync::Arc;

use metrics::counter;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::resolve::ReferenceResolver;
use crate::store::{NoteView, Store, note_view_from_row, note_view_sql};
use crate::thread::ThreadAssembler;
use crate::{Error, Result};

/// Rows returned by the inbox.
pub const INBOX_LIMIT: usize = 100;

/// Filter shared by every feed: visible thread roots.
const VISIBLE_ROOTS: &str =
    "n.kind = 1 AND n.root = 1 AND n.garbage = 0 AND b.pubkey IS NULL";

/// Cursor state of a page request.
///
/// A request sets at most one of `next_cursor` and `previous_cursor`. After
/// a page is served both are set to describe that page, so the following
/// request is built with [`Pagination::next`] or [`Pagination::prev`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    pub cursor: i64,
    pub next_cursor: i64,
    pub previous_cursor: i64,
    /// Zero means the configured default.
    pub per_page: usize,
}

impl Pagination {
    pub fn new(per_page: usize) -> Self {
        Self {
            per_page,
            ..Self::default()
        }
    }

    /// Request for the page after this one, or `None` at the newest end.
    pub fn next(&self) -> Option<Self> {
        (self.next_cursor != 0).then_some(Self {
            cursor: self.cursor,
            next_cursor: self.next_cursor,
            previous_cursor: 0,
            per_page: self.per_page,
        })
    }

    /// Request for the page before this one, or `None` at the oldest end.
    pub fn prev(&self) -> Option<Self> {
        (self.previous_cursor != 0).then_some(Self {
            cursor: self.cursor,
            next_cursor: 0,
            previous_cursor: self.previous_cursor,
            per_page: self.per_page,
        })
    }
}

/// Which cursor drives the next query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Init,
    Refresh,
    Next,
    Prev,
}

impl FeedState {
    pub fn from_pagination(pagination: &Pagination) -> Self {
        if pagination.previous_cursor != 0 {
            FeedState::Prev
        } else if pagination.next_cursor != 0 {
            FeedState::Next
        } else if pagination.cursor > 0 {
            FeedState::Refresh
        } else {
            FeedState::Init
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeedState::Init => "init",
            FeedState::Refresh => "refresh",
            FeedState::Next => "next",
            FeedState::Prev => "prev",
        }
    }

    /// Cursor comparison, ordering and bound value.
    fn query(self, pagination: &Pagination) -> (&'static str, i64) {
        match self {
            FeedState::Init | FeedState::Refresh => {
                ("n.id > ?1 ORDER BY n.id ASC", pagination.cursor)
            }
            FeedState::Next => ("n.id > ?1 ORDER BY n.id ASC", pagination.next_cursor),
            FeedState::Prev => ("n.id < ?1 ORDER BY n.id DESC", pagination.previous_cursor),
        }
    }
}

/// Which roots a feed shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedScope {
    /// Every visible root.
    #[default]
    Global,
    /// Roots by followed authors.
    Follow,
    /// Bookmarked roots.
    Bookmark,
}

impl FeedScope {
    fn clause(self) -> &'static str {
        match self {
            FeedScope::Global => "",
            FeedScope::Follow => " AND f.pubkey IS NOT NULL",
            FeedScope::Bookmark => " AND bm.event_id IS NOT NULL",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeedScope::Global => "global",
            FeedScope::Follow => "follow",
            FeedScope::Bookmark => "bookmark",
        }
    }
}

impl FromStr for FeedScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(FeedScope::Global),
            "follow" => Ok(FeedScope::Follow),
            "bookmark" => Ok(FeedScope::Bookmark),
            other => Err(Error::Validation(format!("Unknown feed scope: {}", other))),
        }
    }
}

/// Configuration for the feed paginator.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Page size when the request does not set one (default: 10).
    pub per_page: usize,

    /// On an Init request, start this many roots back from the newest one
    /// instead of from the oldest (default: None, start from the oldest).
    /// Bookmark feeds always start from the oldest.
    pub init_window: Option<u32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            per_page: 10,
            init_window: None,
        }
    }
}

/// Recompute the cursors from the ids of a non-empty page.
///
/// `ids` may be in any order.
pub fn recompute_cursors(
    state: FeedState,
    ids: &[i64],
    per_page: usize,
    pagination: &mut Pagination,
) {
    let (Some(&max), Some(&min)) = (ids.iter().max(), ids.iter().min()) else {
        return;
    };
    let full = ids.len() >= per_page;

    match state {
        FeedState::Init | FeedState::Refresh | FeedState::Next => {
            pagination.next_cursor = if full { max } else { 0 };
            pagination.previous_cursor = min;
        }
        FeedState::Prev => {
            pagination.previous_cursor = if full { min } else { 0 };
            pagination.next_cursor = max;
        }
    }
}

/// Newest first, ties by row id.
fn sort_for_display(views: &mut [NoteView]) {
    views.sort_by(|a, b| {
        b.note
            .created_at
            .cmp(&a.note.created_at)
            .then(b.note.id.cmp(&a.note.id))
    });
}

/// Serves feeds of assembled, display-ready threads.
pub struct FeedPaginator {
    store: Arc<Store>,
    config: FeedConfig,
}

impl FeedPaginator {
    pub fn new(store: Arc<Store>, config: FeedConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// One page of roots in `scope`, with replies attached.
    ///
    /// Updates the cursors in `pagination` and records the roots as seen.
    pub fn get_notes(
        &self,
        scope: FeedScope,
        pagination: &mut Pagination,
    ) -> Result<Vec<NoteView>> {
        let state = FeedState::from_pagination(pagination);
        if state == FeedState::Init
            && scope != FeedScope::Bookmark
            && let Some(window) = self.config.init_window
            && let Some(start) = self.window_start(scope, window)?
        {
            pagination.cursor = start;
        }

        let filter = format!("{}{}", VISIBLE_ROOTS, scope.clause());
        tracing::debug!("Feed {} page in state {:?}", scope.as_str(), state);
        counter!("feed_pages_total", "state" => state.as_str()).increment(1);

        let roots = self.page(&filter, Vec::new(), state, pagination)?;
        let seen: Vec<(i64, String)> = roots
            .iter()
            .map(|v| (v.note.id, v.note.event_id.clone()))
            .collect();
        self.store.mark_seen(&seen)?;

        self.finish(roots)
    }

    /// One page of thread roots that contain a notification for the local
    /// identity, with replies attached.
    pub fn get_notifications(&self, pagination: &mut Pagination) -> Result<Vec<NoteView>> {
        let state = FeedState::from_pagination(pagination);
        let filter = format!(
            "{} AND n.event_id IN (
                SELECT t.root_event_id FROM notifications nt
                JOIN notes c ON c.id = nt.note_id
                JOIN trees t ON t.event_id = c.event_id)",
            VISIBLE_ROOTS
        );

        let roots = self.page(&filter, Vec::new(), state, pagination)?;
        self.finish(roots)
    }

    /// Roots of threads `pubkey` replied in, newest first.
    pub fn get_inbox(&self, pubkey: &str) -> Result<Vec<NoteView>> {
        let sql = note_view_sql(
            "",
            &format!(
                "WHERE {} AND n.event_id IN (
                    SELECT t.root_event_id FROM trees t
                    JOIN notes c ON c.event_id = t.event_id
                    WHERE c.pubkey = ?1)
                 ORDER BY n.event_created_at DESC, n.id DESC
                 LIMIT ?2",
                VISIBLE_ROOTS
            ),
        );

        let params = vec![
            Value::from(pubkey.to_string()),
            Value::from(INBOX_LIMIT as i64),
        ];
        let roots = self.query_views(&sql, params)?;
        self.finish(roots)
    }

    /// Visible roots in `scope` with a row id above `cursor`.
    pub fn new_notes_count(&self, cursor: i64, scope: FeedScope) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM notes n
             LEFT JOIN follows f ON f.pubkey = n.pubkey
             LEFT JOIN blocks b ON b.pubkey = n.pubkey
             LEFT JOIN bookmarks bm ON bm.event_id = n.event_id
             WHERE {}{} AND n.id > ?1",
            VISIBLE_ROOTS,
            scope.clause()
        );

        let conn = self.store.conn();
        conn.query_row(&sql, [cursor], |row| row.get(0))
            .map_err(|e| Error::Database(format!("Failed to count new notes: {}", e)))
    }

    /// Highest note id returned by any feed page, or 0.
    pub fn last_seen_id(&self) -> Result<i64> {
        self.store.last_seen_id()
    }

    /// Row id `window` roots back from the newest one in `scope`.
    fn window_start(&self, scope: FeedScope, window: u32) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT n.id FROM notes n
             LEFT JOIN follows f ON f.pubkey = n.pubkey
             LEFT JOIN blocks b ON b.pubkey = n.pubkey
             LEFT JOIN bookmarks bm ON bm.event_id = n.event_id
             WHERE {}{}
             ORDER BY n.id DESC
             LIMIT 1 OFFSET ?1",
            VISIBLE_ROOTS,
            scope.clause()
        );

        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Database(format!("Failed to prepare feed window: {}", e)))?;
        let mut rows = stmt
            .query_map([i64::from(window)], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Database(format!("Failed to read feed window: {}", e)))?;

        rows.next()
            .transpose()
            .map_err(|e| Error::Database(format!("Failed to read feed window: {}", e)))
    }

    /// Run a cursor query and recompute the cursors.
    ///
    /// The returned roots are in display order. An empty page leaves the
    /// cursors unchanged.
    fn page(
        &self,
        filter: &str,
        mut params: Vec<Value>,
        state: FeedState,
        pagination: &mut Pagination,
    ) -> Result<Vec<NoteView>> {
        let per_page = match pagination.per_page {
            0 => self.config.per_page,
            n => n,
        };
        pagination.per_page = per_page;

        let (bound, value) = state.query(pagination);
        let sql = note_view_sql(
            "",
            &format!("WHERE {} AND {} LIMIT {}", filter, bound, per_page),
        );
        params.insert(0, Value::from(value));

        let mut roots = self.query_views(&sql, params)?;
        if roots.is_empty() {
            return Ok(roots);
        }

        let ids: Vec<i64> = roots.iter().map(|v| v.note.id).collect();
        recompute_cursors(state, &ids, per_page, pagination);
        sort_for_display(&mut roots);
        Ok(roots)
    }

    fn query_views(&self, sql: &str, params: Vec<Value>) -> Result<Vec<NoteView>> {
        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("Failed to prepare feed query: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(params), note_view_from_row)
            .map_err(|e| Error::Database(format!("Failed to query feed: {}", e)))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("Failed to read feed row: {}", e)))
    }

    /// Attach replies and rewrite references for display.
    fn finish(&self, roots: Vec<NoteView>) -> Result<Vec<NoteView>> {
        let mut threads = ThreadAssembler::new(&self.store).assemble(roots)?;
        let resolver = ReferenceResolver::new(&self.store);
        for thread in &mut threads {
            resolver.resolve_view(thread)?;
        }
        Ok(threads)
    }
}
