//! Idempotent persistence of relay events.
//!
//! Events are handled one at a time in batch order. Every write is an
//! insert-or-ignore or an upsert, so saving the same batch twice leaves the
//! store unchanged.

use std::sync::Arc;

use lectern_core::{
    KIND_METADATA, KIND_REACTION, KIND_TEXT_NOTE, PLACEHOLDER_AVATAR_PREFIX, RawEvent,
    process_tags,
};
use metrics::counter;

use super::sanitize::{ContentFilter, sanitize_content};
use crate::relay::SourcedEvent;
use crate::store::{NewNote, Store, unix_now};
use crate::{Error, Result};

/// State carried across the batches of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSession {
    /// Root and reply ids referenced by saved notes but not stored locally.
    pub missing_refs: Vec<String>,
    /// Row ids of notes that raised a notification.
    pub notifications: Vec<i64>,
    /// Newest `created_at` among notes stored before or during this session.
    pub last_sync: i64,
}

impl IngestSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session resuming after the note created at `last_sync`.
    pub fn resume(last_sync: i64) -> Self {
        Self {
            last_sync,
            ..Self::default()
        }
    }

    fn add_missing(&mut self, event_id: &str) {
        if !self.missing_refs.iter().any(|id| id == event_id) {
            self.missing_refs.push(event_id.to_string());
        }
    }

    /// Take the pending missing references, leaving the list empty.
    pub fn take_missing_refs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.missing_refs)
    }
}

/// Sanitizes, classifies and stores events.
pub struct IngestionPipeline {
    store: Arc<Store>,
    local_pubkey: String,
    filter: ContentFilter,
}

impl IngestionPipeline {
    pub fn new(store: Arc<Store>, local_pubkey: impl Into<String>, filter: ContentFilter) -> Self {
        Self {
            store,
            local_pubkey: local_pubkey.into(),
            filter,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn local_pubkey(&self) -> &str {
        &self.local_pubkey
    }

    /// Save a batch of events.
    ///
    /// Returns the distinct authors of the text notes in the batch, in
    /// first-seen order. A profile with unparseable content is logged and
    /// skipped; storage errors abort the batch.
    pub fn save_events(
        &self,
        events: &[SourcedEvent],
        session: &mut IngestSession,
    ) -> Result<Vec<String>> {
        let now = unix_now();
        let mut authors: Vec<String> = Vec::new();

        for sourced in events {
            let event = &sourced.event;
            if event.created_at > now {
                counter!("ingest_events_dropped_total", "reason" => "future").increment(1);
                tracing::debug!("Dropping {} with future timestamp {}", event.id, event.created_at);
                continue;
            }

            match event.kind {
                KIND_METADATA => match self.save_profile(event, &sourced.relays) {
                    Ok(()) => {
                        counter!("ingest_events_total", "kind" => "profile").increment(1);
                    }
                    Err(e @ (Error::Json(_) | Error::Validation(_))) => {
                        counter!("ingest_events_dropped_total", "reason" => "bad_profile")
                            .increment(1);
                        tracing::warn!("Skipping profile {} from {}: {}", event.id, event.pubkey, e);
                    }
                    Err(e) => return Err(e),
                },
                KIND_TEXT_NOTE => {
                    self.save_note(sourced, session)?;
                    counter!("ingest_events_total", "kind" => "note").increment(1);
                    session.last_sync = session.last_sync.max(event.created_at);
                    if !authors.contains(&event.pubkey) {
                        authors.push(event.pubkey.clone());
                    }
                }
                KIND_REACTION => {
                    let target = event.first_tag_value("e");
                    let note_id = match target {
                        Some(target) => self.store.note_row_id(target)?,
                        None => None,
                    };
                    match (target, note_id) {
                        (Some(target), Some(note_id)) => {
                            self.save_reaction(event, target, note_id)?;
                            counter!("ingest_events_total", "kind" => "reaction").increment(1);
                        }
                        _ => {
                            counter!("ingest_events_dropped_total", "reason" => "orphan_reaction")
                                .increment(1);
                        }
                    }
                }
                _ => {
                    counter!("ingest_events_dropped_total", "reason" => "kind").increment(1);
                }
            }
        }

        Ok(authors)
    }

    /// Save a text note.
    ///
    /// Returns the new row id, or `None` if the note was already stored.
    pub fn save_note(
        &self,
        sourced: &SourcedEvent,
        session: &mut IngestSession,
    ) -> Result<Option<i64>> {
        let event = &sourced.event;
        let mut summary = process_tags(event, &self.local_pubkey);
        if let Some(e) = &summary.error {
            tracing::warn!("Note {} failed validation: {}", event.id, e);
        }
        summary.truncate_refs();

        let content = sanitize_content(&event.content);
        let garbage = self.filter.is_garbage(&content);

        let note = NewNote {
            event_id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            kind: event.kind,
            created_at: event.created_at,
            content,
            tags_json: event.tags_json(),
            etags: summary.etags,
            ptags: summary.ptags,
            sig: event.sig.clone(),
            garbage,
            raw: event.to_json()?,
            root: summary.is_root,
            profile_id: self.store.profile_id(&event.pubkey)?,
            urls: sourced.relays.clone(),
        };

        let Some(note_id) = self.store.insert_note(&note)? else {
            return Ok(None);
        };

        if garbage {
            counter!("ingest_garbage_total").increment(1);
            tracing::debug!("Note {} flagged as garbage", event.id);
        }

        if let Some(root) = &summary.markers.root {
            let reply = summary.markers.reply.as_deref();
            self.store.insert_tree_edge(&event.id, root, reply)?;

            if summary.notification {
                self.store.insert_notification(note_id)?;
                session.notifications.push(note_id);
                counter!("ingest_notifications_total").increment(1);
            }

            if !self.store.has_note(root)? {
                session.add_missing(root);
            }
            if let Some(reply) = reply
                && !self.store.has_note(reply)?
            {
                session.add_missing(reply);
            }
        }

        Ok(Some(note_id))
    }

    /// Save a profile. A placeholder avatar blocks the author.
    pub fn save_profile(&self, event: &RawEvent, relays: &[String]) -> Result<()> {
        let meta = self.store.upsert_profile(event, relays)?;

        if meta
            .picture
            .as_deref()
            .is_some_and(|p| p.starts_with(PLACEHOLDER_AVATAR_PREFIX))
        {
            tracing::info!("Blocking {}: placeholder avatar", event.pubkey);
            self.store.block(&event.pubkey)?;
        }
        Ok(())
    }

    /// Save a reaction to a stored note. Returns true if it was new.
    pub fn save_reaction(&self, event: &RawEvent, target_id: &str, note_id: i64) -> Result<bool> {
        self.store.insert_reaction(event, target_id, note_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{id, note_event, profile_event};

    const ALICE: &str = "a1863ef588572c83daeb8946c47ed6a715ce0cdd79248fa3cd3f4183907d85f0";
    const LOCAL: &str = "118cd39da270a800372ab7276a46b488cca3c40dd2b34f73b857fc8f72fae0f8";

    fn pipeline() -> IngestionPipeline {
        let store = Arc::new(Store::open_in_memory().unwrap());
        IngestionPipeline::new(store, LOCAL, ContentFilter::new(&["(?i)casino".to_string()]))
    }

    fn sourced(event: RawEvent) -> SourcedEvent {
        SourcedEvent {
            event,
            relays: vec!["wss://relay.example.com".to_string()],
        }
    }

    fn reaction(n: u64, target: &str, content: &str) -> RawEvent {
        RawEvent {
            id: id(500 + n),
            pubkey: ALICE.to_string(),
            created_at: 1_700_000_100,
            kind: KIND_REACTION,
            tags: vec![vec!["e".to_string(), target.to_string()]],
            content: content.to_string(),
            sig: "f".repeat(128),
        }
    }

    fn count(store: &Store, table: &str) -> i64 {
        store
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn test_save_events_is_idempotent() {
        let pipeline = pipeline();
        let root = id(1);
        let batch = vec![
            sourced(note_event(1, ALICE, vec![])),
            sourced(note_event(2, ALICE, vec![vec!["e", &root, "", "root"], vec!["p", LOCAL]])),
            sourced(reaction(1, &root, "+")),
            sourced(profile_event(ALICE, r#"{"name":"alice"}"#)),
        ];

        let mut session = IngestSession::new();
        pipeline.save_events(&batch, &mut session).unwrap();
        pipeline.save_events(&batch, &mut session).unwrap();

        let store = pipeline.store();
        assert_eq!(count(store, "notes"), 2);
        assert_eq!(count(store, "trees"), 1);
        assert_eq!(count(store, "reactions"), 1);
        assert_eq!(count(store, "notifications"), 1);
        assert_eq!(count(store, "profiles"), 1);
        assert_eq!(session.notifications.len(), 1);
    }

    #[test]
    fn test_save_events_returns_distinct_note_authors() {
        let pipeline = pipeline();
        let bob = "b".repeat(64);
        let batch = vec![
            sourced(note_event(1, &bob, vec![])),
            sourced(note_event(2, ALICE, vec![])),
            sourced(note_event(3, &bob, vec![])),
            sourced(profile_event(LOCAL, r#"{"name":"me"}"#)),
        ];

        let authors = pipeline
            .save_events(&batch, &mut IngestSession::new())
            .unwrap();
        assert_eq!(authors, vec![bob, ALICE.to_string()]);
    }

    #[test]
    fn test_future_events_are_dropped() {
        let pipeline = pipeline();
        let mut future = note_event(1, ALICE, vec![]);
        future.created_at = unix_now() + 3600;

        let authors = pipeline
            .save_events(&[sourced(future)], &mut IngestSession::new())
            .unwrap();
        assert!(authors.is_empty());
        assert!(!pipeline.store().has_note(&id(1)).unwrap());
    }

    #[test]
    fn test_bad_profile_json_is_skipped() {
        let pipeline = pipeline();
        let batch = vec![
            sourced(profile_event(ALICE, "not json")),
            sourced(note_event(1, ALICE, vec![])),
        ];

        let authors = pipeline
            .save_events(&batch, &mut IngestSession::new())
            .unwrap();
        assert_eq!(authors, vec![ALICE.to_string()]);
        assert!(pipeline.store().find_profile(ALICE).is_err());
    }

    #[test]
    fn test_reaction_to_unknown_note_is_dropped() {
        let pipeline = pipeline();
        pipeline
            .save_events(&[sourced(reaction(1, &id(77), "+"))], &mut IngestSession::new())
            .unwrap();
        assert_eq!(count(pipeline.store(), "reactions"), 0);
    }

    #[test]
    fn test_note_is_sanitized_and_projected() {
        let pipeline = pipeline();
        let mut event = note_event(1, ALICE, vec![vec!["t", "rust"]]);
        event.content = "<b>hello</b> it&#39;s me".to_string();

        pipeline
            .save_note(&sourced(event.clone()), &mut IngestSession::new())
            .unwrap();

        let view = pipeline.store().find_event(&id(1)).unwrap();
        assert_eq!(view.note.content, "hello it's me");
        assert!(view.note.root);
        assert!(!view.note.garbage);
        assert_eq!(view.note.urls, vec!["wss://relay.example.com"]);
        assert_eq!(view.note.tags, event.tags);

        // The original event is kept unmodified
        assert_eq!(pipeline.store().find_raw_event(&id(1)).unwrap(), event);
    }

    #[test]
    fn test_garbage_notes_are_flagged() {
        let pipeline = pipeline();
        let mut event = note_event(1, ALICE, vec![]);
        event.content = "Best CASINO bonus".to_string();

        pipeline
            .save_note(&sourced(event), &mut IngestSession::new())
            .unwrap();
        assert!(pipeline.store().find_event(&id(1)).unwrap().note.garbage);
    }

    #[test]
    fn test_refs_are_capped() {
        let pipeline = pipeline();
        let ids: Vec<String> = (100..112).map(id).collect();
        let tags = ids
            .iter()
            .flat_map(|i| [vec!["e", i.as_str()], vec!["p", i.as_str()]])
            .collect();

        pipeline
            .save_note(&sourced(note_event(1, ALICE, tags)), &mut IngestSession::new())
            .unwrap();

        let note = pipeline.store().find_event(&id(1)).unwrap().note;
        assert_eq!(note.etags.len(), 8);
        assert_eq!(note.ptags.len(), 8);
    }

    #[test]
    fn test_missing_refs_recorded_once() {
        let pipeline = pipeline();
        let (root, reply) = (id(1), id(2));
        let mut session = IngestSession::new();

        for n in [3, 4] {
            let event = note_event(
                n,
                ALICE,
                vec![vec!["e", &root, "", "root"], vec!["e", &reply, "", "reply"]],
            );
            pipeline.save_note(&sourced(event), &mut session).unwrap();
        }

        assert_eq!(session.missing_refs, vec![root.clone(), reply]);
        assert_eq!(session.take_missing_refs().len(), 2);
        assert!(session.missing_refs.is_empty());
    }

    #[test]
    fn test_present_refs_not_missing() {
        let pipeline = pipeline();
        let root = id(1);
        let mut session = IngestSession::new();

        pipeline
            .save_note(&sourced(note_event(1, ALICE, vec![])), &mut session)
            .unwrap();
        pipeline
            .save_note(
                &sourced(note_event(2, ALICE, vec![vec!["e", &root, "", "root"]])),
                &mut session,
            )
            .unwrap();

        assert!(session.missing_refs.is_empty());
    }

    #[test]
    fn test_duplicate_note_has_no_side_effects() {
        let pipeline = pipeline();
        let root = id(1);
        let event = note_event(2, ALICE, vec![vec!["e", &root, "", "root"], vec!["p", LOCAL]]);

        let mut session = IngestSession::new();
        assert!(pipeline.save_note(&sourced(event.clone()), &mut session).unwrap().is_some());

        let mut again = IngestSession::new();
        assert!(pipeline.save_note(&sourced(event), &mut again).unwrap().is_none());
        assert!(again.missing_refs.is_empty());
        assert!(again.notifications.is_empty());
    }

    #[test]
    fn test_self_mention_raises_no_notification() {
        let pipeline = pipeline();
        let root = id(1);
        let event = note_event(2, LOCAL, vec![vec!["e", &root, "", "root"], vec!["p", LOCAL]]);

        let mut session = IngestSession::new();
        pipeline.save_note(&sourced(event), &mut session).unwrap();
        assert!(session.notifications.is_empty());
    }

    #[test]
    fn test_placeholder_avatar_blocks_author() {
        let pipeline = pipeline();
        let event = profile_event(
            ALICE,
            r#"{"name":"bot","picture":"https://randomuser.me/api/portraits/men/1.jpg"}"#,
        );
        pipeline.save_profile(&event, &[]).unwrap();

        assert!(pipeline.store().is_blocked(ALICE).unwrap());
    }

    #[test]
    fn test_profile_links_existing_notes() {
        let pipeline = pipeline();
        pipeline
            .save_events(
                &[
                    sourced(note_event(1, ALICE, vec![])),
                    sourced(profile_event(ALICE, r#"{"name":"alice"}"#)),
                ],
                &mut IngestSession::new(),
            )
            .unwrap();

        let view = pipeline.store().find_event(&id(1)).unwrap();
        assert!(view.note.profile_id.is_some());
    }

    #[test]
    fn test_session_advances_last_sync() {
        let pipeline = pipeline();
        let mut session = IngestSession::resume(1_700_000_005);
        pipeline
            .save_events(
                &[
                    sourced(note_event(9, ALICE, vec![])),
                    sourced(note_event(4, ALICE, vec![])),
                    sourced(profile_event(ALICE, r#"{"name":"alice"}"#)),
                ],
                &mut session,
            )
            .unwrap();
        assert_eq!(session.last_sync, 1_700_000_009);

        let mut ahead = IngestSession::resume(1_800_000_000);
        pipeline
            .save_events(&[sourced(note_event(1, ALICE, vec![]))], &mut ahead)
            .unwrap();
        assert_eq!(ahead.last_sync, 1_800_000_000);
    }

    #[test]
    fn test_concurrent_overlapping_batches_store_once() {
        let pipeline = Arc::new(pipeline());
        let root = id(1);
        let batch = Arc::new(vec![
            sourced(note_event(1, ALICE, vec![])),
            sourced(note_event(
                2,
                ALICE,
                vec![vec!["e", &root, "", "root"], vec!["p", LOCAL]],
            )),
            sourced(note_event(
                3,
                ALICE,
                vec![
                    vec!["e", &root, "", "root"],
                    vec!["e", &id(2), "", "reply"],
                    vec!["p", LOCAL],
                ],
            )),
            sourced(profile_event(ALICE, r#"{"name":"alice"}"#)),
            sourced(reaction(1, &root, "+")),
        ]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let batch = Arc::clone(&batch);
                std::thread::spawn(move || {
                    let mut session = IngestSession::new();
                    pipeline.save_events(&batch, &mut session).map(|_| session)
                })
            })
            .collect();

        let sessions: Vec<IngestSession> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();

        let store = pipeline.store();
        assert_eq!(count(store, "notes"), 3);
        assert_eq!(count(store, "trees"), 2);
        assert_eq!(count(store, "notifications"), 2);
        assert_eq!(count(store, "profiles"), 1);
        assert_eq!(count(store, "reactions"), 1);

        for n in 1..=3 {
            let rows: i64 = store
                .conn()
                .query_row("SELECT COUNT(*) FROM notes WHERE event_id = ?", [id(n)], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(rows, 1);
        }

        // Exactly one writer won each reply and reported its notification.
        let reported: usize = sessions.iter().map(|s| s.notifications.len()).sum();
        assert_eq!(reported, 2);
    }
}
