//! Signing and publishing notes as the local identity.

use std::sync::Arc;

use lectern_core::{KIND_METADATA, RawEvent, build_reply_tags};
use nostr::{EventBuilder, Keys, Kind, Tag};

use crate::pipeline::{IngestSession, IngestionPipeline};
use crate::relay::{RelayFanout, RelayFilter, SourcedEvent};
use crate::store::ProfileMetadata;
use crate::{Error, Result};

/// Parse an `nsec` or hex secret key.
pub fn parse_keys(secret: &str) -> Result<Keys> {
    Keys::parse(secret.trim()).map_err(|e| Error::Config(format!("Invalid secret key: {}", e)))
}

/// Builds, stores and broadcasts notes signed with the local keys.
pub struct Publisher {
    keys: Keys,
    pipeline: Arc<IngestionPipeline>,
    fanout: Arc<RelayFanout>,
}

impl Publisher {
    pub fn new(keys: Keys, pipeline: Arc<IngestionPipeline>, fanout: Arc<RelayFanout>) -> Self {
        Self {
            keys,
            pipeline,
            fanout,
        }
    }

    /// Hex public key of the local identity.
    pub fn pubkey(&self) -> String {
        self.keys.public_key().to_hex()
    }

    /// Sign a top-level note.
    pub fn build_note(&self, content: &str) -> Result<RawEvent> {
        self.sign(EventBuilder::text_note(content))
    }

    /// Sign a reply to `parent`, threading it with NIP-10 markers.
    pub fn build_reply(&self, content: &str, parent: &RawEvent) -> Result<RawEvent> {
        let tags = build_reply_tags(parent)
            .into_iter()
            .map(|tag| {
                Tag::parse(tag).map_err(|e| lectern_core::Error::InvalidTag(e.to_string()))
            })
            .collect::<std::result::Result<Vec<Tag>, _>>()?;
        self.sign(EventBuilder::text_note(content).tags(tags))
    }

    /// Sign a kind-0 event carrying `meta`.
    pub fn build_profile(&self, meta: &ProfileMetadata) -> Result<RawEvent> {
        self.sign(EventBuilder::new(Kind::Metadata, meta.to_json()?))
    }

    // Replying to our own note p-tags ourselves; nostr drops that by default.
    fn sign(&self, builder: EventBuilder) -> Result<RawEvent> {
        let event = builder
            .allow_self_tagging()
            .sign_with_keys(&self.keys)
            .map_err(lectern_core::Error::from)?;
        Ok(RawEvent::from_nostr(&event))
    }

    /// Save `event` locally, then send it to every write relay.
    ///
    /// The local copy is kept even when no relay accepts it. Returns the
    /// number of relays that accepted the event.
    pub async fn publish(&self, event: &RawEvent) -> Result<usize> {
        let mut session = IngestSession::new();
        self.pipeline
            .save_events(&[SourcedEvent::local(event.clone())], &mut session)?;

        self.fanout.broadcast(event).await
    }

    /// Sign `meta` as the local profile, save it, then broadcast it.
    pub async fn publish_profile(&self, meta: &ProfileMetadata) -> Result<usize> {
        let event = self.build_profile(meta)?;
        tracing::info!("Publishing profile {}", event.id);
        self.publish(&event).await
    }

    /// Fetch the newest kind-0 of the local identity from the read relays.
    ///
    /// The event found is saved like any synced profile. Returns `None`
    /// when no relay has one.
    pub async fn fetch_own_profile(&self) -> Result<Option<RawEvent>> {
        let filter = RelayFilter::new()
            .kinds([KIND_METADATA])
            .authors([self.pubkey()])
            .limit(1);
        let events = self.fanout.get_events(&filter).await;

        let Some(newest) = events.into_iter().max_by_key(|s| s.event.created_at) else {
            tracing::debug!("No relay returned a profile for {}", self.pubkey());
            return Ok(None);
        };

        let mut session = IngestSession::new();
        self.pipeline
            .save_events(std::slice::from_ref(&newest), &mut session)?;
        Ok(Some(newest.event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ContentFilter;
    use crate::relay::mock::{MockRelay, MockTransport};
    use crate::relay::{FanoutConfig, RelayRegistry};
    use crate::store::{RelayRow, Store};
    use std::time::Duration;

    const NSEC_HEX: &str = "6b911fd37cdf5c81d4c0adb1ab7fa822ed253ab0ad9aa18d77257c88b29b718e";

    fn publisher(transport: Arc<MockTransport>, relays: &[&str]) -> Publisher {
        let keys = parse_keys(NSEC_HEX).unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let pipeline = Arc::new(IngestionPipeline::new(
            store,
            keys.public_key().to_hex(),
            ContentFilter::default(),
        ));
        let rows: Vec<RelayRow> = relays
            .iter()
            .map(|url| RelayRow {
                url: url.to_string(),
                read: true,
                write: true,
                search: false,
            })
            .collect();
        let config = FanoutConfig {
            query_timeout: Duration::from_millis(300),
            publish_timeout: Duration::from_millis(300),
            disable_write_after_failures: 3,
        };
        let registry = Arc::new(RelayRegistry::from_rows(&rows, 3));
        let fanout = Arc::new(RelayFanout::new(transport, registry, config));
        Publisher::new(keys, pipeline, fanout)
    }

    fn tag(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_keys_rejects_garbage() {
        assert!(matches!(parse_keys("not a key"), Err(Error::Config(_))));
        assert!(parse_keys(&format!(" {} ", NSEC_HEX)).is_ok());
    }

    #[test]
    fn test_build_note_is_signed() {
        let publisher = publisher(Arc::new(MockTransport::new()), &[]);
        let note = publisher.build_note("hello").unwrap();

        assert_eq!(note.kind, 1);
        assert_eq!(note.content, "hello");
        assert_eq!(note.pubkey, publisher.pubkey());
        assert!(note.tags.is_empty());
        assert!(note.to_nostr().unwrap().verify().is_ok());
    }

    #[test]
    fn test_reply_to_root_note() {
        let publisher = publisher(Arc::new(MockTransport::new()), &[]);
        let parent = publisher.build_note("root").unwrap();
        let reply = publisher.build_reply("reply", &parent).unwrap();

        assert_eq!(
            reply.tags,
            vec![
                tag(&["e", &parent.id, "", "root"]),
                tag(&["p", &parent.pubkey]),
            ]
        );
    }

    #[test]
    fn test_reply_to_reply_keeps_root() {
        let publisher = publisher(Arc::new(MockTransport::new()), &[]);
        let root = publisher.build_note("root").unwrap();
        let middle = publisher.build_reply("middle", &root).unwrap();
        let reply = publisher.build_reply("leaf", &middle).unwrap();

        assert!(reply.tags.contains(&tag(&["e", &root.id, "", "root"])));
        assert!(reply.tags.contains(&tag(&["e", &middle.id, "", "reply"])));
        assert_eq!(reply.tags_named("p").count(), 1);
    }

    #[tokio::test]
    async fn test_publish_saves_and_broadcasts() {
        let transport = Arc::new(MockTransport::new());
        transport.set("wss://r1", MockRelay::default());
        transport.set(
            "wss://r2",
            MockRelay {
                fail_publish: true,
                ..MockRelay::default()
            },
        );
        let publisher = publisher(Arc::clone(&transport), &["wss://r1", "wss://r2"]);

        let note = publisher.build_note("hello relays").unwrap();
        let accepted = publisher.publish(&note).await.unwrap();

        assert_eq!(accepted, 1);
        assert!(publisher.pipeline.store().has_note(&note.id).unwrap());
        assert_eq!(
            *transport.published.lock(),
            vec![("wss://r1".to_string(), note.id.clone())]
        );
    }

    #[test]
    fn test_build_profile_skips_unset_fields() {
        let publisher = publisher(Arc::new(MockTransport::new()), &[]);
        let meta = ProfileMetadata {
            name: Some("lectern".to_string()),
            display_name: Some("Lectern".to_string()),
            ..ProfileMetadata::default()
        };
        let event = publisher.build_profile(&meta).unwrap();

        assert_eq!(event.kind, KIND_METADATA);
        assert_eq!(event.pubkey, publisher.pubkey());
        assert_eq!(event.content, r#"{"name":"lectern","display_name":"Lectern"}"#);
        assert_eq!(ProfileMetadata::from_json(&event.content).unwrap(), meta);
    }

    #[tokio::test]
    async fn test_publish_profile() {
        let transport = Arc::new(MockTransport::new());
        transport.set("wss://r1", MockRelay::default());
        let publisher = publisher(Arc::clone(&transport), &["wss://r1"]);

        let meta = ProfileMetadata {
            name: Some("lectern".to_string()),
            about: Some("reads notes".to_string()),
            ..ProfileMetadata::default()
        };
        let accepted = publisher.publish_profile(&meta).await.unwrap();
        assert_eq!(accepted, 1);

        assert_eq!(transport.published.lock().len(), 1);

        let profile = publisher
            .pipeline
            .store()
            .find_profile(&publisher.pubkey())
            .unwrap();
        assert_eq!(profile.name, "lectern");
        assert_eq!(profile.about, "reads notes");
    }

    #[tokio::test]
    async fn test_fetch_own_profile() {
        let transport = Arc::new(MockTransport::new());
        let source = publisher(Arc::new(MockTransport::new()), &[]);
        let signed = |content: &str, created_at: u64| {
            EventBuilder::new(Kind::Metadata, content)
                .custom_created_at(nostr::Timestamp::from(created_at))
                .sign_with_keys(&source.keys)
                .map(|event| RawEvent::from_nostr(&event))
                .unwrap()
        };
        let older = signed(r#"{"name":"old"}"#, 1_700_000_000);
        let newer = signed(r#"{"name":"new"}"#, 1_700_000_010);

        transport.set("wss://r1", MockRelay::with_events(vec![older.clone()]));
        transport.set("wss://r2", MockRelay::with_events(vec![newer.clone()]));
        let publisher = publisher(Arc::clone(&transport), &["wss://r1", "wss://r2"]);

        let fetched = publisher.fetch_own_profile().await.unwrap().unwrap();
        assert_eq!(fetched.id, newer.id);

        {
            let queries = transport.queries.lock();
            assert_eq!(queries[0].1.limit, Some(1));
            assert_eq!(queries[0].1.authors, vec![publisher.pubkey()]);
        }

        let profile = publisher
            .pipeline
            .store()
            .find_profile(&publisher.pubkey())
            .unwrap();
        assert_eq!(profile.name, "new");
    }

    #[tokio::test]
    async fn test_fetch_own_profile_none() {
        let transport = Arc::new(MockTransport::new());
        transport.set("wss://r1", MockRelay::default());
        let publisher = publisher(Arc::clone(&transport), &["wss://r1"]);

        assert!(publisher.fetch_own_profile().await.unwrap().is_none());
        assert!(matches!(
            publisher.pipeline.store().find_profile(&publisher.pubkey()),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_keeps_local_copy_when_broadcast_fails() {
        let transport = Arc::new(MockTransport::new());
        transport.set(
            "wss://r1",
            MockRelay {
                fail_publish: true,
                ..MockRelay::default()
            },
        );
        let publisher = publisher(Arc::clone(&transport), &["wss://r1"]);

        let note = publisher.build_note("nobody listens").unwrap();
        let err = publisher.publish(&note).await.unwrap_err();

        assert!(matches!(err, Error::Broadcast(_)));
        assert!(publisher.pipeline.store().has_note(&note.id).unwrap());
    }
}
