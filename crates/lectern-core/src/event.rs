//! Raw relay events and conversions to and from the nostr crate.
//!
//! [`RawEvent`] is the plain-data form of a NIP-01 event as it travels through
//! the pipeline. It is identified by its `id`; two copies received from
//! different relays with the same `id` are the same logical event.

use nostr::JsonUtil;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind 0: user metadata.
pub const KIND_METADATA: u16 = 0;
/// Kind 1: short text note.
pub const KIND_TEXT_NOTE: u16 = 1;
/// Kind 5: event deletion request.
pub const KIND_DELETION: u16 = 5;
/// Kind 7: reaction.
pub const KIND_REACTION: u16 = 7;
/// Kind 30023: long-form article.
pub const KIND_LONG_FORM: u16 = 30023;

/// An immutable event as received from a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// 64-character hex event id.
    pub id: String,
    /// 64-character hex author public key.
    pub pubkey: String,
    /// Unix timestamp claimed by the author.
    pub created_at: i64,
    /// Event kind.
    pub kind: u16,
    /// Ordered tag list; each tag is a string array.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Event content.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature (hex).
    pub sig: String,
}

impl RawEvent {
    /// Convert a nostr crate event into a [`RawEvent`].
    pub fn from_nostr(event: &nostr::Event) -> Self {
        Self {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            created_at: event.created_at.as_u64() as i64,
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().iter().map(|s| s.to_string()).collect())
                .collect(),
            content: event.content.clone(),
            sig: event.sig.to_string(),
        }
    }

    /// Convert back into a nostr crate event.
    ///
    /// Fails if any field does not parse (bad hex, bad signature encoding).
    pub fn to_nostr(&self) -> Result<nostr::Event> {
        let json = serde_json::to_string(self)?;
        Ok(nostr::Event::from_json(json)?)
    }

    /// Parse a JSON-encoded event.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to compact JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize the tag list to JSON.
    pub fn tags_json(&self) -> String {
        serde_json::to_string(&self.tags).unwrap_or_else(|_| "[]".to_string())
    }

    /// Value of the first tag with the given name, if any.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// All tags with the given name.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
    }
}

/// Check that a string is exactly 64 hex characters (an event id or pubkey).
pub fn is_hex64(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_JSON: &str = r#"{"id":"f0aa8df8e90cdb48cdb87b0cf1ba44b9f76f8f1cddd745aa8ef3ec19bc0c2647","pubkey":"a1863ef588572c83daeb8946c47ed6a715ce0cdd79248fa3cd3f4183907d85f0","created_at":1731276373,"kind":1,"tags":[["e","0000640f9cce22fb3dfb13204e0eca583f8419e162093efc9e0d734c91e58bcc","","root"],["p","3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d"]],"content":"hello","sig":"fa835e2eeabee7855b9b7ab791526510136af4bc22f561951a4f75f661499e07e1f443e1c40607a399131d42f3c63284300714526e60fa8c0c4de19e713de65f"}"#;

    #[test]
    fn test_from_json_parses_fields() {
        let event = RawEvent::from_json(EVENT_JSON).unwrap();
        assert_eq!(event.kind, KIND_TEXT_NOTE);
        assert_eq!(event.created_at, 1731276373);
        assert_eq!(event.tags.len(), 2);
        assert_eq!(event.content, "hello");
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(RawEvent::from_json("not json").is_err());
    }

    #[test]
    fn test_missing_tags_default_to_empty() {
        let json = r#"{"id":"aa","pubkey":"bb","created_at":1,"kind":1,"sig":"cc"}"#;
        let event = RawEvent::from_json(json).unwrap();
        assert!(event.tags.is_empty());
        assert!(event.content.is_empty());
    }

    #[test]
    fn test_first_tag_value() {
        let event = RawEvent::from_json(EVENT_JSON).unwrap();
        assert_eq!(
            event.first_tag_value("p"),
            Some("3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d")
        );
        assert_eq!(event.first_tag_value("t"), None);
        assert_eq!(event.tags_named("e").count(), 1);
    }

    #[test]
    fn test_nostr_conversion_preserves_identity() {
        let keys = nostr::Keys::generate();
        let signed = nostr::EventBuilder::text_note("round trip")
            .sign_with_keys(&keys)
            .unwrap();

        let raw = RawEvent::from_nostr(&signed);
        assert_eq!(raw.id, signed.id.to_hex());
        assert_eq!(raw.pubkey, keys.public_key().to_hex());

        let back = raw.to_nostr().unwrap();
        assert_eq!(back.id, signed.id);
    }

    #[test]
    fn test_is_hex64() {
        assert!(is_hex64(
            "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d"
        ));
        assert!(!is_hex64("3bf0c63f"));
        assert!(!is_hex64(
            "zzf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d"
        ));
    }
}
