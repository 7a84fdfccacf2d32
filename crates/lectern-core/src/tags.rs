//! Tag processing for thread reconstruction (NIP-10).
//!
//! [`process_tags`] turns an event's tag list into the reference sets and
//! thread position the ingestion pipeline needs:
//!
//! - `e` tags with a 64-hex value become `etags`; a 4th field of `root` or
//!   `reply` marks the thread root or the immediate parent.
//! - `p` tags with a 64-hex value become `ptags`; a `p` tag naming the local
//!   identity on someone else's event raises a notification.
//! - Events from older clients carry no markers. For those the first `e` tag
//!   is the root and the last one (if there are several) is the reply target.
//!
//! Malformed tags are skipped, never fatal. A malformed author pubkey is
//! reported through [`TagSummary::error`] alongside the best-effort result.

use crate::error::Error;
use crate::event::{RawEvent, is_hex64};

/// Upper bound on stored `etags`/`ptags` per note.
pub const MAX_TAG_REFS: usize = 8;

/// Thread position markers extracted from `e` tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadMarkers {
    /// Id of the thread root.
    pub root: Option<String>,
    /// Id of the event being replied to.
    pub reply: Option<String>,
}

/// Structured result of [`process_tags`].
#[derive(Debug)]
pub struct TagSummary {
    pub etags: Vec<String>,
    pub ptags: Vec<String>,
    /// The event mentions the local identity and was not written by it.
    pub notification: bool,
    /// No root or reply reference could be resolved.
    pub is_root: bool,
    pub markers: ThreadMarkers,
    /// Validation problem with the event itself; tags are still extracted.
    pub error: Option<Error>,
}

impl TagSummary {
    /// Cap `etags` and `ptags` at [`MAX_TAG_REFS`] entries each.
    pub fn truncate_refs(&mut self) {
        self.etags.truncate(MAX_TAG_REFS);
        self.ptags.truncate(MAX_TAG_REFS);
    }
}

/// Parse an event's tags into reference sets and thread position.
pub fn process_tags(event: &RawEvent, local_pubkey: &str) -> TagSummary {
    let error = (event.pubkey.len() != 64).then(|| Error::InvalidField {
        field: "pubkey",
        reason: format!("expected 64 hex characters, got {}", event.pubkey.len()),
    });

    let mut etags = Vec::new();
    let mut ptags = Vec::new();
    let mut markers = ThreadMarkers::default();
    let mut notification = false;
    let mut has_marker = false;

    for tag in &event.tags {
        let (Some(name), Some(value)) = (tag.first(), tag.get(1)) else {
            continue;
        };

        match name.as_str() {
            "e" => {
                if !is_hex64(value) {
                    continue;
                }
                etags.push(value.clone());
                match tag.get(3).map(String::as_str) {
                    Some("root") => {
                        markers.root = Some(value.clone());
                        has_marker = true;
                    }
                    Some("reply") => {
                        markers.reply = Some(value.clone());
                        has_marker = true;
                    }
                    _ => {}
                }
            }
            "p" => {
                if !is_hex64(value) {
                    tracing::debug!("Skipping invalid p tag on {}: {:?}", event.id, tag);
                    continue;
                }
                ptags.push(value.clone());
                if value == local_pubkey && event.pubkey != local_pubkey {
                    notification = true;
                }
            }
            _ => {}
        }
    }

    // Positional convention used by clients that predate markers
    if !has_marker && !etags.is_empty() {
        markers.root = etags.first().cloned();
        if etags.len() > 1 {
            markers.reply = etags.last().cloned();
        }
    }

    let is_root = markers.root.is_none() && markers.reply.is_none();

    TagSummary {
        etags,
        ptags,
        notification,
        is_root,
        markers,
        error,
    }
}

/// Build the tag list for a reply to `parent`.
///
/// - A parent without `e` tags is itself the root.
/// - Otherwise the parent's `root` marker (or its first `e` tag) stays the
///   root, and the parent becomes the `reply` target.
/// - The parent's `p` tags are carried over and its author is added.
pub fn build_reply_tags(parent: &RawEvent) -> Vec<Vec<String>> {
    let mut tags: Vec<Vec<String>> = Vec::new();
    let parent_etags: Vec<&Vec<String>> = parent.tags_named("e").collect();
    let mut has_root = false;

    if parent_etags.is_empty() {
        push_unique(&mut tags, marker_tag(&parent.id, "root"));
        push_unique(&mut tags, vec!["p".to_string(), parent.pubkey.clone()]);
    }

    for tag in &parent.tags {
        match tag.first().map(String::as_str) {
            Some("e") if tag.get(3).map(String::as_str) == Some("root") => {
                let relay = tag.get(2).cloned().unwrap_or_default();
                push_unique(
                    &mut tags,
                    vec!["e".to_string(), tag[1].clone(), relay, "root".to_string()],
                );
                has_root = true;
            }
            Some("p") if tag.len() >= 2 => push_unique(&mut tags, tag.clone()),
            _ => {}
        }
    }

    if let Some(first) = parent_etags.first()
        && let Some(id) = first.get(1)
    {
        if !has_root {
            push_unique(&mut tags, marker_tag(id, "root"));
        }
        push_unique(&mut tags, marker_tag(&parent.id, "reply"));
    }

    push_unique(&mut tags, vec!["p".to_string(), parent.pubkey.clone()]);
    tags
}

fn marker_tag(id: &str, marker: &str) -> Vec<String> {
    vec![
        "e".to_string(),
        id.to_string(),
        String::new(),
        marker.to_string(),
    ]
}

/// Append a tag unless one with the same name and value is already present.
fn push_unique(tags: &mut Vec<Vec<String>>, tag: Vec<String>) {
    let key = &tag[..tag.len().min(2)];
    if !tags.iter().any(|t| t.len() >= key.len() && &t[..key.len()] == key) {
        tags.push(tag);
    }
}
