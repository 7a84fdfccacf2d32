//! Inline reference rewriting for display content.
//!
//! Note content may mention profiles and events as NIP-19 `nostr:` URIs
//! (`npub`, `nprofile`, `note`, `nevent`) or as NIP-08 `#[N]` indexes into the
//! tag list. Each mention is replaced with a stable token the display layer
//! can render:
//!
//! - known profile with a name: `[~[<pubkey>]~]`
//! - known event: `[~~[<event id>]~~]`
//! - unknown event: `[~~[<first 40 chars of the mention>....]~~]`
//! - unknown profile: the first 40 chars of the mention followed by `....`
//!
//! The resolved profiles and events are returned next to the content.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use lectern_core::RawEvent;
use nostr::nips::nip19::{FromBech32, Nip19};
use regex::Regex;
use serde::Serialize;

use crate::store::{NoteView, Profile, Store};
use crate::{Error, Result};

/// `nostr:` URIs for profiles and events.
static NOSTR_URI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"nostr:(?:npub1|nprofile1|note1|nevent1)[a-z0-9]+")
        .expect("nostr URI regex should compile")
});

/// NIP-08 `#[N]` tag references.
static TAG_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\[(\d+)\]").expect("tag ref regex should compile"));

/// Longest prefix of an unresolved mention kept in its placeholder.
pub const PLACEHOLDER_CHARS: usize = 40;

/// Profiles and events mentioned by a note and known locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct References {
    /// Keyed by pubkey.
    pub profiles: BTreeMap<String, Profile>,
    /// Keyed by event id.
    pub events: BTreeMap<String, RawEvent>,
}

impl References {
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty() && self.events.is_empty()
    }
}

/// What a mention points at.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Profile(String),
    Event(String),
}

/// A mention found in content.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mention {
    /// Exact text to replace.
    text: String,
    target: Target,
}

/// Find every distinct mention, in order of first appearance.
fn find_mentions(content: &str, tags: &[Vec<String>]) -> Vec<Mention> {
    let mut mentions: Vec<Mention> = Vec::new();
    let mut push = |mention: Mention| {
        if !mentions.iter().any(|m| m.text == mention.text) {
            mentions.push(mention);
        }
    };

    for m in NOSTR_URI_REGEX.find_iter(content) {
        let bech32 = m.as_str().trim_start_matches("nostr:");
        let target = match Nip19::from_bech32(bech32) {
            Ok(Nip19::Pubkey(pk)) => Target::Profile(pk.to_hex()),
            Ok(Nip19::Profile(profile)) => Target::Profile(profile.public_key.to_hex()),
            Ok(Nip19::EventId(id)) => Target::Event(id.to_hex()),
            Ok(Nip19::Event(event)) => Target::Event(event.event_id.to_hex()),
            _ => continue,
        };
        push(Mention {
            text: m.as_str().to_string(),
            target,
        });
    }

    for caps in TAG_REF_REGEX.captures_iter(content) {
        let Ok(index) = caps[1].parse::<usize>() else {
            continue;
        };
        let Some(tag) = tags.get(index) else {
            continue;
        };
        let (Some(name), Some(value)) = (tag.first(), tag.get(1)) else {
            continue;
        };
        let target = match name.as_str() {
            "p" => Target::Profile(value.clone()),
            "e" => Target::Event(value.clone()),
            _ => continue,
        };
        push(Mention {
            text: caps[0].to_string(),
            target,
        });
    }

    mentions
}

fn placeholder(text: &str) -> String {
    let prefix: String = text.chars().take(PLACEHOLDER_CHARS).collect();
    format!("{}....", prefix)
}

/// Rewrites mentions using the local store.
pub struct ReferenceResolver<'a> {
    store: &'a Store,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Rewrite the mentions in `content`.
    pub fn resolve(&self, content: &str, tags: &[Vec<String>]) -> Result<(String, References)> {
        let mut output = content.to_string();
        let mut references = References::default();

        for mention in find_mentions(content, tags) {
            let replacement = match &mention.target {
                Target::Profile(pubkey) => match self.store.find_profile(pubkey) {
                    Ok(profile) if !profile.name.is_empty() => {
                        let token = format!("[~[{}]~]", profile.pubkey);
                        references.profiles.insert(profile.pubkey.clone(), profile);
                        token
                    }
                    Ok(_) | Err(Error::NotFound(_)) => placeholder(&mention.text),
                    Err(e) => return Err(e),
                },
                Target::Event(event_id) => match self.store.find_raw_event(event_id) {
                    Ok(event) => {
                        let token = format!("[~~[{}]~~]", event.id);
                        references.events.insert(event.id.clone(), event);
                        token
                    }
                    Err(Error::NotFound(_)) => format!("[~~[{}]~~]", placeholder(&mention.text)),
                    Err(e) => return Err(e),
                },
            };
            output = output.replace(&mention.text, &replacement);
        }

        Ok((output, references))
    }

    /// Rewrite the display content of a note and all of its replies.
    pub fn resolve_view(&self, view: &mut NoteView) -> Result<()> {
        let (content, references) = self.resolve(&view.note.content, &view.note.tags)?;
        view.display_content = content;
        view.references = references;
        for child in &mut view.children {
            self.resolve_view(child)?;
        }
        Ok(())
    }
}
