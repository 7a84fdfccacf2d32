//! Relay subscription filters.
//!
//! [`RelayFilter`] is the plain-data form of a NIP-01 filter used on the
//! fan-out side. It converts to `nostr::Filter` for the network and can be
//! evaluated locally against a [`RawEvent`].

use std::collections::BTreeMap;

use lectern_core::RawEvent;
use nostr_sdk::prelude::{EventId, Filter, Kind, PublicKey, SingleLetterTag, Timestamp};

use crate::{Error, Result};

/// A NIP-01 filter. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayFilter {
    pub kinds: Vec<u16>,
    /// Hex author pubkeys.
    pub authors: Vec<String>,
    /// Hex event ids.
    pub ids: Vec<String>,
    /// Single-letter tag queries, e.g. `'e' => [ids]`.
    pub tags: BTreeMap<char, Vec<String>>,
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

impl RelayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = authors.into_iter().collect();
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.ids = ids.into_iter().collect();
        self
    }

    pub fn tag(mut self, name: char, values: impl IntoIterator<Item = String>) -> Self {
        self.tags.insert(name, values.into_iter().collect());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Convert to a `nostr::Filter`.
    ///
    /// Fails if an author, id or tag name does not parse.
    pub fn to_nostr(&self) -> Result<Filter> {
        let mut filter = Filter::new();

        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().map(|k| Kind::from(*k)));
        }

        if !self.authors.is_empty() {
            let authors = self
                .authors
                .iter()
                .map(|a| {
                    PublicKey::from_hex(a)
                        .map_err(|e| Error::Validation(format!("invalid author {}: {}", a, e)))
                })
                .collect::<Result<Vec<_>>>()?;
            filter = filter.authors(authors);
        }

        if !self.ids.is_empty() {
            let ids = self
                .ids
                .iter()
                .map(|id| {
                    EventId::from_hex(id)
                        .map_err(|e| Error::Validation(format!("invalid event id {}: {}", id, e)))
                })
                .collect::<Result<Vec<_>>>()?;
            filter = filter.ids(ids);
        }

        for (name, values) in &self.tags {
            let tag = SingleLetterTag::from_char(*name)
                .map_err(|e| Error::Validation(format!("invalid tag name {}: {}", name, e)))?;
            filter = filter.custom_tags(tag, values.iter().cloned());
        }

        if let Some(since) = self.since {
            filter = filter.since(Timestamp::from(since.max(0) as u64));
        }

        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }

        Ok(filter)
    }

    /// Evaluate the filter against an event, ignoring `limit`.
    pub fn matches(&self, event: &RawEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        self.tags.iter().all(|(name, values)| {
            let name = name.to_string();
            event
                .tags_named(&name)
                .filter_map(|tag| tag.get(1))
                .any(|value| values.contains(value))
        })
    }
}
