//! Live relay capability map.
//!
//! Readers take a cheap `Arc` snapshot; admin operations build a new map and
//! swap it in, so a fan-out that already started keeps the set it began with.
//!
//! The registry also counts consecutive publish failures per relay and drops
//! the write capability of a relay that keeps rejecting events. The persisted
//! relay table is left untouched, so a restart restores the configured state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::store::RelayRow;

/// What a relay may be used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayCaps {
    pub read: bool,
    pub write: bool,
    pub search: bool,
}

/// Capability a fan-out call requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    /// Search also requires read.
    Search,
}

impl Capability {
    pub fn matches(self, caps: RelayCaps) -> bool {
        match self {
            Capability::Read => caps.read,
            Capability::Write => caps.write,
            Capability::Search => caps.search && caps.read,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Search => "search",
        }
    }
}

/// Snapshot-swapped map of relay URL to capabilities.
#[derive(Debug)]
pub struct RelayRegistry {
    relays: RwLock<Arc<HashMap<String, RelayCaps>>>,
    publish_failures: Mutex<HashMap<String, u32>>,
    /// Consecutive publish failures before write is disabled. 0 never disables.
    disable_write_after: u32,
}

impl RelayRegistry {
    pub fn new(disable_write_after: u32) -> Self {
        Self {
            relays: RwLock::new(Arc::new(HashMap::new())),
            publish_failures: Mutex::new(HashMap::new()),
            disable_write_after,
        }
    }

    /// Build a registry from persisted relay rows.
    pub fn from_rows(rows: &[RelayRow], disable_write_after: u32) -> Self {
        let registry = Self::new(disable_write_after);
        registry.replace_from_rows(rows);
        registry
    }

    /// Current capability map.
    pub fn snapshot(&self) -> Arc<HashMap<String, RelayCaps>> {
        Arc::clone(&self.relays.read())
    }

    /// Replace the whole map.
    pub fn replace(&self, relays: HashMap<String, RelayCaps>) {
        *self.relays.write() = Arc::new(relays);
    }

    pub fn replace_from_rows(&self, rows: &[RelayRow]) {
        let relays = rows
            .iter()
            .map(|row| {
                (
                    row.url.clone(),
                    RelayCaps {
                        read: row.read,
                        write: row.write,
                        search: row.search,
                    },
                )
            })
            .collect();
        self.replace(relays);
        self.publish_failures.lock().clear();
    }

    /// URLs matching a capability, sorted for stable iteration.
    pub fn matching(&self, capability: Capability) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut urls: Vec<String> = snapshot
            .iter()
            .filter(|(_, caps)| capability.matches(**caps))
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        urls
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn record_publish_success(&self, url: &str) {
        self.publish_failures.lock().remove(url);
    }

    /// Count a failed publish. Returns true if this failure disabled writes.
    pub fn record_publish_failure(&self, url: &str) -> bool {
        if self.disable_write_after == 0 {
            return false;
        }

        let reached = {
            let mut failures = self.publish_failures.lock();
            let count = failures.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count >= self.disable_write_after
        };

        if reached {
            self.disable_write(url);
            self.publish_failures.lock().remove(url);
        }
        reached
    }

    fn disable_write(&self, url: &str) {
        let mut guard = self.relays.write();
        if let Some(caps) = guard.get(url)
            && caps.write
        {
            let mut next = (**guard).clone();
            if let Some(caps) = next.get_mut(url) {
                caps.write = false;
            }
            *guard = Arc::new(next);
        }
    }
}
