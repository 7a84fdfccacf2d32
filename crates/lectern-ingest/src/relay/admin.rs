//! Relay administration.
//!
//! Changes go to the persisted relay table first; the live registry is then
//! rebuilt from the table so both always agree.

use std::sync::Arc;

use super::registry::{RelayCaps, RelayRegistry};
use super::url::normalize_relay_url;
use crate::Result;
use crate::store::{RelayRow, Store};

/// Adds, removes and lists relays.
pub struct RelayAdmin {
    store: Arc<Store>,
    registry: Arc<RelayRegistry>,
}

impl RelayAdmin {
    pub fn new(store: Arc<Store>, registry: Arc<RelayRegistry>) -> Self {
        Self { store, registry }
    }

    /// Add a relay or update its capabilities. Returns the stored row.
    pub fn add_relay(&self, url: &str, caps: RelayCaps) -> Result<RelayRow> {
        let row = RelayRow {
            url: normalize_relay_url(url)?,
            read: caps.read,
            write: caps.write,
            search: caps.search,
        };
        self.store.upsert_relay(&row)?;
        self.refresh()?;
        tracing::info!("Added relay {}", row.url);
        Ok(row)
    }

    /// Remove a relay. Returns false if it was not configured.
    pub fn remove_relay(&self, url: &str) -> Result<bool> {
        let url = normalize_relay_url(url)?;
        let removed = self.store.remove_relay(&url)?;
        if removed {
            self.refresh()?;
            tracing::info!("Removed relay {}", url);
        }
        Ok(removed)
    }

    pub fn list_relays(&self) -> Result<Vec<RelayRow>> {
        self.store.list_relays()
    }

    /// Add `urls` as read/write relays if no relay is configured yet.
    ///
    /// Invalid URLs are logged and skipped. Returns the number added.
    pub fn seed(&self, urls: &[String]) -> Result<usize> {
        if !self.store.list_relays()?.is_empty() {
            self.refresh()?;
            return Ok(0);
        }

        let caps = RelayCaps {
            read: true,
            write: true,
            search: false,
        };
        let mut added = 0;
        for url in urls {
            match self.add_relay(url, caps) {
                Ok(_) => added += 1,
                Err(e) => tracing::warn!("Skipping seed relay {}: {}", url, e),
            }
        }
        Ok(added)
    }

    /// Rebuild the live registry from the relay table.
    pub fn refresh(&self) -> Result<()> {
        let rows = self.store.list_relays()?;
        self.registry.replace_from_rows(&rows);
        Ok(())
    }
}
