//! Concurrent multi-relay fan-out with deduplication.
//!
//! Every call spawns one task per matching relay into a `JoinSet`. Each task
//! connects, runs the caller's handler and closes the connection. A relay that
//! fails to connect is logged and skipped; the rest carry on.
//!
//! Query results are merged into a shared map keyed by event id, so an event
//! delivered by several relays is kept once together with every relay that
//! delivered it. Dropping a call (for example on timeout) drops the `JoinSet`,
//! which aborts the relay tasks still running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lectern_core::{
    KIND_DELETION, KIND_LONG_FORM, KIND_METADATA, KIND_REACTION, KIND_TEXT_NOTE, RawEvent,
    SYNC_BACKOFF_SECS,
};
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinSet;

use super::filter::RelayFilter;
use super::registry::{Capability, RelayRegistry};
use super::transport::{RelayHandle, RelayTransport};
use crate::{Error, Result};

/// Page size requested from each relay during sync.
pub const SYNC_FETCH_LIMIT: usize = 1000;

/// Kinds fetched during sync.
pub const SYNC_KINDS: [u16; 5] = [
    KIND_TEXT_NOTE,
    KIND_REACTION,
    KIND_LONG_FORM,
    KIND_DELETION,
    KIND_METADATA,
];

/// Configuration for the fan-out engine.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Overall deadline for a query across all relays.
    pub query_timeout: Duration,
    /// Overall deadline for a broadcast across all relays.
    pub publish_timeout: Duration,
    /// Consecutive publish failures before a relay loses write. 0 disables.
    pub disable_write_after_failures: u32,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(15),
            disable_write_after_failures: 3,
        }
    }
}

/// An event together with every relay that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedEvent {
    pub event: RawEvent,
    /// Relay URLs, sorted.
    pub relays: Vec<String>,
}

impl SourcedEvent {
    /// Wrap a locally created event that no relay has delivered yet.
    pub fn local(event: RawEvent) -> Self {
        Self {
            event,
            relays: Vec::new(),
        }
    }
}

type Accumulator = Arc<Mutex<HashMap<String, SourcedEvent>>>;

/// Fan-out engine over the configured relays.
pub struct RelayFanout {
    transport: Arc<dyn RelayTransport>,
    registry: Arc<RelayRegistry>,
    config: FanoutConfig,
}

impl RelayFanout {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        registry: Arc<RelayRegistry>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Run `handler` against every relay matching `capability`, concurrently.
    ///
    /// Returns once every relay task has finished. Returns the number of
    /// relays that were attempted.
    pub async fn run<F, Fut>(&self, capability: Capability, handler: F) -> usize
    where
        F: Fn(String, Arc<dyn RelayHandle>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let urls = self.registry.matching(capability);
        if urls.is_empty() {
            tracing::warn!("No {} relays configured", capability.as_str());
            return 0;
        }

        let mut tasks = JoinSet::new();
        for url in urls {
            let transport = Arc::clone(&self.transport);
            let handler = handler.clone();
            tasks.spawn(async move {
                let relay: Arc<dyn RelayHandle> = match transport.connect(&url).await {
                    Ok(relay) => Arc::from(relay),
                    Err(e) => {
                        tracing::warn!("Skipping relay {}: {}", url, e);
                        counter!("relay_queries_total", "status" => "connect_failed")
                            .increment(1);
                        return;
                    }
                };
                handler(url, Arc::clone(&relay)).await;
                relay.close().await;
            });
        }

        let attempted = tasks.len();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!("Relay task panicked: {}", e);
            }
        }
        attempted
    }

    /// Query every read relay and merge the results.
    ///
    /// Each event id appears once, with every relay that returned it. Kind-1
    /// events with empty content are dropped. Results are ordered by
    /// `created_at`, then id. If the overall timeout expires, events from the
    /// relays that already answered are kept and the rest are abandoned.
    pub async fn get_events(&self, filter: &RelayFilter) -> Vec<SourcedEvent> {
        self.query(Capability::Read, filter).await
    }

    /// Query the search relays, or the read relays when none is configured.
    pub async fn search_events(&self, filter: &RelayFilter) -> Vec<SourcedEvent> {
        if self.registry.matching(Capability::Search).is_empty() {
            tracing::debug!("No search relays; searching the read relays");
            return self.get_events(filter).await;
        }
        self.query(Capability::Search, filter).await
    }

    async fn query(&self, capability: Capability, filter: &RelayFilter) -> Vec<SourcedEvent> {
        let accumulator: Accumulator = Arc::default();
        let filter = Arc::new(filter.clone());

        let handler = {
            let accumulator = Arc::clone(&accumulator);
            move |url: String, relay: Arc<dyn RelayHandle>| {
                let accumulator = Arc::clone(&accumulator);
                let filter = Arc::clone(&filter);
                async move {
                    match relay.query(&filter).await {
                        Ok(events) => {
                            counter!("relay_queries_total", "status" => "ok").increment(1);
                            counter!("relay_events_received_total")
                                .increment(events.len() as u64);
                            tracing::debug!("Relay {} returned {} events", url, events.len());
                            merge(&accumulator, &url, events);
                        }
                        Err(e) => {
                            counter!("relay_queries_total", "status" => "error").increment(1);
                            tracing::warn!("Query failed on {}: {}", url, e);
                        }
                    }
                }
            }
        };

        let run = self.run(capability, handler);
        if tokio::time::timeout(self.config.query_timeout, run)
            .await
            .is_err()
        {
            counter!("relay_queries_total", "status" => "timeout").increment(1);
            tracing::warn!(
                "Relay query timed out after {:?}; using partial results",
                self.config.query_timeout
            );
        }

        let merged = std::mem::take(&mut *accumulator.lock());
        let mut events: Vec<SourcedEvent> = merged
            .into_values()
            .map(|mut sourced| {
                sourced.relays.sort();
                sourced
            })
            .collect();
        events.sort_by(|a, b| {
            a.event
                .created_at
                .cmp(&b.event.created_at)
                .then_with(|| a.event.id.cmp(&b.event.id))
        });
        events
    }

    /// Publish an event to every write relay.
    ///
    /// Returns the number of relays that accepted it, or
    /// [`Error::Broadcast`] if none did.
    pub async fn broadcast(&self, event: &RawEvent) -> Result<usize> {
        let accepted = Arc::new(AtomicUsize::new(0));
        let event = Arc::new(event.clone());

        let handler = {
            let accepted = Arc::clone(&accepted);
            let registry = Arc::clone(&self.registry);
            let event = Arc::clone(&event);
            move |url: String, relay: Arc<dyn RelayHandle>| {
                let accepted = Arc::clone(&accepted);
                let registry = Arc::clone(&registry);
                let event = Arc::clone(&event);
                async move {
                    match relay.publish(&event).await {
                        Ok(()) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                            registry.record_publish_success(&url);
                            counter!("relay_publish_total", "status" => "ok").increment(1);
                            tracing::info!("Published {} to {}", event.id, url);
                        }
                        Err(e) => {
                            counter!("relay_publish_total", "status" => "error").increment(1);
                            tracing::warn!("Publish of {} to {} failed: {}", event.id, url, e);
                            if registry.record_publish_failure(&url) {
                                counter!("relay_write_disabled_total").increment(1);
                                tracing::warn!(
                                    "Disabled writes to {} after repeated failures",
                                    url
                                );
                            }
                        }
                    }
                }
            }
        };

        let run = self.run(Capability::Write, handler);
        if tokio::time::timeout(self.config.publish_timeout, run)
            .await
            .is_err()
        {
            tracing::warn!(
                "Broadcast of {} timed out after {:?}",
                event.id,
                self.config.publish_timeout
            );
        }

        match accepted.load(Ordering::SeqCst) {
            0 => Err(Error::Broadcast(event.id.clone())),
            n => Ok(n),
        }
    }

    /// Fetch the latest metadata events of the given authors.
    pub async fn update_profiles(&self, pubkeys: &[String]) -> Vec<SourcedEvent> {
        if pubkeys.is_empty() {
            return Vec::new();
        }
        let filter = RelayFilter::new()
            .kinds([KIND_METADATA])
            .authors(pubkeys.iter().cloned());
        self.get_events(&filter).await
    }

    /// Fetch specific events by id.
    pub async fn fetch_by_ids(&self, ids: &[String]) -> Vec<SourcedEvent> {
        if ids.is_empty() {
            return Vec::new();
        }
        let filter = RelayFilter::new().ids(ids.iter().cloned());
        self.get_events(&filter).await
    }
}

/// Merge one relay's answer into the accumulator.
fn merge(accumulator: &Accumulator, url: &str, events: Vec<RawEvent>) {
    let mut merged = accumulator.lock();
    for event in events {
        if event.kind == KIND_TEXT_NOTE && event.content.is_empty() {
            continue;
        }
        let entry = merged
            .entry(event.id.clone())
            .or_insert_with(|| SourcedEvent {
                event,
                relays: Vec::new(),
            });
        if !entry.relays.iter().any(|r| r == url) {
            entry.relays.push(url.to_string());
        }
    }
}

/// Filter for the next sync window.
///
/// A store with no notes starts one backoff interval ago. With `with_offset`
/// (manual sync), returns `None` while the last sync is still inside the
/// backoff interval.
pub fn event_data_filter(last_sync: i64, with_offset: bool, now: i64) -> Option<RelayFilter> {
    let offset = now - SYNC_BACKOFF_SECS;
    let last_sync = if last_sync < 1 { offset } else { last_sync };

    if with_offset && last_sync > offset {
        tracing::info!(
            "Last sync at {} is within {}s; skipping",
            last_sync,
            SYNC_BACKOFF_SECS
        );
        return None;
    }

    Some(
        RelayFilter::new()
            .kinds(SYNC_KINDS)
            .since(last_sync + 1)
            .limit(SYNC_FETCH_LIMIT),
    )
}
