//! Relay transport abstraction.
//!
//! The fan-out engine talks to relays only through [`RelayTransport`] and
//! [`RelayHandle`]. [`NostrTransport`] implements them on top of nostr-sdk,
//! which handles websocket framing and signature verification.

use std::time::Duration;

use async_trait::async_trait;
use lectern_core::RawEvent;
use nostr_sdk::prelude::*;

use super::filter::RelayFilter;
use crate::{Error, Result};

/// Opens connections to relays.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Connect to a relay.
    async fn connect(&self, url: &str) -> Result<Box<dyn RelayHandle>>;
}

/// An open relay connection.
#[async_trait]
pub trait RelayHandle: Send + Sync {
    /// Fetch stored events matching the filter, up to end-of-stored-events.
    async fn query(&self, filter: &RelayFilter) -> Result<Vec<RawEvent>>;

    /// Publish a signed event. Fails if the relay rejects it.
    async fn publish(&self, event: &RawEvent) -> Result<()>;

    /// Close the connection.
    async fn close(&self);
}

/// nostr-sdk backed transport. Each connection gets its own client.
#[derive(Debug, Clone)]
pub struct NostrTransport {
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl NostrTransport {
    pub fn new(connect_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            query_timeout,
        }
    }
}

impl Default for NostrTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(5))
    }
}

#[async_trait]
impl RelayTransport for NostrTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelayHandle>> {
        let client = Client::default();

        client.add_relay(url).await.map_err(|e| Error::Connection {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        client
            .try_connect_relay(url, self.connect_timeout)
            .await
            .map_err(|e| Error::Connection {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Connected to relay {}", url);

        Ok(Box::new(NostrRelayHandle {
            client,
            url: url.to_string(),
            query_timeout: self.query_timeout,
        }))
    }
}

struct NostrRelayHandle {
    client: Client,
    url: String,
    query_timeout: Duration,
}

#[async_trait]
impl RelayHandle for NostrRelayHandle {
    async fn query(&self, filter: &RelayFilter) -> Result<Vec<RawEvent>> {
        let filter = filter.to_nostr()?;
        let events = self
            .client
            .fetch_events_from([self.url.as_str()], filter, self.query_timeout)
            .await?;

        Ok(events
            .into_iter()
            .map(|event| RawEvent::from_nostr(&event))
            .collect())
    }

    async fn publish(&self, event: &RawEvent) -> Result<()> {
        let event = event.to_nostr()?;
        let output = self
            .client
            .send_event_to([self.url.as_str()], &event)
            .await?;

        if output.success.is_empty() {
            let reason = output
                .failed
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| "no acknowledgement".to_string());
            return Err(Error::Connection {
                url: self.url.clone(),
                reason,
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.client.remove_relay(self.url.as_str()).await {
            tracing::debug!("Failed to close relay {}: {}", self.url, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory transport.

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Scripted behavior of one relay.
    #[derive(Debug, Clone, Default)]
    pub struct MockRelay {
        pub events: Vec<RawEvent>,
        /// Delay before a query or publish answers.
        pub delay: Duration,
        pub fail_connect: bool,
        pub fail_publish: bool,
    }

    impl MockRelay {
        pub fn with_events(events: Vec<RawEvent>) -> Self {
            Self {
                events,
                ..Default::default()
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct MockTransport {
        relays: Mutex<HashMap<String, MockRelay>>,
        /// `(relay, event id)` for every accepted publish.
        pub published: Arc<Mutex<Vec<(String, String)>>>,
        pub connects: AtomicUsize,
        pub queries: Arc<Mutex<Vec<(String, RelayFilter)>>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, url: &str, relay: MockRelay) {
            self.relays.lock().insert(url.to_string(), relay);
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RelayTransport for MockTransport {
        async fn connect(&self, url: &str) -> Result<Box<dyn RelayHandle>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let relay = self.relays.lock().get(url).cloned().unwrap_or_default();
            if relay.fail_connect {
                return Err(Error::Connection {
                    url: url.to_string(),
                    reason: "refused".to_string(),
                });
            }
            Ok(Box::new(MockHandle {
                url: url.to_string(),
                relay,
                published: Arc::clone(&self.published),
                queries: Arc::clone(&self.queries),
            }))
        }
    }

    struct MockHandle {
        url: String,
        relay: MockRelay,
        published: Arc<Mutex<Vec<(String, String)>>>,
        queries: Arc<Mutex<Vec<(String, RelayFilter)>>>,
    }

    #[async_trait]
    impl RelayHandle for MockHandle {
        async fn query(&self, filter: &RelayFilter) -> Result<Vec<RawEvent>> {
            self.queries.lock().push((self.url.clone(), filter.clone()));
            if !self.relay.delay.is_zero() {
                tokio::time::sleep(self.relay.delay).await;
            }
            let limit = filter.limit.unwrap_or(usize::MAX);
            Ok(self
                .relay
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn publish(&self, event: &RawEvent) -> Result<()> {
            if !self.relay.delay.is_zero() {
                tokio::time::sleep(self.relay.delay).await;
            }
            if self.relay.fail_publish {
                return Err(Error::Connection {
                    url: self.url.clone(),
                    reason: "blocked: rejected".to_string(),
                });
            }
            self.published
                .lock()
                .push((self.url.clone(), event.id.clone()));
            Ok(())
        }

        async fn close(&self) {}
    }
}
