//! Relay access: capability registry, transport and concurrent fan-out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        RelayFanout                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  RelayRegistry   url -> {read, write, search} snapshot       │
//! │  RelayAdmin      relay table writes, then snapshot rebuild   │
//! │  RelayTransport  connect / query / publish / close           │
//! │  JoinSet         one task per matching relay                 │
//! │  Accumulator     id -> SourcedEvent (dedup across relays)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lectern_ingest::relay::{
//!     FanoutConfig, NostrTransport, RelayFanout, RelayRegistry, event_data_filter,
//! };
//!
//! let registry = Arc::new(RelayRegistry::from_rows(&store.list_relays()?, 3));
//! let fanout = RelayFanout::new(Arc::new(NostrTransport::default()), registry, FanoutConfig::default());
//!
//! if let Some(filter) = event_data_filter(store.last_timestamp()?, false, now) {
//!     let events = fanout.get_events(&filter).await;
//! }
//! ```

mod admin;
mod fanout;
mod filter;
mod registry;
mod transport;
pub mod url;

pub use admin::RelayAdmin;
pub use fanout::{
    FanoutConfig, RelayFanout, SYNC_FETCH_LIMIT, SYNC_KINDS, SourcedEvent, event_data_filter,
};
pub use filter::RelayFilter;
pub use registry::{Capability, RelayCaps, RelayRegistry};
pub use transport::{NostrTransport, RelayHandle, RelayTransport};
pub use url::normalize_relay_url;

#[cfg(test)]
pub(crate) use transport::mock;
