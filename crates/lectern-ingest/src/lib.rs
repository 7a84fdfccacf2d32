//! Lectern: multi-relay Nostr sync, ingestion, threading and feeds.
//!
//! # Modules
//!
//! - [`relay`] - capability registry, transport and concurrent fan-out
//! - [`pipeline`] - tag processing, sanitizing and idempotent persistence
//! - [`store`] - SQLite note store
//! - [`thread`] - reply tree assembly
//! - [`feed`] - cursor pagination over feed scopes
//! - [`resolve`] - `nostr:` and `#[N]` mention resolution
//! - [`sync`] - periodic and manual sync
//! - [`publish`] - signing and broadcasting local notes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayFanout   │  one task per relay, dedup by event id
//! └────────┬────────┘
//!          │ SourcedEvent
//!          ▼
//! ┌─────────────────┐
//! │IngestionPipeline│  process_tags, sanitize, spam check
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │      Store      │  SQLite - notes, profiles, trees, notifications
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  FeedPaginator  │  cursor pages → ThreadAssembler → ReferenceResolver
//! └─────────────────┘
//! ```
//!
//! The store is the source of truth for the reader; relays are polled by the
//! [`SyncService`] and written to by the [`Publisher`].

pub mod config;
pub mod error;
pub mod feed;
pub mod pipeline;
pub mod publish;
pub mod relay;
pub mod resolve;
pub mod store;
pub mod sync;
pub mod thread;

// Re-export commonly used types at crate root
pub use config::Config;
pub use error::{Error, Result};

pub use feed::{FeedConfig, FeedPaginator, FeedScope, FeedState, Pagination};
pub use pipeline::{ContentFilter, IngestSession, IngestionPipeline};
pub use publish::{Publisher, parse_keys};
pub use relay::{
    Capability, FanoutConfig, NostrTransport, RelayAdmin, RelayCaps, RelayFanout, RelayFilter,
    RelayRegistry, RelayTransport, SourcedEvent,
};
pub use resolve::{ReferenceResolver, References};
pub use store::{Note, NoteView, Profile, ProfileMetadata, RelayRow, Store};
pub use sync::{SyncConfig, SyncService, SyncStats, TickOutcome};
pub use thread::{MAX_THREAD_DEPTH, ThreadAssembler};
