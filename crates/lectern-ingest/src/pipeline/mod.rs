//! Ingestion pipeline for relay events.
//!
//! - [`sanitize_content`] and [`ContentFilter`] - markup stripping and spam heuristics
//! - [`IngestionPipeline`] - dispatch by kind and idempotent persistence
//!
//! # Architecture
//!
//! ```text
//! [RelayFanout] → SourcedEvent → [IngestionPipeline] → Store
//!                                   │  process_tags
//!                                   │  sanitize / garbage check
//!                                   ↓
//!                             IngestSession (missing refs, notifications)
//! ```

mod ingest;
mod sanitize;

pub use ingest::{IngestSession, IngestionPipeline};
pub use sanitize::{ContentFilter, MAX_NPUB_MENTIONS, sanitize_content};
