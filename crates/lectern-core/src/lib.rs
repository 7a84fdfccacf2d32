//! Core types and shared utilities for Lectern.
//!
//! This crate provides:
//! - [`RawEvent`], the plain-data event that flows through the pipeline
//! - Tag processing for NIP-10 thread reconstruction ([`tags`])
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;
pub mod tags;

/// Seconds a manual sync waits after the previous one before querying relays again.
pub const SYNC_BACKOFF_SECS: i64 = 60;

/// Placeholder-avatar service whose users are blocked automatically.
pub const PLACEHOLDER_AVATAR_PREFIX: &str = "https://randomuser.me";

pub use error::{Error, Result};
pub use event::{
    KIND_DELETION, KIND_LONG_FORM, KIND_METADATA, KIND_REACTION, KIND_TEXT_NOTE, RawEvent,
    is_hex64,
};
pub use tags::{MAX_TAG_REFS, TagSummary, ThreadMarkers, build_reply_tags, process_tags};
