//! Error types for relay sync, ingestion and feeds.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the sync and ingestion layer.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error, with context.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Nostr SDK error.
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Core event or tag error.
    #[error(transparent)]
    Core(#[from] lectern_core::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Event or input validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A looked-up profile, event or relay does not exist locally.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A relay could not be reached.
    #[error("Connection error for {url}: {reason}")]
    Connection { url: String, reason: String },

    /// No write relay accepted a published event.
    #[error("Broadcast failed: no relay accepted event {0}")]
    Broadcast(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}
