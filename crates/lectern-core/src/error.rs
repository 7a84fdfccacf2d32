//! Error types shared by the Lectern crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling events and tags.
#[derive(Error, Debug)]
pub enum Error {
    /// Event has an invalid field format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// A tag could not be interpreted.
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nostr library error (for event parsing and crypto operations).
    #[error("nostr error: {0}")]
    Nostr(#[from] nostr::event::Error),

    /// Event could not be built or signed.
    #[error("event builder error: {0}")]
    Builder(#[from] nostr::event::builder::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "pubkey",
            reason: "not 64 hex characters".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pubkey"));
        assert!(msg.contains("not 64 hex characters"));
    }

    #[test]
    fn test_invalid_tag_display() {
        let err = Error::InvalidTag("empty tag".to_string());
        assert_eq!(err.to_string(), "invalid tag: empty tag");
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn test_error_debug_format() {
        let err = Error::InvalidField {
            field: "id",
            reason: "too short".to_string(),
        };
        let debug = format!("{:?}", err);
        assert!(debug.contains("InvalidField"));
        assert!(debug.contains("too short"));
    }
}
