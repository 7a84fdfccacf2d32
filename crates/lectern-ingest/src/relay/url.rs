//! Relay URL normalization.
//!
//! Relay rows are keyed by URL, so cosmetic variants of the same address
//! (`wss://Relay.Example.com/` and `wss://relay.example.com`) must collapse to
//! one key before they reach the store.
//!
//! # Rules
//!
//! - Scheme must be `wss://` or `ws://`
//! - Scheme and host are lowercased, trailing slashes removed
//! - Ports and paths are preserved
//! - `.onion` hosts are rejected (no Tor transport is configured)

use nostr_sdk::RelayUrl;

use crate::{Error, Result};

/// Normalize and validate a relay URL.
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let url = url.trim();

    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return Err(Error::Validation(format!(
            "relay URL must start with wss:// or ws://: {}",
            url
        )));
    }

    let parsed = RelayUrl::parse(url)
        .map_err(|e| Error::Validation(format!("invalid relay URL {}: {}", url, e)))?;

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    let host = extract_host(&normalized);
    if host.is_empty() {
        return Err(Error::Validation(format!("relay URL has no host: {}", url)));
    }
    if host.ends_with(".onion") || host.contains(".onion:") {
        return Err(Error::Validation(format!(
            ".onion relays are not supported: {}",
            url
        )));
    }

    Ok(normalized)
}

/// Host (and port) portion of a websocket URL.
fn extract_host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    without_scheme.split('/').next().unwrap_or(without_scheme)
}
