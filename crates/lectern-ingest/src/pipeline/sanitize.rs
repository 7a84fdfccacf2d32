//! Note content sanitizing and spam heuristics.
//!
//! Notes are plain text. Any markup a client put in the content is removed,
//! then the handful of entities clients commonly double-escape are decoded.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// `<script>` and `<style>` elements, including their text.
static SCRIPT_STYLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:script|style)\b[^>]*>.*?</(?:script|style)\s*>")
        .expect("script/style regex should compile")
});

/// HTML comments.
static COMMENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex should compile"));

/// Start and end tags, doctypes and processing instructions.
static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?[a-zA-Z][^>]*>|<[!?][^>]*>").expect("tag regex should compile")
});

/// `@npub1...` mention tokens.
static NPUB_MENTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@npub1[02-9ac-hj-np-z]*").expect("npub mention regex should compile")
});

/// Notes mentioning more distinct `@npub` tokens than this are garbage.
pub const MAX_NPUB_MENTIONS: usize = 4;

/// Strip markup and decode common entities.
///
/// Escaped `<br>` and `<br/>` become newlines and NUL characters are removed.
pub fn sanitize_content(content: &str) -> String {
    let stripped = SCRIPT_STYLE_REGEX.replace_all(content, "");
    let stripped = COMMENT_REGEX.replace_all(&stripped, "");
    let stripped = TAG_REGEX.replace_all(&stripped, "");

    stripped
        .replace("&#39;", "'")
        .replace("&#34;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace('\u{0}', "")
}

/// Operator-supplied spam patterns.
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    patterns: Vec<Regex>,
}

impl ContentFilter {
    /// Compile the patterns. Invalid ones are logged and skipped.
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter(|p| !p.trim().is_empty())
            .filter_map(|p| match Regex::new(p) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!("Ignoring invalid content filter {:?}: {}", p, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if the content matches a pattern or mentions too many npubs.
    pub fn is_garbage(&self, content: &str) -> bool {
        if self.patterns.iter().any(|p| p.is_match(content)) {
            return true;
        }

        let mentions: HashSet<&str> = NPUB_MENTION_REGEX
            .find_iter(content)
            .map(|m| m.as_str())
            .collect();
        mentions.len() > MAX_NPUB_MENTIONS
    }
}
