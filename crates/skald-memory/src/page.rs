// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use skald_model::{Message, Role};

/// A compacted span of conversation history.
///
/// Immutable after creation except for `ref_count` and `pinned`.  While a
/// page is not loaded, only `summary` participates in context; `ref`-ing the
/// page materializes `raw_messages` back into the projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    pub id: String,
    /// Short human label, derived from the dominant lane of the span.
    pub label: String,
    pub summary: String,
    pub raw_messages: Vec<Message>,
    /// Estimated tokens of the raw span at creation time.
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
    pub ref_count: u32,
    pub pinned: bool,
    /// How many messages of each lane went into this page.
    #[serde(default)]
    pub source_lane_counts: HashMap<Role, usize>,
}

impl Page {
    /// A page is garbage-collectable only when nothing references or pins it.
    pub fn evictable(&self) -> bool {
        self.ref_count == 0 && !self.pinned
    }

    /// The synthetic message that stands in for this page in the projection
    /// while the page is not loaded.
    pub fn summary_message(&self) -> Message {
        Message::assistant(format!("[PAGE {} ({}): {}]", self.id, self.label, self.summary))
            .with_source("page")
    }
}

/// Content-addressed page id: SHA-256 over the serialized raw span plus a
/// per-store creation counter, truncated to 12 hex chars.  Stable within a
/// session; the counter keeps ids unique when identical spans are paged
/// twice.
pub fn page_id(raw_messages: &[Message], counter: u64) -> String {
    let mut hasher = Sha256::new();
    for m in raw_messages {
        // Serialization of Message is infallible: all fields are plain data.
        hasher.update(serde_json::to_vec(m).unwrap_or_default());
    }
    hasher.update(counter.to_be_bytes());
    let digest = hasher.finalize();
    format!("pg-{}", &hex::encode(digest)[..12])
}

/// Parse a page id back out of a synthetic page-summary message, if the
/// message is one.
pub fn page_id_of_marker(message: &Message) -> Option<String> {
    if message.source.as_deref() != Some("page") {
        return None;
    }
    let text = message.as_text()?;
    let rest = text.strip_prefix("[PAGE ")?;
    let id: String = rest.chars().take_while(|c| !c.is_whitespace()).collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Listing metadata for one page (content omitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMeta {
    pub id: String,
    pub label: String,
    pub token_count: usize,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub ref_count: u32,
    pub pinned: bool,
}

/// Options for [`grep`](crate::PageStore::grep).
#[derive(Debug, Clone)]
pub struct GrepOptions {
    /// Treat the pattern as a literal string instead of a regex.
    pub literal: bool,
    pub case_insensitive: bool,
    /// Maximum matches returned.  0 means unlimited.
    pub max_matches: usize,
}

impl Default for GrepOptions {
    fn default() -> Self {
        Self {
            literal: false,
            case_insensitive: false,
            max_matches: 20,
        }
    }
}

/// One grep hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepMatch {
    pub page_id: String,
    pub label: String,
    /// The first matching line, trimmed to a readable width.
    pub snippet: String,
    pub match_count: usize,
    /// Whether the page is currently loaded (referenced).
    pub loaded: bool,
}

/// Serializable capture of all page-related state, embedded in warm-state
/// snapshots.  `loaded` preserves page-slot load order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageState {
    pub pages: Vec<Page>,
    pub loaded: Vec<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
