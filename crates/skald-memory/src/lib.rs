// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation memory: the token estimator, the page store, lane-aware
//! virtual memory, and the sensory decorator.

pub mod estimate;
pub mod page;
pub mod sensory;
pub mod store;
pub mod summarize;
pub mod vm;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use skald_model::{Message, Role};

pub use estimate::TokenEstimator;
pub use page::{GrepMatch, GrepOptions, Page, PageMeta, PageState};
pub use sensory::{ChannelSource, ChannelState, SensoryMemory, SensoryState, StatusBoard, UpdateMode};
pub use store::PageStore;
pub use summarize::{DriverSummarizer, StaticSummarizer, Summarizer, UnavailableSummarizer};
pub use vm::VirtualMemory;

/// Budget accounting snapshot, reported by every memory implementation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Estimated tokens of the resident projection (system blocks included,
    /// pages counted as their summaries).
    pub resident_tokens: usize,
    pub working_budget: usize,
    /// Estimated tokens of raw spans materialized in the page slot.
    pub page_slot_tokens: usize,
    pub page_slot_budget: usize,
    pub system_overhead_budget: usize,
    pub resident_messages: usize,
    pub page_count: usize,
    /// Non-system buffer tokens over the working budget.
    pub fraction: f32,
}

/// Per-compaction tuning, either derived from config and the thinking lever
/// or supplied explicitly by the user through a forced compaction.
#[derive(Debug, Clone)]
pub struct CompactionHints {
    pub lane_weights: HashMap<Role, f32>,
    /// Overrides the configured importance exemption threshold.
    pub importance_threshold: Option<f32>,
    /// `[0,1]`; larger values take bigger victim spans per pass.
    pub aggressiveness: f32,
    /// Run even when usage is under the trigger threshold.
    pub force: bool,
}

impl Default for CompactionHints {
    fn default() -> Self {
        Self {
            lane_weights: HashMap::new(),
            importance_threshold: None,
            aggressiveness: 0.5,
            force: false,
        }
    }
}

/// The conversation memory contract consumed by the turn loop.
///
/// `VirtualMemory` implements the full surface; `PlainMemory` keeps every
/// message resident and accepts the paging operations as no-ops.  The
/// sensory decorator wraps either and forwards everything while injecting
/// its own system block.
#[async_trait::async_trait]
pub trait AgentMemory: Send + Sync {
    fn add(&mut self, message: Message);

    /// The canonical projection sent to drivers: system block set first,
    /// then the resident buffer with loaded pages materialized.  Guaranteed
    /// free of orphan tool calls/results.
    fn messages(&self) -> Vec<Message>;

    /// Capture projection for warm state: loaded pages stay collapsed to
    /// their summary markers so `replace_messages` can rebuild the buffer.
    fn export_messages(&self) -> Vec<Message> {
        self.messages()
    }

    fn replace_messages(&mut self, messages: Vec<Message>);

    fn usage(&self) -> MemoryUsage;

    /// Run any scheduled background compaction.  Serialized; coalesces
    /// re-requests that arrive while a compaction is in flight.
    async fn maintain(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Proactively compact when usage exceeds `threshold` so about-to-arrive
    /// tool results have room.
    async fn pre_tool_compact(&mut self, threshold: Option<f32>) -> anyhow::Result<()> {
        let _ = threshold;
        Ok(())
    }

    /// User-forced compaction.  Returns the number of messages paged.
    async fn compact_with_hints(&mut self, hints: CompactionHints) -> anyhow::Result<usize> {
        let _ = hints;
        Ok(0)
    }

    fn protect_message(&mut self, message: &Message) {
        let _ = message;
    }

    fn clear_protected_messages(&mut self) {}

    /// Load a page into the page slot.  Returns `false` for dangling ids.
    fn ref_page(&mut self, id: &str) -> bool {
        let _ = id;
        false
    }

    fn unref_page(&mut self, id: &str) -> bool {
        let _ = id;
        false
    }

    fn pin_page(&mut self, id: &str) -> bool {
        let _ = id;
        false
    }

    fn unpin_page(&mut self, id: &str) -> bool {
        let _ = id;
        false
    }

    fn grep_pages(&self, pattern: &str, opts: &GrepOptions) -> Vec<GrepMatch> {
        let _ = (pattern, opts);
        Vec::new()
    }

    fn list_pages(&self) -> Vec<PageMeta> {
        Vec::new()
    }

    fn set_thinking_budget(&mut self, budget: f32) {
        let _ = budget;
    }

    /// Hot-reload the working budget (`max-context` marker).
    fn set_working_budget(&mut self, tokens: usize) {
        let _ = tokens;
    }

    fn page_state(&self) -> Option<PageState> {
        None
    }

    fn restore_page_state(&mut self, state: PageState) {
        let _ = state;
    }
}

/// Keeps every message resident; no paging, no compaction.  The hot-swap
/// target of the `memory` marker and a debugging baseline.
pub struct PlainMemory {
    estimator: TokenEstimator,
    working_budget: usize,
    messages: Vec<Message>,
}

impl PlainMemory {
    pub fn new(working_budget: usize) -> Self {
        Self {
            estimator: TokenEstimator::default(),
            working_budget,
            messages: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl AgentMemory for PlainMemory {
    fn add(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    fn usage(&self) -> MemoryUsage {
        let resident_tokens = self.estimator.estimate(&self.messages);
        let non_system: usize = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| self.estimator.message(m))
            .sum();
        MemoryUsage {
            resident_tokens,
            working_budget: self.working_budget,
            page_slot_tokens: 0,
            page_slot_budget: 0,
            system_overhead_budget: 0,
            resident_messages: self.messages.len(),
            page_count: 0,
            fraction: if self.working_budget == 0 {
                0.0
            } else {
                non_system as f32 / self.working_budget as f32
            },
        }
    }

    fn set_working_budget(&mut self, tokens: usize) {
        self.working_budget = tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
