// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Lane-aware virtual memory for conversation history.
//!
//! The buffer holds the resident tail of the conversation; older spans are
//! compacted into summary pages that can be materialized back on demand
//! through a bounded page slot.  All budget math runs on the character
//! heuristic estimator, so the projection stays deterministic and
//! provider-independent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use skald_config::MemoryConfig;
use skald_model::{Message, MessageContent, Role};

use crate::estimate::TokenEstimator;
use crate::page::{page_id_of_marker, GrepMatch, GrepOptions, PageMeta, PageState};
use crate::store::PageStore;
use crate::summarize::{serialize_span, Summarizer};
use crate::{AgentMemory, CompactionHints, MemoryUsage};

/// Usage fraction compaction aims for once it runs.
const TARGET_AFTER: f32 = 0.70;

/// Upper bound on span-growing passes within one compaction.
const MAX_PASSES: usize = 4;

/// Estimated cost of a dangling-page marker in the projection.
const GONE_MARKER_TOKENS: usize = 16;

#[derive(Debug, Clone)]
enum Slot {
    Msg(Message),
    /// Synthetic stand-in for a compacted span.  Renders as the page's
    /// summary message, or as the raw span while the page is loaded.
    Page(String),
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    slot: Slot,
}

pub struct VirtualMemory {
    cfg: MemoryConfig,
    estimator: TokenEstimator,
    store: PageStore,
    summarizer: Arc<dyn Summarizer>,
    /// Distinguished system block set, preserved in order.
    system_blocks: Vec<Message>,
    /// Non-system resident buffer in append order.
    entries: Vec<Entry>,
    /// Page ids materialized into the page slot, in load order.
    loaded: Vec<String>,
    /// Entry seqs exempt from this-turn compaction.
    protected: HashSet<u64>,
    seq: u64,
    thinking_budget: f32,
    compaction_pending: bool,
}

impl VirtualMemory {
    pub fn new(cfg: MemoryConfig, store: PageStore, summarizer: Arc<dyn Summarizer>) -> Self {
        let estimator = TokenEstimator::new(cfg.avg_chars_per_token);
        Self {
            cfg,
            estimator,
            store,
            summarizer,
            system_blocks: Vec::new(),
            entries: Vec::new(),
            loaded: Vec::new(),
            protected: HashSet::new(),
            seq: 0,
            thinking_budget: 0.5,
            compaction_pending: false,
        }
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    /// Physically reclaim fully unreferenced, unpinned pages.  Summary
    /// markers for reclaimed pages render as "page gone" from then on, so
    /// this is an explicit operation rather than part of `maintain`.
    pub fn sweep_pages(&mut self) -> usize {
        self.store.sweep()
    }

    // ── Budget accounting ─────────────────────────────────────────────────────

    fn entry_tokens(&self, entry: &Entry) -> usize {
        match &entry.slot {
            Slot::Msg(m) => self.estimator.message(m),
            Slot::Page(id) => match self.store.load(id) {
                Some(p) => self.estimator.message(&p.summary_message()),
                None => GONE_MARKER_TOKENS,
            },
        }
    }

    fn buffer_tokens(&self) -> usize {
        self.entries.iter().map(|e| self.entry_tokens(e)).sum()
    }

    fn system_tokens(&self) -> usize {
        self.estimator.estimate(&self.system_blocks)
    }

    fn slot_tokens(&self) -> usize {
        self.loaded
            .iter()
            .filter_map(|id| self.store.load(id))
            .map(|p| self.estimator.estimate(&p.raw_messages))
            .sum()
    }

    fn fraction(&self) -> f32 {
        if self.cfg.working_memory_tokens == 0 {
            return 0.0;
        }
        self.buffer_tokens() as f32 / self.cfg.working_memory_tokens as f32
    }

    // ── Keep set and scoring ──────────────────────────────────────────────────

    fn default_lane_weights() -> HashMap<Role, f32> {
        HashMap::from([(Role::User, 1.3), (Role::Assistant, 1.0), (Role::Tool, 0.7)])
    }

    fn keep_set(&self, hints: &CompactionHints) -> Vec<bool> {
        let n = self.entries.len();
        let mut keep = vec![false; n];
        let tau = hints
            .importance_threshold
            .unwrap_or(self.cfg.importance_threshold);

        for (i, entry) in self.entries.iter().enumerate() {
            match &entry.slot {
                // Pages are already compact; they are never re-paged.
                Slot::Page(_) => keep[i] = true,
                Slot::Msg(m) => {
                    if self.protected.contains(&entry.seq) {
                        keep[i] = true;
                    }
                    if m.importance.unwrap_or(0.0) >= tau {
                        keep[i] = true;
                    }
                }
            }
        }

        // Recency floor: the newest `min_recent_per_lane` of each lane.
        let mut counts: HashMap<Role, usize> = HashMap::new();
        for i in (0..n).rev() {
            if let Slot::Msg(m) = &self.entries[i].slot {
                let c = counts.entry(m.role).or_default();
                if *c < self.cfg.min_recent_per_lane {
                    keep[i] = true;
                }
                *c += 1;
            }
        }
        keep
    }

    /// Eviction-protection score.  Higher score means more protected; the
    /// decay is monotonic in distance from the newest message.
    fn scores(&self, hints: &CompactionHints) -> Vec<f32> {
        let n = self.entries.len();
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| match &entry.slot {
                Slot::Page(_) => f32::MAX,
                Slot::Msg(m) => {
                    let w = hints
                        .lane_weights
                        .get(&m.role)
                        .copied()
                        .unwrap_or_else(|| {
                            Self::default_lane_weights()
                                .get(&m.role)
                                .copied()
                                .unwrap_or(1.0)
                        });
                    let distance = (n - 1 - i) as f32;
                    let decay = 1.0 / (1.0 + 0.05 * distance);
                    w * decay * (1.0 + m.importance.unwrap_or(0.0))
                }
            })
            .collect()
    }

    // ── Victim span selection ─────────────────────────────────────────────────

    /// Pick `[start, end)` over `entries`: a contiguous run of non-keep
    /// messages from the oldest end, grown until roughly `needed` tokens are
    /// freed, then adjusted so no tool-call/tool-result pair is split.
    fn select_victims(&self, hints: &CompactionHints, needed: usize, aggr: f32) -> (usize, usize) {
        let n = self.entries.len();
        let keep = self.keep_set(hints);
        let scores = self.scores(hints);
        let cutoff = 0.4 + 0.8 * aggr;

        let mut start = 0;
        while start < n && keep[start] {
            start += 1;
        }

        let mut end = start;
        let mut freed = 0usize;
        while end < n && !keep[end] {
            if freed >= needed {
                break;
            }
            if scores[end] >= cutoff && freed > 0 {
                break;
            }
            freed += self.entry_tokens(&self.entries[end]);
            end += 1;
        }

        // Forward extension: pull in tool results whose calls are inside the
        // span, and parallel calls belonging to a run that started inside.
        while end < n && !keep[end] {
            if let Slot::Msg(m) = &self.entries[end].slot {
                match &m.content {
                    MessageContent::ToolResult { tool_call_id, .. }
                        if self.span_has_call(start, end, tool_call_id) =>
                    {
                        end += 1;
                        continue;
                    }
                    MessageContent::ToolCall { .. }
                        if end > start && self.is_tool_call(end - 1) =>
                    {
                        end += 1;
                        continue;
                    }
                    _ => {}
                }
            }
            break;
        }

        // Backward retreat: no call may stay in the span when its result is
        // out of reach (kept or protected), and no result may stay without
        // its call.  Retreat the span end to just before the earliest
        // half-orphan; repeat until the span is group-clean.
        loop {
            let mut retreat_to = None;
            for i in start..end {
                if let Slot::Msg(m) = &self.entries[i].slot {
                    let half_orphan = match &m.content {
                        MessageContent::ToolCall { tool_call_id, .. } => {
                            !self.span_has_result(start, end, tool_call_id)
                        }
                        MessageContent::ToolResult { tool_call_id, .. } => {
                            !self.span_has_call(start, end, tool_call_id)
                        }
                        _ => false,
                    };
                    if half_orphan {
                        retreat_to = Some(i);
                        break;
                    }
                }
            }
            match retreat_to {
                Some(i) => {
                    end = i;
                    if end <= start {
                        break;
                    }
                }
                None => break,
            }
        }

        (start, end)
    }

    fn is_tool_call(&self, i: usize) -> bool {
        matches!(
            &self.entries[i].slot,
            Slot::Msg(Message {
                content: MessageContent::ToolCall { .. },
                ..
            })
        )
    }

    fn span_has_call(&self, start: usize, end: usize, id: &str) -> bool {
        self.entries[start..end].iter().any(|e| {
            matches!(&e.slot, Slot::Msg(m)
                if matches!(&m.content, MessageContent::ToolCall { tool_call_id, .. } if tool_call_id == id))
        })
    }

    fn span_has_result(&self, start: usize, end: usize, id: &str) -> bool {
        self.entries[start..end].iter().any(|e| {
            matches!(&e.slot, Slot::Msg(m)
                if matches!(&m.content, MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == id))
        })
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn default_hints(&self) -> CompactionHints {
        CompactionHints {
            lane_weights: Self::default_lane_weights(),
            importance_threshold: None,
            // The thinking lever doubles as eviction aggressiveness: a busy
            // mind pages old material out faster.
            aggressiveness: self.thinking_budget,
            force: false,
        }
    }

    /// One full compaction: repeat span selection + summarization until the
    /// buffer is at or under target, growing aggressiveness each pass.
    ///
    /// On summarizer failure the buffer is left unchanged and the error is
    /// returned; the next `add` above the high-water mark re-arms compaction.
    /// The deterministic no-summary fallback applies only to forced
    /// compactions at full aggressiveness.
    async fn compact(&mut self, hints: &CompactionHints) -> anyhow::Result<usize> {
        let target = (self.cfg.working_memory_tokens as f32 * TARGET_AFTER) as usize;
        let mut total_paged = 0usize;

        for pass in 0..MAX_PASSES {
            let current = self.buffer_tokens();
            if current <= target && !(hints.force && pass == 0) {
                break;
            }
            let needed = current.saturating_sub(target).max(1);
            let aggr = (hints.aggressiveness + 0.25 * pass as f32).clamp(0.0, 1.0);
            let (start, end) = self.select_victims(hints, needed, aggr);
            if end <= start {
                break;
            }
            // A span smaller than its own summary marker is negative
            // progress; only the first pass of a forced compaction may take
            // one anyway.
            let span_tokens: usize = self.entries[start..end]
                .iter()
                .map(|e| self.entry_tokens(e))
                .sum();
            if pass > 0 && span_tokens < 64 {
                break;
            }

            let victims: Vec<Message> = self.entries[start..end]
                .iter()
                .filter_map(|e| match &e.slot {
                    Slot::Msg(m) => Some(m.clone()),
                    Slot::Page(_) => None,
                })
                .collect();
            debug_assert_eq!(victims.len(), end - start, "span must not contain pages");

            let label = dominant_lane(&victims);
            let transcript = serialize_span(&victims);
            let summary = match self.summarizer.summarize(&transcript, &label).await {
                Ok(s) => s,
                Err(e) if hints.force && aggr >= 1.0 => {
                    warn!(error = %e, "summarizer unavailable; archiving span without summary");
                    format!(
                        "[compaction fallback: {} messages archived without summary]",
                        victims.len()
                    )
                }
                Err(e) => {
                    warn!(error = %e, "compaction aborted; buffer left unchanged");
                    return Err(e);
                }
            };

            let token_count = self.estimator.estimate(&victims);
            let paged = victims.len();
            let id = self.store.create(victims, summary, &label, token_count);
            self.seq += 1;
            let marker = Entry {
                seq: self.seq,
                slot: Slot::Page(id.clone()),
            };
            self.entries.splice(start..end, [marker]);
            total_paged += paged;
            debug!(page = %id, messages = paged, pass, "compacted span into page");
        }

        Ok(total_paged)
    }

    // ── Projection helpers ────────────────────────────────────────────────────

    fn project(&self) -> Vec<(Message, bool)> {
        let mut out: Vec<(Message, bool)> = self
            .system_blocks
            .iter()
            .map(|m| (m.clone(), true))
            .collect();
        for entry in &self.entries {
            let protected = self.protected.contains(&entry.seq);
            match &entry.slot {
                Slot::Msg(m) => out.push((m.clone(), protected)),
                Slot::Page(id) => match self.store.load(id) {
                    Some(p) if self.loaded.iter().any(|l| l == id) => {
                        out.extend(p.raw_messages.iter().cloned().map(|m| (m, false)));
                    }
                    Some(p) => out.push((p.summary_message(), false)),
                    None => out.push((
                        Message::assistant(format!("[PAGE {id}: no longer available]"))
                            .with_source("page"),
                        false,
                    )),
                },
            }
        }
        out
    }
}

/// Post-condition of the projection: a run of tool calls must be immediately
/// followed by its matching results, 1:1.  Orphans on either side are
/// stripped — except protected messages, which always survive (their pair is
/// still in flight).
fn strip_orphan_tool_messages(messages: Vec<(Message, bool)>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        match &messages[i].0.content {
            MessageContent::ToolCall { .. } => {
                let start = i;
                while i < messages.len()
                    && matches!(messages[i].0.content, MessageContent::ToolCall { .. })
                {
                    i += 1;
                }
                let calls_end = i;
                while i < messages.len()
                    && matches!(messages[i].0.content, MessageContent::ToolResult { .. })
                {
                    i += 1;
                }
                let result_ids: HashSet<&str> = messages[calls_end..i]
                    .iter()
                    .filter_map(|(m, _)| m.tool_call_id())
                    .collect();
                let call_ids: HashSet<&str> = messages[start..calls_end]
                    .iter()
                    .filter_map(|(m, _)| m.tool_call_id())
                    .collect();
                for (m, protected) in &messages[start..calls_end] {
                    let id = m.tool_call_id().unwrap_or_default();
                    if *protected || result_ids.contains(id) {
                        out.push(m.clone());
                    }
                }
                for (m, protected) in &messages[calls_end..i] {
                    let id = m.tool_call_id().unwrap_or_default();
                    if *protected || call_ids.contains(id) {
                        out.push(m.clone());
                    }
                }
            }
            MessageContent::ToolResult { .. } => {
                // A result with no preceding call run is an orphan.
                if messages[i].1 {
                    out.push(messages[i].0.clone());
                }
                i += 1;
            }
            _ => {
                out.push(messages[i].0.clone());
                i += 1;
            }
        }
    }
    out
}

fn dominant_lane(messages: &[Message]) -> String {
    let mut counts: HashMap<Role, usize> = HashMap::new();
    for m in messages {
        *counts.entry(m.role).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, c)| *c)
        .map(|(r, _)| r.to_string())
        .unwrap_or_else(|| "mixed".into())
}

// ── AgentMemory implementation ────────────────────────────────────────────────

#[async_trait::async_trait]
impl AgentMemory for VirtualMemory {
    fn add(&mut self, message: Message) {
        if message.role == Role::System {
            self.system_blocks.push(message);
            return;
        }
        self.seq += 1;
        self.entries.push(Entry {
            seq: self.seq,
            slot: Slot::Msg(message),
        });
        if self.fraction() >= self.cfg.high_water_ratio {
            self.compaction_pending = true;
        }
    }

    fn messages(&self) -> Vec<Message> {
        strip_orphan_tool_messages(self.project())
    }

    fn export_messages(&self) -> Vec<Message> {
        // Warm-state capture: pages always render as their summary marker so
        // the buffer can be rebuilt with page entries intact.
        let mut out = self.system_blocks.clone();
        for entry in &self.entries {
            match &entry.slot {
                Slot::Msg(m) => out.push(m.clone()),
                Slot::Page(id) => match self.store.load(id) {
                    Some(p) => out.push(p.summary_message()),
                    None => out.push(
                        Message::assistant(format!("[PAGE {id}: no longer available]"))
                            .with_source("page"),
                    ),
                },
            }
        }
        out
    }

    fn replace_messages(&mut self, messages: Vec<Message>) {
        self.system_blocks.clear();
        self.entries.clear();
        self.protected.clear();
        for m in messages {
            if m.role == Role::System {
                self.system_blocks.push(m);
                continue;
            }
            self.seq += 1;
            let slot = match page_id_of_marker(&m) {
                Some(id) => Slot::Page(id),
                None => Slot::Msg(m),
            };
            self.entries.push(Entry {
                seq: self.seq,
                slot,
            });
        }
    }

    fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            resident_tokens: self.buffer_tokens() + self.system_tokens(),
            working_budget: self.cfg.working_memory_tokens,
            page_slot_tokens: self.slot_tokens(),
            page_slot_budget: self.cfg.page_slot_tokens,
            system_overhead_budget: self.cfg.system_overhead_tokens,
            resident_messages: self.entries.len(),
            page_count: self.store.len(),
            fraction: self.fraction(),
        }
    }

    async fn maintain(&mut self) -> anyhow::Result<()> {
        // Serialized: one compaction at a time; a request arriving while one
        // runs re-arms the pending flag and is coalesced into the next pass.
        while self.compaction_pending {
            self.compaction_pending = false;
            if self.fraction() < self.cfg.high_water_ratio {
                break;
            }
            let hints = self.default_hints();
            self.compact(&hints).await?;
        }
        Ok(())
    }

    async fn pre_tool_compact(&mut self, threshold: Option<f32>) -> anyhow::Result<()> {
        let threshold = threshold.unwrap_or(self.cfg.pre_tool_threshold);
        if self.fraction() <= threshold {
            return Ok(());
        }
        let hints = self.default_hints();
        self.compact(&hints).await.map(|_| ())
    }

    async fn compact_with_hints(&mut self, hints: CompactionHints) -> anyhow::Result<usize> {
        self.compact(&hints).await
    }

    fn protect_message(&mut self, message: &Message) {
        for entry in self.entries.iter().rev() {
            if let Slot::Msg(m) = &entry.slot {
                if m == message {
                    self.protected.insert(entry.seq);
                    return;
                }
            }
        }
    }

    fn clear_protected_messages(&mut self) {
        self.protected.clear();
    }

    fn ref_page(&mut self, id: &str) -> bool {
        if !self.store.inc_ref(id) {
            warn!(page = %id, "ref on unknown page");
            return false;
        }
        if !self.loaded.iter().any(|l| l == id) {
            self.loaded.push(id.to_string());
        }
        // The page slot is bounded: evict the least recently loaded page
        // (other than the one just referenced) until the slot fits.
        while self.slot_tokens() > self.cfg.page_slot_tokens && self.loaded.len() > 1 {
            let victim_pos = match self.loaded.iter().position(|l| l != id) {
                Some(p) => p,
                None => break,
            };
            let victim = self.loaded.remove(victim_pos);
            self.store.dec_ref(&victim);
            debug!(page = %victim, "evicted from page slot to fit budget");
        }
        true
    }

    fn unref_page(&mut self, id: &str) -> bool {
        if !self.store.dec_ref(id) {
            return false;
        }
        let remaining = self.store.load(id).map(|p| p.ref_count).unwrap_or(0);
        if remaining == 0 {
            self.loaded.retain(|l| l != id);
        }
        true
    }

    fn pin_page(&mut self, id: &str) -> bool {
        self.store.pin(id)
    }

    fn unpin_page(&mut self, id: &str) -> bool {
        self.store.unpin(id)
    }

    fn grep_pages(&self, pattern: &str, opts: &GrepOptions) -> Vec<GrepMatch> {
        self.store.grep(pattern, opts)
    }

    fn list_pages(&self) -> Vec<PageMeta> {
        self.store.list()
    }

    fn set_thinking_budget(&mut self, budget: f32) {
        self.thinking_budget = budget.clamp(0.0, 1.0);
    }

    fn set_working_budget(&mut self, tokens: usize) {
        self.cfg.working_memory_tokens = tokens;
        if self.fraction() >= self.cfg.high_water_ratio {
            self.compaction_pending = true;
        }
    }

    fn page_state(&self) -> Option<PageState> {
        Some(PageState {
            pages: self.store.snapshot(),
            loaded: self.loaded.clone(),
        })
    }

    fn restore_page_state(&mut self, state: PageState) {
        self.store.restore(state.pages);
        self.loaded = state
            .loaded
            .into_iter()
            .filter(|id| self.store.load(id).is_some())
            .collect();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarize::{StaticSummarizer, UnavailableSummarizer};

    fn small_cfg(budget: usize) -> MemoryConfig {
        MemoryConfig {
            working_memory_tokens: budget,
            page_slot_tokens: 200,
            min_recent_per_lane: 3,
            ..Default::default()
        }
    }

    fn vm_with(budget: usize) -> VirtualMemory {
        VirtualMemory::new(
            small_cfg(budget),
            PageStore::new(),
            Arc::new(StaticSummarizer("condensed history".into())),
        )
    }

    fn fill(vm: &mut VirtualMemory, count: usize, chars: usize) {
        for i in 0..count {
            vm.add(Message::user(format!("{i:03} {}", "x".repeat(chars))));
        }
    }

    // ── add / projection basics ───────────────────────────────────────────────

    #[test]
    fn system_messages_go_to_the_block_set_in_order() {
        let mut vm = vm_with(1000);
        vm.add(Message::system("first").with_source("boot"));
        vm.add(Message::user("hello"));
        vm.add(Message::system("second"));
        let msgs = vm.messages();
        assert_eq!(msgs[0].as_text(), Some("first"));
        assert_eq!(msgs[1].as_text(), Some("second"));
        assert_eq!(msgs[2].as_text(), Some("hello"));
    }

    #[test]
    fn projection_preserves_append_order() {
        let mut vm = vm_with(10_000);
        vm.add(Message::user("a"));
        vm.add(Message::assistant("b"));
        vm.add(Message::user("c"));
        let texts: Vec<_> = vm.messages().iter().filter_map(|m| m.as_text().map(str::to_string)).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    // ── compaction ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn overflow_triggers_compaction_and_creates_a_page() {
        let mut vm = vm_with(500);
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();

        assert!(vm.store().len() >= 1, "at least one page must exist");
        let usage = vm.usage();
        assert!(
            usage.fraction < 1.0,
            "buffer must drop under budget, got {}",
            usage.fraction
        );
        let page = vm.store().list().into_iter().next().unwrap();
        let loaded = vm.store().load(&page.id).unwrap();
        assert!(!loaded.summary.is_empty());
    }

    #[tokio::test]
    async fn newest_messages_survive_compaction_verbatim() {
        let mut vm = vm_with(500);
        fill(&mut vm, 20, 200);
        let before = vm.messages();
        let tail: Vec<_> = before[before.len() - 3..].to_vec();
        vm.maintain().await.unwrap();
        let after = vm.messages();
        for m in &tail {
            assert!(
                after.contains(m),
                "recent message must survive compaction: {:?}",
                m.as_text()
            );
        }
    }

    #[tokio::test]
    async fn budget_invariant_holds_across_adds() {
        let mut vm = vm_with(400);
        for i in 0..40 {
            vm.add(Message::user(format!("message number {i} with some padding text")));
            vm.maintain().await.unwrap();
            let u = vm.usage();
            let ceiling = u.working_budget + u.page_slot_budget + u.system_overhead_budget;
            assert!(
                u.resident_tokens + u.page_slot_tokens <= ceiling,
                "invariant violated at add {i}: {} > {}",
                u.resident_tokens + u.page_slot_tokens,
                ceiling
            );
        }
    }

    #[tokio::test]
    async fn important_messages_are_kept() {
        let mut vm = vm_with(500);
        vm.add(Message::user("precious constraint: port is 8443").with_importance(0.95));
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        let texts: Vec<_> = vm
            .messages()
            .iter()
            .filter_map(|m| m.as_text().map(str::to_string))
            .collect();
        assert!(
            texts.iter().any(|t| t.contains("8443")),
            "important message must not be paged"
        );
    }

    #[tokio::test]
    async fn summarizer_failure_leaves_buffer_unchanged() {
        let mut vm = VirtualMemory::new(
            small_cfg(500),
            PageStore::new(),
            Arc::new(UnavailableSummarizer),
        );
        fill(&mut vm, 20, 200);
        let before = vm.messages();
        assert!(vm.maintain().await.is_err());
        assert_eq!(vm.messages(), before, "failed compaction must not mutate");
        assert_eq!(vm.store().len(), 0);
    }

    #[tokio::test]
    async fn forced_full_aggressiveness_falls_back_without_summarizer() {
        let mut vm = VirtualMemory::new(
            small_cfg(500),
            PageStore::new(),
            Arc::new(UnavailableSummarizer),
        );
        fill(&mut vm, 20, 200);
        let hints = CompactionHints {
            aggressiveness: 1.0,
            force: true,
            ..Default::default()
        };
        let paged = vm.compact_with_hints(hints).await.unwrap();
        assert!(paged > 0);
        assert!(vm.store().len() >= 1);
    }

    // ── tool pairing ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_pairs_are_paged_together_or_not_at_all() {
        let cfg = MemoryConfig {
            working_memory_tokens: 100,
            min_recent_per_lane: 1,
            ..Default::default()
        };
        let mut vm = VirtualMemory::new(
            cfg,
            PageStore::new(),
            Arc::new(StaticSummarizer("condensed".into())),
        );
        vm.add(Message::user("start"));
        vm.add(Message::tool_call("c1", "shell", "{}"));
        vm.add(Message::tool_call("c2", "read_file", "{}"));
        vm.add(Message::tool_result("c1", &"out ".repeat(50)));
        vm.add(Message::tool_result("c2", &"data ".repeat(50)));
        vm.add(Message::user("filler one"));
        vm.add(Message::user("filler two"));
        vm.add(Message::user("filler three"));
        vm.add(Message::assistant("ack one"));
        vm.add(Message::assistant("ack two"));
        vm.add(Message::tool_call("c3", "shell", "{}"));
        vm.add(Message::tool_result("c3", "late output"));
        vm.add(Message::assistant("done"));

        let hints = CompactionHints {
            aggressiveness: 1.0,
            force: true,
            ..Default::default()
        };
        let paged = vm.compact_with_hints(hints).await.unwrap();
        assert!(paged > 0, "the old tool group must page out");

        let msgs = vm.messages();
        let call_ids: Vec<&str> = msgs
            .iter()
            .filter(|m| matches!(m.content, MessageContent::ToolCall { .. }))
            .filter_map(|m| m.tool_call_id())
            .collect();
        let result_ids: Vec<&str> = msgs
            .iter()
            .filter(|m| matches!(m.content, MessageContent::ToolResult { .. }))
            .filter_map(|m| m.tool_call_id())
            .collect();
        assert_eq!(call_ids, result_ids, "surviving calls and results must pair 1:1");

        // Whichever side of the boundary the group landed on, the page (if
        // any) must hold either the whole group or none of it.
        for meta in vm.store().list() {
            let page = vm.store().load(&meta.id).unwrap();
            let calls = page
                .raw_messages
                .iter()
                .filter(|m| matches!(m.content, MessageContent::ToolCall { .. }))
                .count();
            let results = page
                .raw_messages
                .iter()
                .filter(|m| matches!(m.content, MessageContent::ToolResult { .. }))
                .count();
            assert_eq!(calls, results, "page must not split a tool group");
        }
    }

    #[test]
    fn orphan_tool_call_is_stripped_from_projection() {
        let mut vm = vm_with(10_000);
        vm.add(Message::tool_call("c1", "shell", "{}"));
        vm.add(Message::user("unrelated"));
        let msgs = vm.messages();
        assert!(
            !msgs.iter().any(|m| matches!(m.content, MessageContent::ToolCall { .. })),
            "orphan call must be stripped"
        );
    }

    #[test]
    fn orphan_tool_result_is_stripped_from_projection() {
        let mut vm = vm_with(10_000);
        vm.add(Message::tool_result("c9", "stale output"));
        vm.add(Message::user("hello"));
        let msgs = vm.messages();
        assert!(
            !msgs.iter().any(|m| matches!(m.content, MessageContent::ToolResult { .. }))
        );
    }

    #[test]
    fn protected_in_flight_call_survives_projection() {
        let mut vm = vm_with(10_000);
        let call = Message::tool_call("c1", "shell", "{}");
        vm.add(call.clone());
        vm.protect_message(&call);
        let msgs = vm.messages();
        assert!(
            msgs.iter().any(|m| m.tool_call_id() == Some("c1")),
            "protected call must survive even without its result"
        );
    }

    // ── protection ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn protected_messages_survive_until_cleared() {
        let mut vm = vm_with(500);
        let precious = Message::user("protect me specifically");
        vm.add(precious.clone());
        vm.protect_message(&precious);
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        assert!(vm.messages().contains(&precious));

        vm.clear_protected_messages();
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        // After clearing, the message is old and unprotected; it may page out.
        // The guarantee being tested is only the protected window above.
    }

    // ── page slot ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ref_materializes_raw_messages_in_place() {
        let mut vm = vm_with(500);
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        let page = vm.store().list().into_iter().next().unwrap();

        let before = vm.messages();
        assert!(
            before.iter().any(|m| m.source.as_deref() == Some("page")),
            "summary marker expected before ref"
        );

        assert!(vm.ref_page(&page.id));
        let after = vm.messages();
        assert!(after.len() > before.len(), "raw span must expand projection");
        let raw_first = vm.store().load(&page.id).unwrap().raw_messages[0].clone();
        assert!(after.contains(&raw_first));
    }

    #[tokio::test]
    async fn unref_returns_to_summary_rendering() {
        let mut vm = vm_with(500);
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        let page = vm.store().list().into_iter().next().unwrap();
        vm.ref_page(&page.id);
        vm.unref_page(&page.id);
        let msgs = vm.messages();
        assert!(msgs
            .iter()
            .any(|m| m.as_text().map(|t| t.starts_with("[PAGE ")).unwrap_or(false)));
        assert_eq!(vm.store().load(&page.id).unwrap().ref_count, 0);
    }

    #[test]
    fn ref_unknown_page_is_graceful() {
        let mut vm = vm_with(500);
        assert!(!vm.ref_page("pg-missing"));
        assert!(!vm.unref_page("pg-missing"));
    }

    // ── state capture ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn page_state_round_trip_is_identity() {
        let mut vm = vm_with(500);
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        let page = vm.store().list().into_iter().next().unwrap();
        vm.ref_page(&page.id);
        vm.pin_page(&page.id);

        let state = vm.page_state().unwrap();
        let exported = vm.export_messages();

        let mut vm2 = vm_with(500);
        vm2.restore_page_state(state.clone());
        vm2.replace_messages(exported);

        assert_eq!(vm2.page_state().unwrap(), state);
        assert_eq!(vm2.messages(), vm.messages());
    }

    #[tokio::test]
    async fn export_renders_loaded_pages_as_markers() {
        let mut vm = vm_with(500);
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        let page = vm.store().list().into_iter().next().unwrap();
        vm.ref_page(&page.id);
        let exported = vm.export_messages();
        assert!(exported
            .iter()
            .any(|m| page_id_of_marker(m).as_deref() == Some(page.id.as_str())));
    }

    // ── knobs ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn shrinking_working_budget_rearms_compaction() {
        let mut vm = vm_with(100_000);
        fill(&mut vm, 20, 200);
        vm.maintain().await.unwrap();
        assert_eq!(vm.store().len(), 0, "no compaction under a huge budget");

        vm.set_working_budget(500);
        vm.maintain().await.unwrap();
        assert!(vm.store().len() >= 1, "hot-reloaded budget must compact");
    }

    #[tokio::test]
    async fn pre_tool_compact_frees_room() {
        let mut vm = vm_with(600);
        fill(&mut vm, 14, 200);
        vm.pre_tool_compact(Some(0.5)).await.unwrap();
        assert!(vm.usage().fraction <= 0.8);
    }

    #[test]
    fn dangling_page_marker_renders_gone() {
        let mut vm = vm_with(1000);
        vm.replace_messages(vec![
            Message::assistant("[PAGE pg-dead1234567 (user): old summary]").with_source("page"),
            Message::user("hi"),
        ]);
        let msgs = vm.messages();
        assert!(msgs[0]
            .as_text()
            .unwrap()
            .contains("no longer available"));
    }
}
