// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sensory memory: a decorator that injects bounded, per-turn situational
//! channels into the system prompt.
//!
//! The camera metaphor: three slots, each optionally aimed at a named
//! channel.  Only what a slot looks at gets rendered, and the whole block
//! never exceeds its token budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use skald_config::SensoryConfig;
use skald_model::{Message, Role};

use crate::estimate::TokenEstimator;
use crate::page::{GrepMatch, GrepOptions, PageMeta, PageState};
use crate::{AgentMemory, CompactionHints, MemoryUsage};

pub const SLOT_COUNT: usize = 3;

const DEFAULT_CHANNEL_TOKENS: usize = 120;
const DEFAULT_WIDTH: u16 = 48;
const DEFAULT_HEIGHT: u16 = 4;

/// Produces channel content on poll.  Must be idempotent within a turn; the
/// registry calls it at most once per turn.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn poll(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    PerTurn,
    OnDemand,
}

struct Channel {
    name: String,
    max_tokens: usize,
    width: u16,
    height: u16,
    update_mode: UpdateMode,
    enabled: bool,
    source: Arc<dyn ChannelSource>,
    last_content: String,
}

/// Shared status snapshot feeding the built-in channels.  The turn loop
/// updates it each round; channel sources only read.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<StatusSnapshot>>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub round: u32,
    pub violations: u32,
    pub usage: Option<MemoryUsage>,
}

impl StatusBoard {
    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard);
    }

    pub fn get(&self) -> StatusSnapshot {
        self.inner.lock().unwrap().clone()
    }
}

struct ContextSource {
    board: StatusBoard,
}

#[async_trait]
impl ChannelSource for ContextSource {
    async fn poll(&self) -> String {
        let s = self.board.get();
        match s.usage {
            Some(u) => format!(
                "{:.0}% ctx | {} msgs | {} pages | {} violations",
                (u.fraction * 100.0).min(999.0),
                u.resident_messages,
                u.page_count,
                s.violations
            ),
            None => "ctx: no data yet".into(),
        }
    }
}

struct ClockSource {
    board: StatusBoard,
}

#[async_trait]
impl ChannelSource for ClockSource {
    async fn poll(&self) -> String {
        let s = self.board.get();
        format!(
            "{} | round {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            s.round
        )
    }
}

struct NotesSource {
    notes: Arc<Mutex<String>>,
}

#[async_trait]
impl ChannelSource for NotesSource {
    async fn poll(&self) -> String {
        let notes = self.notes.lock().unwrap();
        if notes.is_empty() {
            "(no notes)".into()
        } else {
            notes.clone()
        }
    }
}

/// Serializable sensory state for warm snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SensoryState {
    pub notes: String,
    pub slots: Vec<Option<String>>,
    pub channels: Vec<ChannelState>,
    /// The block as last rendered, so a restored worker projects the exact
    /// same message list before its first own render.
    #[serde(default)]
    pub last_rendered: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelState {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub max_tokens: usize,
    pub enabled: bool,
}

/// The decorator.  Wraps any [`AgentMemory`]; everything delegates inward
/// except `messages()`, which injects the rendered sensory block as a
/// distinguished system message.
pub struct SensoryMemory {
    inner: Box<dyn AgentMemory>,
    channels: HashMap<String, Channel>,
    slots: [Option<String>; SLOT_COUNT],
    budget_tokens: usize,
    estimator: TokenEstimator,
    rendered: Option<String>,
    notes: Arc<Mutex<String>>,
}

impl SensoryMemory {
    /// Wrap `inner`, registering the built-in channels (`context`, `clock`,
    /// `notes`) and binding slots from config.
    pub fn new(inner: Box<dyn AgentMemory>, cfg: &SensoryConfig, board: StatusBoard) -> Self {
        let notes = Arc::new(Mutex::new(String::new()));
        let mut sm = Self {
            inner,
            channels: HashMap::new(),
            slots: Default::default(),
            budget_tokens: cfg.budget_tokens,
            estimator: TokenEstimator::default(),
            rendered: None,
            notes: notes.clone(),
        };
        sm.register_channel(
            "context",
            Arc::new(ContextSource {
                board: board.clone(),
            }),
            UpdateMode::PerTurn,
        );
        sm.register_channel("clock", Arc::new(ClockSource { board }), UpdateMode::PerTurn);
        sm.register_channel("notes", Arc::new(NotesSource { notes }), UpdateMode::PerTurn);
        for (i, name) in cfg.slots.iter().take(SLOT_COUNT).enumerate() {
            if sm.channels.contains_key(name) {
                sm.slots[i] = Some(name.clone());
            } else {
                warn!(channel = %name, slot = i, "configured channel does not exist");
            }
        }
        sm
    }

    pub fn register_channel(
        &mut self,
        name: &str,
        source: Arc<dyn ChannelSource>,
        update_mode: UpdateMode,
    ) {
        self.channels.insert(
            name.to_string(),
            Channel {
                name: name.to_string(),
                max_tokens: DEFAULT_CHANNEL_TOKENS,
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                update_mode,
                enabled: true,
                source,
                last_content: String::new(),
            },
        );
    }

    // ── Marker surface ────────────────────────────────────────────────────────

    /// `<view:channel[,slot]>` — aim a slot at a channel.
    pub fn view(&mut self, channel: &str, slot: Option<usize>) {
        let slot = slot.unwrap_or(0).min(SLOT_COUNT - 1);
        if !self.channels.contains_key(channel) {
            warn!(%channel, "view: unknown channel");
            return;
        }
        self.slots[slot] = Some(channel.to_string());
    }

    /// `<view:off[,slot]>` — empty a slot.
    pub fn view_off(&mut self, slot: Option<usize>) {
        let slot = slot.unwrap_or(0).min(SLOT_COUNT - 1);
        self.slots[slot] = None;
    }

    /// `<view:next>` / `<view:prev>` — cycle slot 0 through the registry.
    pub fn view_cycle(&mut self, forward: bool) {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        if names.is_empty() {
            return;
        }
        let current = self.slots[0]
            .as_ref()
            .and_then(|c| names.iter().position(|n| n == c));
        let next = match (current, forward) {
            (Some(i), true) => (i + 1) % names.len(),
            (Some(i), false) => (i + names.len() - 1) % names.len(),
            (None, _) => 0,
        };
        self.slots[0] = Some(names[next].clone());
    }

    /// `<sense:channel[,on|off]>` — enable/disable (toggle without arg).
    pub fn sense(&mut self, channel: &str, on: Option<bool>) {
        match self.channels.get_mut(channel) {
            Some(c) => c.enabled = on.unwrap_or(!c.enabled),
            None => warn!(%channel, "sense: unknown channel"),
        }
    }

    /// `<resize:channel,W,H>` — change grid dimensions.
    pub fn resize(&mut self, channel: &str, width: u16, height: u16) {
        match self.channels.get_mut(channel) {
            Some(c) => {
                c.width = width.max(8);
                c.height = height.max(1);
            }
            None => warn!(%channel, "resize: unknown channel"),
        }
    }

    /// Append a line to the agent's self-notes channel.
    pub fn append_note(&mut self, note: &str) {
        let mut notes = self.notes.lock().unwrap();
        if !notes.is_empty() {
            notes.push('\n');
        }
        notes.push_str(note);
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    /// Poll per-turn channels and rebuild the rendered block.  Called once
    /// at the top of each round; each bound channel polls at most once.
    pub async fn render_turn(&mut self) {
        let mut polled: Vec<(String, String)> = Vec::new();
        for slot in self.slots.iter().flatten() {
            if let Some(c) = self.channels.get(slot) {
                if c.enabled && c.update_mode == UpdateMode::PerTurn {
                    let content = c.source.poll().await;
                    polled.push((slot.clone(), content));
                }
            }
        }
        for (name, content) in polled {
            if let Some(c) = self.channels.get_mut(&name) {
                c.last_content = content;
            }
        }
        self.rendered = self.render();
    }

    fn render(&self) -> Option<String> {
        let mut out = String::new();
        let mut total_tokens = 0usize;
        for slot in self.slots.iter().flatten() {
            let Some(c) = self.channels.get(slot) else {
                continue;
            };
            if !c.enabled {
                continue;
            }
            let block = render_channel(c);
            let block_tokens = self.estimator.text(&block);
            if total_tokens + block_tokens > self.budget_tokens {
                // Hard cap: tail-trim the block to the remaining budget.
                let remaining = self.budget_tokens.saturating_sub(total_tokens);
                let max_chars =
                    (remaining as f32 * crate::estimate::DEFAULT_AVG_CHARS_PER_TOKEN) as usize;
                if max_chars > 8 {
                    let mut cut = max_chars.min(block.len());
                    while !block.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    out.push_str(&block[..cut]);
                }
                break;
            }
            total_tokens += block_tokens;
            out.push_str(&block);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn sensory_message(&self) -> Option<Message> {
        self.rendered
            .as_ref()
            .map(|r| Message::system(r.clone()).with_source("SensoryMemory"))
    }

    // ── State capture ─────────────────────────────────────────────────────────

    pub fn state(&self) -> SensoryState {
        let mut channels: Vec<ChannelState> = self
            .channels
            .values()
            .map(|c| ChannelState {
                name: c.name.clone(),
                width: c.width,
                height: c.height,
                max_tokens: c.max_tokens,
                enabled: c.enabled,
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        SensoryState {
            notes: self.notes.lock().unwrap().clone(),
            slots: self.slots.iter().cloned().collect(),
            channels,
            last_rendered: self.rendered.clone(),
        }
    }

    pub fn restore_state(&mut self, state: SensoryState) {
        *self.notes.lock().unwrap() = state.notes;
        self.rendered = state.last_rendered;
        for (i, binding) in state.slots.into_iter().take(SLOT_COUNT).enumerate() {
            self.slots[i] = binding.filter(|name| self.channels.contains_key(name));
        }
        for cs in state.channels {
            if let Some(c) = self.channels.get_mut(&cs.name) {
                c.width = cs.width;
                c.height = cs.height;
                c.max_tokens = cs.max_tokens;
                c.enabled = cs.enabled;
            }
        }
    }

    /// Swap the wrapped memory (the `memory` marker).  The caller transfers
    /// message history; this only exchanges the inner box.
    pub fn swap_inner(&mut self, new_inner: Box<dyn AgentMemory>) -> Box<dyn AgentMemory> {
        std::mem::replace(&mut self.inner, new_inner)
    }

    pub fn inner(&self) -> &dyn AgentMemory {
        self.inner.as_ref()
    }
}

/// Fence one channel into its fixed-width grid: clip lines to `width`
/// columns, keep at most `height` lines, then tail-trim to the channel's
/// token cap (the header line always survives).
fn render_channel(c: &Channel) -> String {
    let header = format!("=== {} ({}x{}) ===\n", c.name, c.width, c.height);
    let mut body = String::new();
    for line in c.last_content.lines().take(c.height as usize) {
        let mut cut = (c.width as usize).min(line.len());
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        body.push_str(&line[..cut]);
        body.push('\n');
    }
    let max_chars = (c.max_tokens as f32 * crate::estimate::DEFAULT_AVG_CHARS_PER_TOKEN) as usize;
    if body.len() > max_chars {
        let mut cut = max_chars;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('\n');
    }
    format!("{header}{body}")
}

// ── AgentMemory delegation ────────────────────────────────────────────────────

#[async_trait]
impl AgentMemory for SensoryMemory {
    fn add(&mut self, message: Message) {
        self.inner.add(message);
    }

    fn messages(&self) -> Vec<Message> {
        let mut msgs = self.inner.messages();
        if let Some(block) = self.sensory_message() {
            let pos = msgs
                .iter()
                .take_while(|m| m.role == Role::System)
                .count();
            msgs.insert(pos, block);
        }
        msgs
    }

    fn export_messages(&self) -> Vec<Message> {
        // The sensory block is synthetic per-turn state; warm capture takes
        // the inner buffer only and SensoryState separately.
        self.inner.export_messages()
    }

    fn replace_messages(&mut self, messages: Vec<Message>) {
        self.inner.replace_messages(messages);
    }

    fn usage(&self) -> MemoryUsage {
        self.inner.usage()
    }

    async fn maintain(&mut self) -> anyhow::Result<()> {
        self.inner.maintain().await
    }

    async fn pre_tool_compact(&mut self, threshold: Option<f32>) -> anyhow::Result<()> {
        self.inner.pre_tool_compact(threshold).await
    }

    async fn compact_with_hints(&mut self, hints: CompactionHints) -> anyhow::Result<usize> {
        self.inner.compact_with_hints(hints).await
    }

    fn protect_message(&mut self, message: &Message) {
        self.inner.protect_message(message);
    }

    fn clear_protected_messages(&mut self) {
        self.inner.clear_protected_messages();
    }

    fn ref_page(&mut self, id: &str) -> bool {
        self.inner.ref_page(id)
    }

    fn unref_page(&mut self, id: &str) -> bool {
        self.inner.unref_page(id)
    }

    fn pin_page(&mut self, id: &str) -> bool {
        self.inner.pin_page(id)
    }

    fn unpin_page(&mut self, id: &str) -> bool {
        self.inner.unpin_page(id)
    }

    fn grep_pages(&self, pattern: &str, opts: &GrepOptions) -> Vec<GrepMatch> {
        self.inner.grep_pages(pattern, opts)
    }

    fn list_pages(&self) -> Vec<PageMeta> {
        self.inner.list_pages()
    }

    fn set_thinking_budget(&mut self, budget: f32) {
        self.inner.set_thinking_budget(budget);
    }

    fn set_working_budget(&mut self, tokens: usize) {
        self.inner.set_working_budget(tokens);
    }

    fn page_state(&self) -> Option<PageState> {
        self.inner.page_state()
    }

    fn restore_page_state(&mut self, state: PageState) {
        self.inner.restore_page_state(state);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
