// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agentic turn loop: a bounded fixed-point iteration alternating model
//! calls and tool executions.
//!
//! Per round: decay the thinking lever, pick a model tier, poll sensory
//! channels, run scheduled compaction, stream one model call through the
//! marker parser, dispatch markers, execute tool calls in model order, and
//! check the degenerate-behavior tracker.  The loop ends when the model
//! stops calling tools (or persistent mode runs out of nudges), when the
//! round cap is reached, or on an abort signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use skald_config::{Config, MemoryMode};
use skald_memory::{AgentMemory, CompactionHints, GrepOptions, SensoryMemory, StatusBoard};
use skald_model::{
    catalog, ChatDriver, ChatRequest, DriverFactory, Message, ResponseEvent, Selection, Tier,
    TierLadder, Usage,
};

use crate::error::CoreError;
use crate::events::AgentEvent;
use crate::markers::Marker;
use crate::parser::{scan_text, MarkerParser};
use crate::runtime_state::RuntimeState;
use crate::session_store::SessionStore;
use crate::spend::SpendMeter;
use crate::tools::{ToolCall, ToolRegistry};
use crate::violations::{RoundObservation, ViolationTracker};
use crate::warm::{Awareness, SnapshotSink, WarmState, WARM_STATE_VERSION};

/// Ceiling for the consecutive-failure backoff.
const MAX_BACKOFF_MS: u64 = 30_000;

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a tool-using agent with paged conversation memory. Older history is \
compacted into pages; reference a page with @@ref('pg-…')@@ to reload it and \
@@unref('pg-…')@@ to release it. Inline control markers (@@think@@, \
@@relax@@, @@thinking(x)@@, @@importance(x)@@, @@sleep@@, …) adjust your own \
runtime; they are stripped from the text shown to the user.";

/// Builds a fresh inner memory for the `memory` hot-swap marker.
pub type MemoryFactory = Box<dyn Fn(MemoryMode) -> Box<dyn AgentMemory> + Send + Sync>;

pub struct TurnLoop {
    config: Arc<Config>,
    memory: SensoryMemory,
    driver: Arc<dyn ChatDriver>,
    factory: DriverFactory,
    memory_factory: Option<MemoryFactory>,
    tools: Arc<ToolRegistry>,
    ladder: TierLadder,
    runtime: RuntimeState,
    spend: SpendMeter,
    violations: ViolationTracker,
    board: StatusBoard,
    session_id: String,
    session_store: Arc<dyn SessionStore>,
    snapshot_sink: Option<Arc<dyn SnapshotSink>>,
    awareness: Awareness,
    memory_mode: MemoryMode,
    last_send_target: Option<String>,
    mcp_configs: Vec<Value>,
    reboot_requested: bool,
    yield_requested: bool,
    remediated_this_round: bool,
}

struct RoundOutput {
    text: String,
    markers: Vec<Marker>,
    tool_calls: Vec<ToolCall>,
    aborted: bool,
}

impl TurnLoop {
    pub fn new(
        config: Arc<Config>,
        memory: SensoryMemory,
        driver: Arc<dyn ChatDriver>,
        factory: DriverFactory,
        tools: Arc<ToolRegistry>,
        session_store: Arc<dyn SessionStore>,
        board: StatusBoard,
    ) -> Self {
        let mut ladder = TierLadder::new(config.model.providers.clone());
        if let Some(cap) = config.model.max_tier.as_deref() {
            match cap.parse::<Tier>() {
                Ok(t) => ladder = ladder.with_max_tier(Some(t)),
                Err(e) => warn!(value = cap, error = %e, "ignoring bad max_tier"),
            }
        }
        if let Some(name) = config.model.name.as_deref() {
            match catalog::resolve_alias(name) {
                Some(entry) => ladder = ladder.with_floor(&entry.provider, &entry.id),
                None => warn!(model = name, "configured model not in catalog; no floor set"),
            }
        }
        let violations = ViolationTracker::new(
            config.agent.persistent,
            config.agent.idle_threshold,
            config.agent.same_tool_threshold,
        );
        let spend = SpendMeter::new(config.agent.spend_ceiling_tokens);
        let memory_mode = config.memory.mode;
        Self {
            config,
            memory,
            driver,
            factory,
            memory_factory: None,
            tools,
            ladder,
            runtime: RuntimeState::default(),
            spend,
            violations,
            board,
            session_id: uuid::Uuid::new_v4().to_string(),
            session_store,
            snapshot_sink: None,
            awareness: Awareness::default(),
            memory_mode,
            last_send_target: None,
            mcp_configs: Vec::new(),
            reboot_requested: false,
            yield_requested: false,
            remediated_this_round: false,
        }
    }

    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshot_sink = Some(sink);
        self
    }

    pub fn with_memory_factory(mut self, factory: MemoryFactory) -> Self {
        self.memory_factory = Some(factory);
        self
    }

    pub fn with_mcp_configs(mut self, configs: Vec<Value>) -> Self {
        self.mcp_configs = configs;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn memory(&self) -> &SensoryMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SensoryMemory {
        &mut self.memory
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    pub fn spend(&self) -> &SpendMeter {
        &self.spend
    }

    pub fn violations(&self) -> &ViolationTracker {
        &self.violations
    }

    /// Set after a `reboot` marker: the caller sends the reload snapshot and
    /// exits with code 75.
    pub fn take_reboot_request(&mut self) -> bool {
        std::mem::take(&mut self.reboot_requested)
    }

    // ── Warm state ────────────────────────────────────────────────────────────

    pub fn warm_state(&self) -> WarmState {
        WarmState {
            version: WARM_STATE_VERSION,
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            memory_type: self.memory_mode.to_string(),
            messages: self.memory.export_messages(),
            page_state: self.memory.page_state(),
            sensory_state: Some(self.memory.state()),
            runtime: self.runtime.snapshot(),
            spend: self.spend.state().clone(),
            violations: Some(self.violations.state().clone()),
            familiarity: self.awareness.familiarity,
            deja_vu: self.awareness.deja_vu,
            last_send_target: self.last_send_target.clone(),
            mcp_configs: self.mcp_configs.clone(),
        }
    }

    pub fn restore_warm_state(&mut self, state: WarmState) -> anyhow::Result<()> {
        if !state.version_matches() {
            anyhow::bail!(
                "warm state version {} does not match {}",
                state.version,
                WARM_STATE_VERSION
            );
        }
        if state.memory_type != self.memory_mode.to_string() {
            self.swap_memory_mode(&state.memory_type);
        }
        if let Some(ps) = state.page_state {
            self.memory.restore_page_state(ps);
        }
        self.memory.replace_messages(state.messages);
        if let Some(ss) = state.sensory_state {
            self.memory.restore_state(ss);
        }
        self.runtime.restore(&state.runtime);
        self.spend.restore(state.spend);
        if let Some(vs) = state.violations {
            self.violations.restore(vs);
        }
        self.awareness = Awareness {
            familiarity: state.familiarity,
            deja_vu: state.deja_vu,
        };
        self.awareness.on_warm_restore();
        self.last_send_target = state.last_send_target;
        self.mcp_configs = state.mcp_configs;
        self.session_id = state.session_id;
        Ok(())
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Run one user turn to completion, streaming events through `tx`.
    /// Returns the accumulated clean text.
    pub async fn submit(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<String> {
        // Keep the sender half alive so the cancel channel never fires.
        let (_guard, mut cancel) = oneshot::channel::<()>();
        self.run(user_input, tx, &mut cancel).await
    }

    /// Like [`submit`] but with an abort channel (user ESC).  Sending `()`
    /// or dropping the sender aborts the in-flight model call; partial text
    /// already streamed is committed and a termination note is injected.
    pub async fn submit_with_cancel(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<String> {
        self.run(user_input, tx, &mut cancel).await
    }

    async fn run(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<String> {
        if !self
            .memory
            .messages()
            .iter()
            .any(|m| m.role == skald_model::Role::System && m.source.as_deref() != Some("SensoryMemory"))
        {
            self.memory
                .add(Message::system(DEFAULT_SYSTEM_PROMPT).with_source("boot"));
        }
        self.memory.add(Message::user(user_input));
        self.runtime.idle_nudges = 0;

        let mut accumulated = String::new();
        let mut had_tools_any = false;
        let mut round_in_turn = 0u32;

        loop {
            round_in_turn += 1;
            if round_in_turn > self.config.agent.max_rounds {
                if had_tools_any {
                    self.memory.add(
                        Message::user(format!(
                            "Maximum tool rounds reached ({}). Do not call any more tools; \
                             summarise what was completed and what remains.",
                            self.config.agent.max_rounds
                        ))
                        .with_source("loop"),
                    );
                    self.prepare_round(&tx).await;
                    if let Ok(wrap) = self.stream_one_round(&tx, cancel, false).await {
                        if !wrap.text.is_empty() {
                            self.memory.add(Message::assistant(&wrap.text));
                            push_text(&mut accumulated, &wrap.text);
                        }
                    }
                }
                break;
            }

            self.prepare_round(&tx).await;

            let round = match self.stream_one_round(&tx, cancel, true).await {
                Ok(r) => r,
                Err(e) => {
                    self.autosave(&tx).await;
                    return Err(e);
                }
            };

            // Spend cap is the one error class that kills the turn outright.
            if let Err(e) = self.spend.check_ceiling(self.violations.penalty_factor()) {
                self.autosave(&tx).await;
                return Err(e.into());
            }

            let importance = round.markers.iter().find_map(|m| match m {
                Marker::Control { name, arg } if name == "importance" => {
                    arg.as_deref().and_then(|a| a.parse::<f32>().ok())
                }
                _ => None,
            });

            if !round.text.is_empty() {
                let mut msg = Message::assistant(&round.text);
                if let Some(imp) = importance {
                    msg = msg.with_importance(imp);
                }
                self.memory.add(msg);
                push_text(&mut accumulated, &round.text);
            }

            // Markers observed during streaming dispatch before any tool
            // execution this round.
            for marker in &round.markers {
                self.apply_marker(marker).await;
                let _ = tx
                    .send(AgentEvent::MarkerDispatched {
                        name: marker.name().to_string(),
                    })
                    .await;
            }

            if round.aborted {
                self.memory
                    .add(Message::user("[turn aborted by user]").with_source("loop"));
                let _ = tx
                    .send(AgentEvent::Aborted {
                        partial_text: round.text.clone(),
                    })
                    .await;
                break;
            }

            if self.reboot_requested {
                break;
            }

            if round.tool_calls.is_empty() {
                let obs = RoundObservation {
                    usage_fraction: self.memory.usage().fraction,
                    remediated: self.remediated_this_round,
                    ..Default::default()
                };
                self.handle_violation(&tx, &obs).await;

                if self.config.agent.persistent
                    && !self.violations.sleeping()
                    && self.runtime.idle_nudges < self.config.agent.max_idle_nudges
                {
                    self.runtime.idle_nudges += 1;
                    self.memory.add(
                        Message::user(
                            "You are in persistent mode: continue working by calling a tool, \
                             or declare @@sleep@@ / @@listening@@ if you are idle on purpose.",
                        )
                        .with_source("loop"),
                    );
                    let _ = tx
                        .send(AgentEvent::IdleNudge {
                            count: self.runtime.idle_nudges,
                        })
                        .await;
                    continue;
                }
                break;
            }

            had_tools_any = true;

            // Make room before tool results land.
            if let Err(e) = self.memory.pre_tool_compact(None).await {
                warn!(error = %e, "pre-tool compaction failed");
            }

            let mut tool_names = Vec::new();
            let mut listen_only_all = true;
            let mut any_failed = false;

            for tc in round.tool_calls {
                let mut args = tc.args.clone();
                for marker in scan_args_for_markers(&mut args) {
                    self.apply_marker(&marker).await;
                    let _ = tx
                        .send(AgentEvent::MarkerDispatched {
                            name: marker.name().to_string(),
                        })
                        .await;
                }

                let call_msg = Message::tool_call(&tc.id, &tc.name, args.to_string());
                self.memory.add(call_msg.clone());
                self.memory.protect_message(&call_msg);
                let _ = tx
                    .send(AgentEvent::ToolCallStarted {
                        call_id: tc.id.clone(),
                        name: tc.name.clone(),
                    })
                    .await;

                let output = self
                    .tools
                    .execute(&ToolCall {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        args,
                    })
                    .await;

                any_failed |= output.is_error;
                listen_only_all &= self.tools.is_listen_only(&tc.name);
                tool_names.push(tc.name.clone());

                let content =
                    truncate_tool_result(&output.content, self.config.agent.tool_result_token_cap);
                let result_msg = Message::tool_result(&tc.id, content);
                self.memory.add(result_msg.clone());
                self.memory.protect_message(&result_msg);
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        call_id: output.call_id,
                        name: tc.name.clone(),
                        output: output.content,
                        is_error: output.is_error,
                        duration_ms: output.duration.as_millis() as u64,
                    })
                    .await;
            }

            // In-flight tool pairs were protected from compaction during the
            // round; the protection window closes here.
            self.memory.clear_protected_messages();

            let obs = RoundObservation {
                had_tool_calls: true,
                tool_names,
                listen_only: listen_only_all,
                usage_fraction: self.memory.usage().fraction,
                remediated: self.remediated_this_round,
            };
            self.handle_violation(&tx, &obs).await;

            if any_failed {
                self.runtime.consecutive_failed_rounds += 1;
                let n = self.runtime.consecutive_failed_rounds;
                let delay = (self.config.agent.retry_base_ms << (n.saturating_sub(1)).min(16))
                    .min(MAX_BACKOFF_MS);
                debug!(consecutive = n, delay_ms = delay, "tool failure backoff");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            } else {
                self.runtime.consecutive_failed_rounds = 0;
            }

            if round_in_turn % self.config.agent.auto_save_interval == 0 {
                self.autosave(&tx).await;
            }

            if self.yield_requested {
                self.yield_requested = false;
                break;
            }
        }

        self.autosave(&tx).await;
        let _ = tx.send(AgentEvent::TurnComplete).await;
        Ok(accumulated)
    }

    /// Round preamble: decay + tier selection + sensory poll + scheduled
    /// compaction.
    async fn prepare_round(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        self.runtime.begin_round();
        self.awareness.on_round();
        self.remediated_this_round = false;
        self.select_driver();

        let usage = self.memory.usage();
        let round = self.runtime.round;
        let violations = self.violations.total();
        self.board.update(|s| {
            s.round = round;
            s.violations = violations;
            s.usage = Some(usage);
        });
        self.memory.render_turn().await;

        let before = self.memory.usage();
        self.memory
            .set_thinking_budget(self.runtime.thinking_budget);
        match self.memory.maintain().await {
            Ok(()) => {
                let after = self.memory.usage();
                if after.page_count > before.page_count {
                    self.remediated_this_round = true;
                    let _ = tx
                        .send(AgentEvent::ContextCompacted {
                            tokens_before: before.resident_tokens,
                            tokens_after: after.resident_tokens,
                        })
                        .await;
                }
            }
            // Failed compaction leaves the buffer unchanged; it re-arms on
            // the next add above the high-water mark.
            Err(e) => warn!(error = %e, "scheduled compaction failed"),
        }
    }

    /// Tier auto-selection.  Skipped when a `model-change` marker pinned the
    /// model this round; a cross-provider move builds a new driver.
    fn select_driver(&mut self) {
        if self.runtime.model_explicitly_set {
            return;
        }
        let Some(sel) = self.ladder.select(self.runtime.thinking_budget) else {
            return;
        };
        let provider_changed = sel.provider != self.driver.name();
        if provider_changed {
            match (self.factory)(&sel.provider, &sel.model) {
                Ok(d) => {
                    debug!(provider = %sel.provider, model = %sel.model, "tier ladder switched driver");
                    self.driver = d;
                    self.runtime.active_model = Some(sel);
                }
                Err(e) => {
                    debug!(provider = %sel.provider, error = %e, "no driver for selected provider; keeping current");
                }
            }
        } else {
            self.runtime.active_model = Some(sel);
        }
    }

    async fn handle_violation(&mut self, tx: &mpsc::Sender<AgentEvent>, obs: &RoundObservation) {
        if let Some(v) = self.violations.observe_round(obs) {
            self.memory
                .add(Message::user(&v.message).with_source("violation"));
            let _ = tx
                .send(AgentEvent::ViolationDetected {
                    kind: v.kind,
                    number: v.number,
                })
                .await;
        }
    }

    /// One model call, streamed through the marker parser.
    async fn stream_one_round(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &mut oneshot::Receiver<()>,
        with_tools: bool,
    ) -> anyhow::Result<RoundOutput> {
        let req = ChatRequest {
            messages: self.memory.messages(),
            tools: if with_tools {
                self.tools.definitions()
            } else {
                Vec::new()
            },
            model: self.runtime.active_model.as_ref().map(|s| s.model.clone()),
            temperature: self.runtime.temperature.or(self.config.model.temperature),
            top_k: self.runtime.top_k.or(self.config.model.top_k),
            top_p: self.runtime.top_p.or(self.config.model.top_p),
            thinking_budget: Some(self.runtime.thinking_budget),
        };

        let mut stream = self
            .driver
            .chat(req)
            .await
            .map_err(|e| CoreError::Provider(e.to_string()))
            .context("model call failed")?;

        let clean_parts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let markers: Arc<Mutex<Vec<Marker>>> = Arc::new(Mutex::new(Vec::new()));
        let mut parser = {
            let cp = clean_parts.clone();
            let mk = markers.clone();
            MarkerParser::new(
                move |t| cp.lock().unwrap().push(t.to_string()),
                move |m| {
                    mk.lock().unwrap().push(m.clone());
                    Ok(())
                },
            )
        };

        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut aborted = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut *cancel => {
                    aborted = true;
                    break;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            let event = event.map_err(|e| CoreError::Provider(e.to_string()))?;
            match event {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    parser.feed(&delta);
                    let parts: Vec<String> = clean_parts.lock().unwrap().drain(..).collect();
                    for part in parts {
                        let _ = tx.send(AgentEvent::TextDelta(part)).await;
                    }
                    if parser.take_yield_request() {
                        tokio::task::yield_now().await;
                    }
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ThinkingDelta(delta) => {
                    let _ = tx.send(AgentEvent::ThinkingDelta(delta)).await;
                }
                ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let ptc = pending.entry(index).or_insert_with(PendingToolCall::default);
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                } => {
                    self.spend.record(&Usage {
                        input_tokens,
                        output_tokens,
                        cache_read_tokens,
                        cache_write_tokens,
                    });
                    let usage = self.memory.usage();
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: input_tokens,
                            output: output_tokens,
                            cache_read: cache_read_tokens,
                            cache_write: cache_write_tokens,
                            context_tokens: usage.resident_tokens,
                            working_budget: usage.working_budget,
                        })
                        .await;
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    warn!("model stream error: {e}");
                    let _ = tx.send(AgentEvent::Error(e)).await;
                }
            }
        }

        parser.flush();
        let parts: Vec<String> = clean_parts.lock().unwrap().drain(..).collect();
        for part in parts {
            let _ = tx.send(AgentEvent::TextDelta(part)).await;
        }
        let text = parser.clean_text().to_string();
        drop(parser);

        if !text.is_empty() {
            let _ = tx.send(AgentEvent::TextComplete(text.clone())).await;
        }

        // Flush accumulated parallel tool calls ordered by index.  Calls
        // with no name cannot be dispatched and are dropped; an empty id
        // gets a synthetic fallback so pairing stays intact.
        let mut tool_calls = Vec::new();
        let mut pending_sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        pending_sorted.sort_by_key(|(idx, _)| *idx);
        for (i, (_, ptc)) in pending_sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name");
                continue;
            }
            let mut tc = ptc.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
                warn!(tool = %tc.name, "tool call had empty id; generated synthetic id");
            }
            tool_calls.push(tc);
        }

        let marker_list = markers.lock().unwrap().clone();
        Ok(RoundOutput {
            text,
            markers: marker_list,
            tool_calls,
            aborted,
        })
    }

    // ── Marker dispatch ───────────────────────────────────────────────────────

    async fn apply_marker(&mut self, marker: &Marker) {
        let (name, arg) = match marker {
            Marker::Control { name, arg } => (name.as_str(), arg.as_deref()),
            Marker::Avatar { weights } => {
                debug!(?weights, "avatar weights observed");
                return;
            }
        };
        match name {
            "model-change" => self.marker_model_change(arg),
            "think" => {
                self.runtime.nudge_up();
                self.memory.set_thinking_budget(self.runtime.thinking_budget);
            }
            "relax" => {
                self.runtime.nudge_down();
                self.memory.set_thinking_budget(self.runtime.thinking_budget);
            }
            "thinking" => match arg.and_then(|a| a.parse::<f32>().ok()) {
                Some(x) => {
                    self.runtime.set_budget(x);
                    self.memory.set_thinking_budget(self.runtime.thinking_budget);
                }
                None => warn!("thinking marker needs a numeric argument"),
            },
            "ref" => self.marker_ref(arg),
            "unref" => {
                for id in split_ids(arg) {
                    if !self.memory.unref_page(&id) {
                        warn!(page = %id, "unref on unknown page");
                    }
                }
            }
            "pin" => {
                for id in split_ids(arg) {
                    self.memory.pin_page(&id);
                }
            }
            "unpin" => {
                for id in split_ids(arg) {
                    self.memory.unpin_page(&id);
                }
            }
            "pages" => {
                for meta in self.memory.list_pages() {
                    debug!(page = %meta.id, label = %meta.label, tokens = meta.token_count, "page");
                }
            }
            "grep" => {
                if let Some(pattern) = arg {
                    let hits = self.memory.grep_pages(pattern, &GrepOptions::default());
                    debug!(pattern, count = hits.len(), "page grep");
                }
            }
            "compact" => {
                let hints = CompactionHints {
                    aggressiveness: self.runtime.thinking_budget,
                    force: true,
                    ..Default::default()
                };
                match self.memory.compact_with_hints(hints).await {
                    Ok(paged) => {
                        self.remediated_this_round = true;
                        debug!(paged, "forced compaction");
                    }
                    Err(e) => warn!(error = %e, "forced compaction failed"),
                }
            }
            "importance" => {} // consumed when the assistant message is added
            "sleep" => {
                self.violations.set_sleeping(true);
                if !self.config.agent.persistent {
                    self.yield_requested = true;
                }
            }
            "listening" => self.violations.set_sleeping(true),
            "wake" => self.violations.set_sleeping(false),
            "max-context" => match arg.and_then(parse_token_size) {
                Some(tokens) => {
                    self.memory.set_working_budget(tokens);
                    self.remediated_this_round = true;
                    debug!(tokens, "working budget hot-reloaded");
                }
                None => warn!(?arg, "max-context needs a size argument"),
            },
            "memory" => {
                if let Some(kind) = arg {
                    self.swap_memory_mode(kind);
                }
            }
            "recall" => {
                if let Some(query) = arg {
                    let hits = self.memory.grep_pages(query, &GrepOptions::default());
                    for h in &hits {
                        debug!(page = %h.page_id, snippet = %h.snippet, "recall hit");
                    }
                }
            }
            "ctrl" => debug!(?arg, "ctrl marker"),
            "learn" => {
                if let Some(text) = arg {
                    self.memory.append_note(text);
                }
            }
            "temp" => self.runtime.temperature = arg.and_then(|a| a.parse().ok()),
            "top_k" => self.runtime.top_k = arg.and_then(|a| a.parse().ok()),
            "top_p" => self.runtime.top_p = arg.and_then(|a| a.parse().ok()),
            "view" => {
                if let Some(arg) = arg {
                    let mut parts = arg.splitn(2, ',').map(str::trim);
                    let channel = parts.next().unwrap_or_default();
                    let slot = parts.next().and_then(|s| s.parse::<usize>().ok());
                    match channel {
                        "off" => self.memory.view_off(slot),
                        "next" => self.memory.view_cycle(true),
                        "prev" => self.memory.view_cycle(false),
                        c => self.memory.view(c, slot),
                    }
                }
            }
            "sense" => {
                if let Some(arg) = arg {
                    let mut parts = arg.splitn(2, ',').map(str::trim);
                    let channel = parts.next().unwrap_or_default();
                    let on = parts.next().map(|s| s.eq_ignore_ascii_case("on"));
                    self.memory.sense(channel, on);
                }
            }
            "resize" => {
                if let Some(arg) = arg {
                    let parts: Vec<&str> = arg.split(',').map(str::trim).collect();
                    if let [channel, w, h] = parts.as_slice() {
                        if let (Ok(w), Ok(h)) = (w.parse(), h.parse()) {
                            self.memory.resize(channel, w, h);
                        }
                    }
                }
            }
            "export" => {
                if let Some(sink) = &self.snapshot_sink {
                    if let Err(e) = sink.send_snapshot(&self.warm_state()).await {
                        warn!(error = %e, "export snapshot failed");
                    }
                }
            }
            "reboot" => {
                self.reboot_requested = true;
            }
            other => debug!(marker = other, ?arg, "marker without handler"),
        }
    }

    fn marker_model_change(&mut self, arg: Option<&str>) {
        let Some(name) = arg else {
            warn!("model-change needs a model name");
            return;
        };
        let Some(entry) = catalog::resolve_alias(name) else {
            warn!(model = name, "model-change: unknown model or alias");
            return;
        };
        if entry.provider != self.driver.name() {
            match (self.factory)(&entry.provider, &entry.id) {
                Ok(d) => self.driver = d,
                Err(e) => {
                    warn!(provider = %entry.provider, error = %e, "model-change: cannot build driver");
                    return;
                }
            }
        }
        self.runtime.set_model(Selection {
            provider: entry.provider,
            model: entry.id,
            tier: entry.tier,
        });
    }

    /// `ref('pg-…')` loads pages; `ref('?query')` is a semantic lookup that
    /// only reports matches and never auto-loads.
    fn marker_ref(&mut self, arg: Option<&str>) {
        let Some(arg) = arg else {
            warn!("ref needs a page id or ?query");
            return;
        };
        if let Some(query) = arg.strip_prefix('?') {
            let hits = self.memory.grep_pages(query, &GrepOptions::default());
            for h in &hits {
                debug!(page = %h.page_id, matches = h.match_count, loaded = h.loaded, "ref search hit");
            }
            return;
        }
        for id in split_ids(Some(arg)) {
            if !self.memory.ref_page(&id) {
                warn!(page = %id, "ref on unknown page");
            }
        }
    }

    fn swap_memory_mode(&mut self, kind: &str) {
        let Ok(mode) = kind.parse::<MemoryMode>() else {
            warn!(%kind, "unknown memory mode");
            return;
        };
        if mode == self.memory_mode {
            return;
        }
        let Some(factory) = &self.memory_factory else {
            warn!("no memory factory registered; cannot hot-swap memory");
            return;
        };
        let new_inner = factory(mode);
        let old = self.memory.swap_inner(new_inner);
        self.memory.replace_messages(old.export_messages());
        if let Some(ps) = old.page_state() {
            self.memory.restore_page_state(ps);
        }
        self.memory_mode = mode;
        debug!(%mode, "memory implementation swapped");
    }

    async fn autosave(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        let meta = serde_json::json!({
            "round": self.runtime.round,
            "spend": self.spend.state(),
            "violations": self.violations.total(),
        });
        if let Err(e) = self
            .session_store
            .save(&self.session_id, &self.memory.export_messages(), &meta)
        {
            // session_error: logged, never aborts a running turn.
            warn!(error = %e, "session save failed");
            let _ = tx
                .send(AgentEvent::Error(format!("session save failed: {e}")))
                .await;
        }
        if let Err(e) = self
            .session_store
            .save_sensory_state(&self.session_id, &self.memory.state())
        {
            warn!(error = %e, "sensory state save failed");
        }
        if let Some(sink) = &self.snapshot_sink {
            if let Err(e) = sink.send_snapshot(&self.warm_state()).await {
                debug!(error = %e, "warm snapshot send failed (best effort)");
            }
        }
    }
}

fn push_text(accumulated: &mut String, text: &str) {
    if !accumulated.is_empty() {
        accumulated.push('\n');
    }
    accumulated.push_str(text);
}

fn split_ids(arg: Option<&str>) -> Vec<String> {
    arg.map(|a| {
        a.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Parse `max-context` sizes: plain token counts plus `k`/`m` suffixes.
fn parse_token_size(arg: &str) -> Option<usize> {
    let arg = arg.trim().to_ascii_lowercase();
    if let Some(n) = arg.strip_suffix('k') {
        return n.trim().parse::<f64>().ok().map(|v| (v * 1_000.0) as usize);
    }
    if let Some(n) = arg.strip_suffix('m') {
        return n
            .trim()
            .parse::<f64>()
            .ok()
            .map(|v| (v * 1_000_000.0) as usize);
    }
    arg.parse().ok()
}

/// Walk every string in a tool-argument object, strip markers out of them,
/// and return what was found.
fn scan_args_for_markers(value: &mut Value) -> Vec<Marker> {
    let mut found = Vec::new();
    scan_value(value, &mut found);
    found
}

fn scan_value(value: &mut Value, found: &mut Vec<Marker>) {
    match value {
        Value::String(s) => {
            if s.contains("@@") {
                let (clean, markers) = scan_text(s);
                if !markers.is_empty() {
                    *s = clean;
                    found.extend(markers);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_value(item, found);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                scan_value(v, found);
            }
        }
        _ => {}
    }
}

/// Deterministic head/tail truncation of oversized tool results, with an
/// explicit omission notice so the model knows content is missing.
fn truncate_tool_result(content: &str, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = (cap_tokens as f32 * skald_memory::estimate::DEFAULT_AVG_CHARS_PER_TOKEN) as usize;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len() - cap_chars;
    let lines: Vec<&str> = content.lines().collect();
    let half = cap_chars / 2;

    let mut head = String::with_capacity(half);
    let mut head_count = 0usize;
    for line in &lines {
        let needed = line.len() + 1;
        if head.len() + needed > half {
            break;
        }
        head.push_str(line);
        head.push('\n');
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev() {
        let needed = line.len() + 1;
        if tail_chars + needed > half {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let omitted_lines = lines.len().saturating_sub(head_count + tail_lines.len());
    format!(
        "{head}[... {omitted_lines} lines / {omitted_bytes} bytes omitted ...]\n{}",
        tail_lines.join("\n")
    )
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve the accumulated argument buffer to a JSON object.  Malformed
    /// JSON gets one repair attempt (invalid escapes, truncated braces);
    /// beyond that the args collapse to `{}` per the driver contract.
    fn finish(self) -> ToolCall {
        let args = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match attempt_json_repair(&self.args_buf) {
                    Some(v) => {
                        warn!(tool = %self.name, "repaired invalid JSON arguments from model");
                        v
                    }
                    None => {
                        warn!(
                            tool = %self.name,
                            error = %parse_err,
                            "tool call arguments unparseable; substituting {{}}"
                        );
                        Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            args,
        }
    }
}

/// Fix the malformed-JSON patterns models actually produce in tool-call
/// arguments: stray backslashes inside string values (Windows paths, regex
/// fragments) and output truncated before its closing quote/brace.
fn attempt_json_repair(json_str: &str) -> Option<Value> {
    let fixed = escape_stray_backslashes(json_str);
    if let Ok(v) = serde_json::from_str(&fixed) {
        return Some(v);
    }
    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed;
        if completed.chars().filter(|&c| c == '"').count() % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str(&completed) {
            return Some(v);
        }
    }
    None
}

/// Double every backslash inside a string value that does not begin a legal
/// JSON escape, so `"C:\projects"` survives as `"C:\\projects"`.
fn escape_stray_backslashes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut in_string = false;
    let mut pending_escape = false;
    for c in raw.chars() {
        if pending_escape {
            pending_escape = false;
            if !matches!(c, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') {
                out.push('\\');
            }
            out.push('\\');
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => pending_escape = true,
            '"' => {
                in_string = !in_string;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    // A buffer cut off mid-escape keeps its lone backslash; the truncation
    // completion above deals with the rest.
    if pending_escape {
        out.push('\\');
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
