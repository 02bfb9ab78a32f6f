// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Loop-level tests driving [`TurnLoop`] against scripted mock drivers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use skald_config::Config;
use skald_memory::{
    AgentMemory, PageStore, SensoryMemory, StaticSummarizer, StatusBoard, VirtualMemory,
};
use skald_model::{
    MessageContent, ResponseEvent, Role, ScriptedMockDriver,
};

use crate::{
    AgentEvent, CoreError, NullSessionStore, Tool, ToolRegistry, TurnLoop,
};

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its arguments"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }
    async fn call(&self, args: serde_json::Value) -> anyhow::Result<String> {
        Ok(format!("echo:{args}"))
    }
}

struct FailTool;

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }
    async fn call(&self, _args: serde_json::Value) -> anyhow::Result<String> {
        anyhow::bail!("nope")
    }
}

fn test_config(persistent: bool) -> Arc<Config> {
    let mut c = Config::default();
    c.model.providers = vec!["mock".into()];
    c.memory.working_memory_tokens = 4_000;
    c.agent.persistent = persistent;
    c.agent.max_rounds = 8;
    c.agent.retry_base_ms = 1;
    c.agent.auto_save_interval = 100;
    Arc::new(c)
}

fn turn_loop(driver: ScriptedMockDriver, config: Arc<Config>) -> TurnLoop {
    let board = StatusBoard::default();
    let vm = VirtualMemory::new(
        config.memory.clone(),
        PageStore::new(),
        Arc::new(StaticSummarizer("condensed history".into())),
    );
    let memory = SensoryMemory::new(Box::new(vm), &config.sensory, board.clone());
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(FailTool);
    TurnLoop::new(
        config,
        memory,
        Arc::new(driver),
        skald_model::default_factory(),
        Arc::new(tools),
        Arc::new(NullSessionStore),
        board,
    )
}

fn channel() -> (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>) {
    mpsc::channel(512)
}

fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

// ── Basic loop behavior ───────────────────────────────────────────────────────

#[tokio::test]
async fn text_only_round_ends_the_turn() {
    let driver = ScriptedMockDriver::always_text("all done");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, mut rx) = channel();
    let text = agent.submit("hello", tx).await.unwrap();
    assert_eq!(text, "all done");
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::TurnComplete)));
}

#[tokio::test]
async fn tool_round_feeds_result_back_and_finishes() {
    let driver =
        ScriptedMockDriver::tool_then_text("c1", "echo", r#"{"word":"hi"}"#, "finished");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, mut rx) = channel();
    let text = agent.submit("use the tool", tx).await.unwrap();
    assert_eq!(text, "finished");

    let msgs = agent.memory().messages();
    let call = msgs
        .iter()
        .find(|m| matches!(m.content, MessageContent::ToolCall { .. }))
        .expect("tool call recorded");
    let result = msgs
        .iter()
        .find(|m| matches!(m.content, MessageContent::ToolResult { .. }))
        .expect("tool result recorded");
    assert_eq!(call.tool_call_id(), result.tool_call_id());
    match &result.content {
        MessageContent::ToolResult { content, .. } => assert!(content.contains("echo:")),
        _ => unreachable!(),
    }

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolCallFinished { is_error: false, .. })));
}

#[tokio::test]
async fn system_prompt_and_sensory_block_reach_the_driver() {
    let driver = ScriptedMockDriver::always_text("ok");
    let requests = driver.requests.clone();
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("hello", tx).await.unwrap();

    let reqs = requests.lock().unwrap();
    let first = &reqs[0];
    assert_eq!(first.messages[0].role, Role::System);
    assert!(first
        .messages
        .iter()
        .any(|m| m.source.as_deref() == Some("SensoryMemory")));
}

#[tokio::test]
async fn unknown_tool_becomes_error_result_not_abort() {
    let driver =
        ScriptedMockDriver::tool_then_text("c1", "missing_tool", "{}", "recovered");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, mut rx) = channel();
    let text = agent.submit("go", tx).await.unwrap();
    assert_eq!(text, "recovered", "tool_error must not abort the turn");
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolCallFinished { is_error: true, .. })));
}

#[tokio::test]
async fn tool_failure_round_applies_backoff_and_recovers() {
    let driver = ScriptedMockDriver::new(vec![
        ScriptedMockDriver::tool_call_script("c1", "fail", "{}"),
        ScriptedMockDriver::text_script("done anyway"),
    ]);
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    let text = agent.submit("go", tx).await.unwrap();
    assert_eq!(text, "done anyway");
    assert_eq!(
        agent.runtime().consecutive_failed_rounds,
        0,
        "success resets the failure streak"
    );
}

// ── Markers ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn think_marker_raises_the_lever() {
    let driver = ScriptedMockDriver::new(vec![ScriptedMockDriver::chunked_script(&[
        "working on it @@th", "ink@@",
    ])]);
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    let text = agent.submit("hard problem", tx).await.unwrap();
    assert_eq!(text, "working on it 🤔");
    assert!((agent.runtime().thinking_budget - 0.8).abs() < 1e-5);
}

#[tokio::test]
async fn thinking_budget_decays_over_tool_rounds() {
    let driver = ScriptedMockDriver::new(vec![
        vec![
            ResponseEvent::TextDelta("@@thinking(0.8)@@".into()),
            ResponseEvent::ToolCall {
                index: 0,
                id: "c1".into(),
                name: "echo".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::Done,
        ],
        ScriptedMockDriver::tool_call_script("c2", "echo", "{}"),
        ScriptedMockDriver::tool_call_script("c3", "echo", "{}"),
        ScriptedMockDriver::tool_call_script("c4", "echo", "{}"),
        ScriptedMockDriver::text_script("done"),
    ]);
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("go", tx).await.unwrap();
    // 0.8 held one round, then three decay steps toward 0.5.
    let budget = agent.runtime().thinking_budget;
    assert!(budget < 0.7 && budget > 0.5, "got {budget}");
}

#[tokio::test]
async fn model_change_marker_pins_the_model() {
    let driver = ScriptedMockDriver::always_text("switching @@model-change('mock-high')@@");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("go", tx).await.unwrap();
    assert_eq!(
        agent.runtime().active_model.as_ref().map(|s| s.model.as_str()),
        Some("mock-high")
    );
}

#[tokio::test]
async fn importance_marker_tags_the_assistant_message() {
    let driver = ScriptedMockDriver::always_text("key decision @@importance(0.9)@@ made");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("decide", tx).await.unwrap();
    let msgs = agent.memory().messages();
    let tagged = msgs
        .iter()
        .find(|m| m.importance.is_some())
        .expect("assistant message tagged");
    assert_eq!(tagged.importance, Some(0.9));
    assert!(tagged.as_text().unwrap().contains("key decision ⭐ made"));
}

#[tokio::test]
async fn markers_in_tool_args_are_stripped_and_dispatched() {
    let driver = ScriptedMockDriver::new(vec![
        ScriptedMockDriver::tool_call_script(
            "c1",
            "echo",
            r#"{"note":"do it @@think@@ now"}"#,
        ),
        ScriptedMockDriver::text_script("ok"),
    ]);
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("go", tx).await.unwrap();
    assert!(
        agent.runtime().thinking_budget > 0.5,
        "marker inside tool args must dispatch"
    );
    let msgs = agent.memory().messages();
    let call = msgs
        .iter()
        .find(|m| matches!(m.content, MessageContent::ToolCall { .. }))
        .unwrap();
    match &call.content {
        MessageContent::ToolCall { function, .. } => {
            assert!(!function.arguments.contains("@@"), "marker must be stripped");
            assert!(function.arguments.contains("🤔"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn max_context_marker_hot_reloads_the_budget() {
    let driver = ScriptedMockDriver::always_text("@@max-context(2k)@@ resized");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("go", tx).await.unwrap();
    assert_eq!(agent.memory().usage().working_budget, 2_000);
}

#[tokio::test]
async fn learn_marker_writes_a_self_note() {
    let driver = ScriptedMockDriver::always_text("@@learn('the port is 8443')@@ noted");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("go", tx).await.unwrap();
    assert!(agent.memory().state().notes.contains("8443"));
}

// ── Persistent mode ───────────────────────────────────────────────────────────

#[tokio::test]
async fn persistent_mode_nudges_idle_model() {
    let driver = ScriptedMockDriver::new(vec![
        ScriptedMockDriver::text_script("just chatting"),
        ScriptedMockDriver::tool_call_script("c1", "echo", "{}"),
        ScriptedMockDriver::text_script("ok done"),
    ]);
    let mut agent = turn_loop(driver, test_config(true));
    let (tx, mut rx) = channel();
    agent.submit("work forever", tx).await.unwrap();
    let events = drain(&mut rx);
    assert!(
        events.iter().any(|e| matches!(e, AgentEvent::IdleNudge { .. })),
        "text-only round in persistent mode must nudge"
    );
}

#[tokio::test]
async fn three_text_only_rounds_inject_plain_text_violation() {
    let driver = ScriptedMockDriver::new(vec![
        ScriptedMockDriver::text_script("chatter one"),
        ScriptedMockDriver::text_script("chatter two"),
        ScriptedMockDriver::text_script("chatter three"),
        ScriptedMockDriver::text_script("chatter four"),
    ]);
    let mut agent = turn_loop(driver, test_config(true));
    let (tx, mut rx) = channel();
    agent.submit("work", tx).await.unwrap();

    let msgs = agent.memory().messages();
    let violation = msgs
        .iter()
        .find(|m| m.source.as_deref() == Some("violation"))
        .expect("violation message injected");
    assert_eq!(violation.role, Role::User);
    let text = violation.as_text().unwrap();
    assert!(text.contains("VIOLATION #"), "got: {text}");
    assert!(text.contains("plain_text"));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ViolationDetected { .. })));
}

#[tokio::test]
async fn sleep_marker_suppresses_nudging() {
    let driver = ScriptedMockDriver::new(vec![ScriptedMockDriver::text_script(
        "going quiet @@sleep@@",
    )]);
    let mut agent = turn_loop(driver, test_config(true));
    let (tx, mut rx) = channel();
    agent.submit("wait for mail", tx).await.unwrap();
    assert!(agent.violations().sleeping());
    let events = drain(&mut rx);
    assert!(
        !events.iter().any(|e| matches!(e, AgentEvent::IdleNudge { .. })),
        "sleeping agent must not be nudged"
    );
}

// ── Round cap ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn round_cap_forces_a_final_toolless_summary() {
    let mut config = Config::default();
    config.model.providers = vec!["mock".into()];
    config.agent.max_rounds = 2;
    config.agent.retry_base_ms = 1;
    let scripts = vec![
        ScriptedMockDriver::tool_call_script("c1", "echo", "{}"),
        ScriptedMockDriver::tool_call_script("c2", "echo", "{}"),
        ScriptedMockDriver::text_script("summary of progress"),
    ];
    let driver = ScriptedMockDriver::new(scripts);
    let requests = driver.requests.clone();
    let mut agent = turn_loop(driver, Arc::new(config));
    let (tx, _rx) = channel();
    let text = agent.submit("dig forever", tx).await.unwrap();
    assert!(text.contains("summary of progress"));

    let reqs = requests.lock().unwrap();
    let last = reqs.last().unwrap();
    assert!(last.tools.is_empty(), "wrap-up call must offer no tools");
    let wrap_note: String = last
        .messages
        .iter()
        .filter_map(|m| m.as_text())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(wrap_note.contains("Maximum tool rounds reached"));
}

// ── Abort ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pre_fired_cancel_aborts_immediately() {
    // A dropped sender counts as an abort signal, same as an explicit send.
    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
    drop(cancel_tx);

    let driver = ScriptedMockDriver::always_text("should not matter");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, mut rx) = channel();
    let text = agent
        .submit_with_cancel("go", tx, cancel_rx)
        .await
        .unwrap();
    assert!(text.is_empty(), "no model output may be produced");

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, AgentEvent::Aborted { .. })));
    let msgs = agent.memory().messages();
    assert!(msgs
        .iter()
        .any(|m| m.as_text().map(|t| t.contains("aborted")).unwrap_or(false)));
}

// ── Spend ceiling ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn spend_ceiling_aborts_the_turn_as_fatal() {
    let mut config = Config::default();
    config.model.providers = vec!["mock".into()];
    config.agent.spend_ceiling_tokens = Some(5);
    let driver = ScriptedMockDriver::always_text("burns ten tokens");
    let mut agent = turn_loop(driver, Arc::new(config));
    let (tx, _rx) = channel();
    let err = agent.submit("go", tx).await.unwrap_err();
    let core = err.downcast_ref::<CoreError>().expect("typed error");
    assert!(matches!(core, CoreError::BudgetExceeded { .. }));
    assert!(core.is_fatal());
}

// ── Warm state ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn warm_state_restores_an_equivalent_loop() {
    let driver = ScriptedMockDriver::new(vec![
        ScriptedMockDriver::tool_call_script("c1", "echo", r#"{"step":1}"#),
        ScriptedMockDriver::text_script("checkpoint @@learn('resume point')@@ reached"),
    ]);
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("do work", tx).await.unwrap();

    let state = agent.warm_state();
    let json = serde_json::to_string(&state).unwrap();
    let delivered: crate::WarmState = serde_json::from_str(&json).unwrap();

    let driver2 = ScriptedMockDriver::new(vec![]);
    let mut restored = turn_loop(driver2, test_config(false));
    restored.restore_warm_state(delivered).unwrap();

    assert_eq!(restored.memory().messages(), agent.memory().messages());
    assert_eq!(restored.memory().page_state(), agent.memory().page_state());
    assert_eq!(restored.memory().state(), agent.memory().state());
    assert_eq!(restored.spend().state(), agent.spend().state());
    assert_eq!(restored.session_id(), agent.session_id());
    assert_eq!(
        restored.runtime().thinking_budget,
        agent.runtime().thinking_budget
    );
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let driver = ScriptedMockDriver::always_text("x");
    let mut agent = turn_loop(driver, test_config(false));
    let mut state = agent.warm_state();
    state.version += 1;
    assert!(agent.restore_warm_state(state).is_err());
}

// ── Reboot marker ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn reboot_marker_requests_reload() {
    let driver = ScriptedMockDriver::always_text("restarting @@reboot@@");
    let mut agent = turn_loop(driver, test_config(false));
    let (tx, _rx) = channel();
    agent.submit("reboot yourself", tx).await.unwrap();
    assert!(agent.take_reboot_request());
    assert!(!agent.take_reboot_request(), "request is consumed");
}
