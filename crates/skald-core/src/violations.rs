// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Detection of degenerate agent behavior in persistent mode.
//!
//! Each detection injects a corrective message into the conversation and
//! emits a machine-parseable `VIOLATION:` line on stderr for external
//! supervisors.  Sleep mode (declared via the `sleep` marker) suppresses the
//! idle and same-tool checks until any non-listen tool use wakes the agent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Consecutive text-only rounds before a plain-text violation.
const PLAIN_TEXT_THRESHOLD: u32 = 3;

/// Consecutive over-pressure rounds (without remediation) before a
/// context-pressure violation.
const PRESSURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    PlainText,
    Idle,
    SameToolLoop,
    ContextPressure,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::PlainText => "plain_text",
            ViolationKind::Idle => "idle",
            ViolationKind::SameToolLoop => "same_tool_loop",
            ViolationKind::ContextPressure => "context_pressure",
        }
    }
}

/// A detected violation, ready for injection.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Running count across all kinds (the `#` in the injected message).
    pub number: u32,
    pub message: String,
}

/// What the tracker needs to know about one completed round.
#[derive(Debug, Clone, Default)]
pub struct RoundObservation {
    pub had_tool_calls: bool,
    pub tool_names: Vec<String>,
    /// Every tool used this round was listen-only.
    pub listen_only: bool,
    /// Buffer usage over the working budget at round end.
    pub usage_fraction: f32,
    /// A compaction ran or a `max-context` marker was applied this round.
    pub remediated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ViolationState {
    pub counts: HashMap<ViolationKind, u32>,
    pub total: u32,
    pub sleeping: bool,
}

pub struct ViolationTracker {
    persistent: bool,
    idle_threshold: u32,
    same_tool_threshold: u32,
    pressure_ratio: f32,
    consecutive_plain_text: u32,
    consecutive_idle: u32,
    consecutive_same_tool: u32,
    consecutive_pressure: u32,
    last_tool_signature: Option<String>,
    state: ViolationState,
}

impl ViolationTracker {
    pub fn new(persistent: bool, idle_threshold: u32, same_tool_threshold: u32) -> Self {
        Self {
            persistent,
            idle_threshold,
            same_tool_threshold,
            pressure_ratio: 0.9,
            consecutive_plain_text: 0,
            consecutive_idle: 0,
            consecutive_same_tool: 0,
            consecutive_pressure: 0,
            last_tool_signature: None,
            state: ViolationState::default(),
        }
    }

    /// `sleep` / `listening` markers.
    pub fn set_sleeping(&mut self, sleeping: bool) {
        self.state.sleeping = sleeping;
        if sleeping {
            self.consecutive_idle = 0;
            self.consecutive_same_tool = 0;
        }
    }

    pub fn sleeping(&self) -> bool {
        self.state.sleeping
    }

    pub fn total(&self) -> u32 {
        self.state.total
    }

    /// Spend multiplier: each violation makes the session 10% costlier.
    pub fn penalty_factor(&self) -> f32 {
        1.0 + 0.1 * self.state.total as f32
    }

    /// Update counters with one round's behavior; returns at most one
    /// violation (highest-priority first).
    pub fn observe_round(&mut self, obs: &RoundObservation) -> Option<Violation> {
        if !self.persistent {
            return None;
        }

        // Any non-listen tool use wakes a sleeping agent.
        if self.state.sleeping && obs.had_tool_calls && !obs.listen_only {
            self.state.sleeping = false;
        }

        if obs.had_tool_calls {
            self.consecutive_plain_text = 0;
        } else {
            self.consecutive_plain_text += 1;
        }

        if obs.had_tool_calls && obs.listen_only {
            self.consecutive_idle += 1;
        } else if obs.had_tool_calls {
            self.consecutive_idle = 0;
        }

        let signature = match obs.tool_names.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        };
        if signature.is_some() && signature == self.last_tool_signature {
            self.consecutive_same_tool += 1;
        } else {
            self.consecutive_same_tool = if signature.is_some() { 1 } else { 0 };
        }
        self.last_tool_signature = signature;

        if obs.usage_fraction > self.pressure_ratio && !obs.remediated {
            self.consecutive_pressure += 1;
        } else {
            self.consecutive_pressure = 0;
        }

        if self.consecutive_plain_text >= PLAIN_TEXT_THRESHOLD {
            self.consecutive_plain_text = 0;
            return Some(self.fire(
                ViolationKind::PlainText,
                "you produced plain text without tool calls for three consecutive rounds; \
                 persistent mode requires acting through tools (or declare @@sleep@@)",
            ));
        }
        if !self.state.sleeping && self.consecutive_idle >= self.idle_threshold {
            self.consecutive_idle = 0;
            return Some(self.fire(
                ViolationKind::Idle,
                "you have only used listen-only tools for several rounds; make progress \
                 with a real action or declare @@sleep@@",
            ));
        }
        if !self.state.sleeping && self.consecutive_same_tool >= self.same_tool_threshold {
            self.consecutive_same_tool = 0;
            return Some(self.fire(
                ViolationKind::SameToolLoop,
                "you are calling the same single tool round after round; change approach \
                 or stop",
            ));
        }
        if self.consecutive_pressure >= PRESSURE_THRESHOLD {
            self.consecutive_pressure = 0;
            return Some(self.fire(
                ViolationKind::ContextPressure,
                "context usage has stayed above the high-water mark without remediation; \
                 compact with @@compact@@ or raise the budget with @@max-context(...)@@",
            ));
        }
        None
    }

    fn fire(&mut self, kind: ViolationKind, remedy: &str) -> Violation {
        self.state.total += 1;
        *self.state.counts.entry(kind).or_default() += 1;
        let number = self.state.total;
        // Stable stderr format for external supervisors.
        eprintln!("VIOLATION: {} #{number}", kind.as_str());
        warn!(kind = kind.as_str(), number, "violation detected");
        Violation {
            kind,
            number,
            message: format!("VIOLATION #{number} ({}): {remedy}", kind.as_str()),
        }
    }

    pub fn state(&self) -> &ViolationState {
        &self.state
    }

    pub fn restore(&mut self, state: ViolationState) {
        self.state = state;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ViolationTracker {
        ViolationTracker::new(true, 3, 3)
    }

    fn text_round() -> RoundObservation {
        RoundObservation::default()
    }

    fn tool_round(names: &[&str], listen_only: bool) -> RoundObservation {
        RoundObservation {
            had_tool_calls: true,
            tool_names: names.iter().map(|s| s.to_string()).collect(),
            listen_only,
            ..Default::default()
        }
    }

    // ── plain_text ────────────────────────────────────────────────────────────

    #[test]
    fn three_text_only_rounds_fire_plain_text() {
        let mut t = tracker();
        assert!(t.observe_round(&text_round()).is_none());
        assert!(t.observe_round(&text_round()).is_none());
        let v = t.observe_round(&text_round()).unwrap();
        assert_eq!(v.kind, ViolationKind::PlainText);
        assert_eq!(v.number, 1);
        assert!(v.message.contains("VIOLATION #1"));
        assert!(v.message.contains("plain_text"));
    }

    #[test]
    fn tool_use_resets_plain_text_counter() {
        let mut t = tracker();
        t.observe_round(&text_round());
        t.observe_round(&text_round());
        t.observe_round(&tool_round(&["shell"], false));
        assert!(t.observe_round(&text_round()).is_none());
        assert!(t.observe_round(&text_round()).is_none());
    }

    #[test]
    fn non_persistent_mode_never_fires() {
        let mut t = ViolationTracker::new(false, 3, 3);
        for _ in 0..10 {
            assert!(t.observe_round(&text_round()).is_none());
        }
    }

    // ── idle ──────────────────────────────────────────────────────────────────

    #[test]
    fn listen_only_rounds_fire_idle() {
        let mut t = tracker();
        t.observe_round(&tool_round(&["poll_inbox"], true));
        t.observe_round(&tool_round(&["poll_inbox"], true));
        let v = t.observe_round(&tool_round(&["check_time"], true)).unwrap();
        assert_eq!(v.kind, ViolationKind::Idle);
    }

    #[test]
    fn sleep_mode_suppresses_idle() {
        let mut t = tracker();
        t.set_sleeping(true);
        for _ in 0..10 {
            let v = t.observe_round(&tool_round(&["poll_inbox"], true));
            assert!(v.is_none(), "sleeping agent may idle freely");
        }
    }

    #[test]
    fn real_tool_use_wakes_the_agent() {
        let mut t = tracker();
        t.set_sleeping(true);
        t.observe_round(&tool_round(&["write_file"], false));
        assert!(!t.sleeping());
    }

    // ── same_tool_loop ────────────────────────────────────────────────────────

    #[test]
    fn identical_single_tool_rounds_fire_loop() {
        let mut t = tracker();
        t.observe_round(&tool_round(&["grep"], false));
        t.observe_round(&tool_round(&["grep"], false));
        let v = t.observe_round(&tool_round(&["grep"], false)).unwrap();
        assert_eq!(v.kind, ViolationKind::SameToolLoop);
    }

    #[test]
    fn different_tools_reset_loop_counter() {
        let mut t = tracker();
        t.observe_round(&tool_round(&["grep"], false));
        t.observe_round(&tool_round(&["shell"], false));
        t.observe_round(&tool_round(&["grep"], false));
        assert!(t.observe_round(&tool_round(&["shell"], false)).is_none());
    }

    #[test]
    fn multi_tool_rounds_do_not_count_as_loops() {
        let mut t = tracker();
        for _ in 0..10 {
            let v = t.observe_round(&tool_round(&["grep", "shell"], false));
            assert!(v.is_none());
        }
    }

    // ── context_pressure ──────────────────────────────────────────────────────

    #[test]
    fn sustained_pressure_without_remediation_fires() {
        let mut t = tracker();
        let obs = RoundObservation {
            had_tool_calls: true,
            tool_names: vec!["a".into()],
            usage_fraction: 0.97,
            ..Default::default()
        };
        let obs2 = RoundObservation {
            tool_names: vec!["b".into()],
            ..obs.clone()
        };
        t.observe_round(&obs);
        t.observe_round(&obs2);
        let v = t.observe_round(&obs).unwrap();
        assert_eq!(v.kind, ViolationKind::ContextPressure);
    }

    #[test]
    fn remediation_resets_pressure_counter() {
        let mut t = tracker();
        let pressured = RoundObservation {
            had_tool_calls: true,
            tool_names: vec!["a".into()],
            usage_fraction: 0.97,
            ..Default::default()
        };
        let remediated = RoundObservation {
            remediated: true,
            tool_names: vec!["b".into()],
            ..pressured.clone()
        };
        t.observe_round(&pressured);
        t.observe_round(&pressured);
        t.observe_round(&remediated);
        assert!(t.observe_round(&pressured).is_none());
    }

    // ── penalty ───────────────────────────────────────────────────────────────

    #[test]
    fn penalty_factor_grows_with_violations() {
        let mut t = tracker();
        assert_eq!(t.penalty_factor(), 1.0);
        for _ in 0..3 {
            t.observe_round(&text_round());
        }
        assert!((t.penalty_factor() - 1.1).abs() < 1e-6);
    }

    #[test]
    fn state_round_trips() {
        let mut t = tracker();
        for _ in 0..3 {
            t.observe_round(&text_round());
        }
        let state = t.state().clone();
        let mut t2 = tracker();
        t2.restore(state.clone());
        assert_eq!(t2.state(), &state);
        assert_eq!(t2.total(), 1);
    }
}
