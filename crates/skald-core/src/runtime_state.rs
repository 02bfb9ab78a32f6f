// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use skald_model::Selection;

/// Fraction of the distance to the resting point (0.5) the thinking budget
/// travels per round without an explicit think/relax marker.
const DECAY_RATE: f32 = 0.2;

/// Step applied by the bare `think` / `relax` markers.
const NUDGE_STEP: f32 = 0.3;

/// Per-turn mutable knobs.  Written by marker dispatch, read by the turn
/// loop before each model call, snapshotted into warm state.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    /// Model pinned by a `model-change` marker or tier selection.
    pub active_model: Option<Selection>,
    pub thinking_budget: f32,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub round: u32,
    pub idle_nudges: u32,
    pub consecutive_failed_rounds: u32,
    /// Latched by `model-change` for the current round only: tier
    /// auto-selection must not override an explicit choice within the round
    /// it was made.
    pub model_explicitly_set: bool,
    budget_explicit_this_round: bool,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            active_model: None,
            thinking_budget: 0.5,
            temperature: None,
            top_k: None,
            top_p: None,
            round: 0,
            idle_nudges: 0,
            consecutive_failed_rounds: 0,
            model_explicitly_set: false,
            budget_explicit_this_round: false,
        }
    }
}

impl RuntimeState {
    /// Round boundary: bump the counter, release the explicit-model latch,
    /// and decay the thinking budget toward its resting point unless a
    /// think/relax/thinking marker touched it last round.
    pub fn begin_round(&mut self) {
        self.round += 1;
        self.model_explicitly_set = false;
        if !self.budget_explicit_this_round {
            self.thinking_budget += (0.5 - self.thinking_budget) * DECAY_RATE;
        }
        self.budget_explicit_this_round = false;
    }

    /// `think` marker.
    pub fn nudge_up(&mut self) {
        self.thinking_budget = (self.thinking_budget + NUDGE_STEP).clamp(0.0, 1.0);
        self.budget_explicit_this_round = true;
    }

    /// `relax` marker.
    pub fn nudge_down(&mut self) {
        self.thinking_budget = (self.thinking_budget - NUDGE_STEP).clamp(0.0, 1.0);
        self.budget_explicit_this_round = true;
    }

    /// `thinking(x)` marker.
    pub fn set_budget(&mut self, budget: f32) {
        self.thinking_budget = budget.clamp(0.0, 1.0);
        self.budget_explicit_this_round = true;
    }

    /// `model-change` marker.
    pub fn set_model(&mut self, selection: Selection) {
        self.active_model = Some(selection);
        self.model_explicitly_set = true;
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            active_provider: self.active_model.as_ref().map(|s| s.provider.clone()),
            active_model: self.active_model.as_ref().map(|s| s.model.clone()),
            thinking_budget: self.thinking_budget,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            round: self.round,
            idle_nudges: self.idle_nudges,
            consecutive_failed_rounds: self.consecutive_failed_rounds,
        }
    }

    pub fn restore(&mut self, snap: &RuntimeSnapshot) {
        self.active_model = match (&snap.active_provider, &snap.active_model) {
            (Some(p), Some(m)) => skald_model::catalog::lookup(p, m).map(|e| Selection {
                provider: p.clone(),
                model: m.clone(),
                tier: e.tier,
            }),
            _ => None,
        };
        self.thinking_budget = snap.thinking_budget.clamp(0.0, 1.0);
        self.temperature = snap.temperature;
        self.top_k = snap.top_k;
        self.top_p = snap.top_p;
        self.round = snap.round;
        self.idle_nudges = snap.idle_nudges;
        self.consecutive_failed_rounds = snap.consecutive_failed_rounds;
        self.model_explicitly_set = false;
        self.budget_explicit_this_round = false;
    }
}

/// Serializable projection of [`RuntimeState`] for warm snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSnapshot {
    pub active_provider: Option<String>,
    pub active_model: Option<String>,
    pub thinking_budget: f32,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub round: u32,
    pub idle_nudges: u32,
    pub consecutive_failed_rounds: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
