// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use skald_model::Usage;

use crate::error::CoreError;

/// Session-wide token accounting with an optional hard ceiling.
///
/// The accounted figure is raw tokens scaled by the violation penalty
/// factor, so degenerate behavior eats the budget faster.
#[derive(Debug, Clone, Default)]
pub struct SpendMeter {
    state: SpendState,
    ceiling: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpendState {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub model_calls: u64,
}

impl SpendMeter {
    pub fn new(ceiling: Option<u64>) -> Self {
        Self {
            state: SpendState::default(),
            ceiling,
        }
    }

    pub fn record(&mut self, usage: &Usage) {
        self.state.input_tokens += usage.input_tokens as u64;
        self.state.output_tokens += usage.output_tokens as u64;
        self.state.cache_read_tokens += usage.cache_read_tokens as u64;
        self.state.cache_write_tokens += usage.cache_write_tokens as u64;
        self.state.model_calls += 1;
    }

    /// Raw tokens scaled by the penalty factor.
    pub fn accounted(&self, penalty_factor: f32) -> u64 {
        let raw = self.state.input_tokens + self.state.output_tokens;
        (raw as f64 * penalty_factor as f64).round() as u64
    }

    /// `budget_exceeded` is the only error class that aborts a turn
    /// immediately; everything else recovers locally.
    pub fn check_ceiling(&self, penalty_factor: f32) -> Result<(), CoreError> {
        if let Some(ceiling) = self.ceiling {
            let spent = self.accounted(penalty_factor);
            if spent > ceiling {
                return Err(CoreError::BudgetExceeded { spent, ceiling });
            }
        }
        Ok(())
    }

    pub fn state(&self) -> &SpendState {
        &self.state
    }

    pub fn restore(&mut self, state: SpendState) {
        self.state = state;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
