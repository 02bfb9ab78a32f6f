// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::violations::ViolationKind;

/// Events emitted by the turn loop during a single user turn.
/// Consumers (CLI front-end, tests) subscribe to these to drive output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A clean text chunk (markers already extracted, glyphs substituted)
    TextDelta(String),
    /// The round's complete clean text
    TextComplete(String),
    /// A reasoning chunk from the model
    ThinkingDelta(String),
    /// The model has requested a tool call
    ToolCallStarted { call_id: String, name: String },
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
        duration_ms: u64,
    },
    /// A control marker was recognized in the stream
    MarkerDispatched { name: String },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// Token usage after one model call
    TokenUsage {
        input: u32,
        output: u32,
        cache_read: u32,
        cache_write: u32,
        context_tokens: usize,
        working_budget: usize,
    },
    /// A degenerate-behavior violation was injected
    ViolationDetected { kind: ViolationKind, number: u32 },
    /// Persistent mode nudged an idle model to continue
    IdleNudge { count: u32 },
    /// The in-flight model call was aborted by the user
    Aborted { partial_text: String },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// A recoverable error occurred
    Error(String),
}
