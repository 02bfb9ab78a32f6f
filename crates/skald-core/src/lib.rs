// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent core: marker parsing, the turn loop, violation tracking,
//! runtime knobs, spend accounting, and warm-state capture.

mod error;
mod events;
pub mod markers;
pub mod parser;
mod runtime_state;
mod session_store;
mod spend;
mod tools;
mod turn;
mod violations;
pub mod warm;

#[cfg(test)]
mod tests;

pub use error::CoreError;
pub use events::AgentEvent;
pub use markers::Marker;
pub use parser::{scan_text, MarkerParser};
pub use runtime_state::{RuntimeSnapshot, RuntimeState};
pub use session_store::{JsonSessionStore, NullSessionStore, SessionMeta, SessionRecord, SessionStore};
pub use spend::{SpendMeter, SpendState};
pub use tools::{Tool, ToolCall, ToolOutput, ToolRegistry};
pub use turn::{MemoryFactory, TurnLoop};
pub use violations::{RoundObservation, Violation, ViolationKind, ViolationState, ViolationTracker};
pub use warm::{Awareness, SnapshotSink, WarmState, WARM_STATE_VERSION};
