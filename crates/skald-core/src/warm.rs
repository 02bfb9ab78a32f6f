// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Warm state: the serialized snapshot that makes worker restarts lossless.
//!
//! A snapshot is a read-only traversal of owned state — capturing never
//! mutates the running core.  Snapshots round-trip through JSON across the
//! supervisor boundary; a version mismatch on the receiving side discards
//! the snapshot and cold-starts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skald_memory::{PageState, SensoryState};
use skald_model::Message;

use crate::runtime_state::RuntimeSnapshot;
use crate::spend::SpendState;
use crate::violations::ViolationState;

pub const WARM_STATE_VERSION: u32 = 3;

/// Everything a restarted worker needs to continue the conversation as if
/// nothing happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarmState {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// "virtual" | "plain"
    pub memory_type: String,
    /// Export projection: loaded pages collapsed to summary markers.
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_state: Option<PageState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensory_state: Option<SensoryState>,
    pub runtime: RuntimeSnapshot,
    pub spend: SpendState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<ViolationState>,
    pub familiarity: f32,
    pub deja_vu: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_send_target: Option<String>,
    #[serde(default)]
    pub mcp_configs: Vec<serde_json::Value>,
}

impl WarmState {
    /// A received snapshot is usable only when versions agree.
    pub fn version_matches(&self) -> bool {
        self.version == WARM_STATE_VERSION
    }
}

/// Soft self-trackers carried across restarts.  `familiarity` grows with
/// lifetime rounds; `deja_vu` rises on each warm restore and decays as the
/// session continues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Awareness {
    pub familiarity: f32,
    pub deja_vu: f32,
}

impl Default for Awareness {
    fn default() -> Self {
        Self {
            familiarity: 0.0,
            deja_vu: 0.0,
        }
    }
}

impl Awareness {
    pub fn on_round(&mut self) {
        self.familiarity = (self.familiarity + 0.01).min(1.0);
        self.deja_vu *= 0.9;
    }

    pub fn on_warm_restore(&mut self) {
        self.deja_vu = (self.deja_vu + 0.5).min(1.0);
    }
}

/// Where the worker pushes snapshots.  The supervisor crate provides the
/// socket-backed implementation; tests use an in-memory sink.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Best-effort periodic snapshot (turn boundaries).
    async fn send_snapshot(&self, state: &WarmState) -> anyhow::Result<()>;
    /// Snapshot accompanying a deliberate reboot (exit code 75 follows).
    async fn request_reload(&self, state: &WarmState) -> anyhow::Result<()>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
