// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub sensory: SensoryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

// ─── Model selection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Preferred provider order for cross-provider tier selection.
    /// Overridable at boot via `SKALD_PROVIDERS` (comma-separated).
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    /// Explicit model (id or catalog alias).  Sets the tier-ladder floor:
    /// the thinking lever may promote above it but never demote below it.
    #[serde(default)]
    pub name: Option<String>,
    /// Tier-ladder cap: "low" | "mid" | "high".  Overridable via
    /// `SKALD_MAX_TIER`.  The cap wins over the floor when they conflict.
    #[serde(default)]
    pub max_tier: Option<String>,
    /// Sampling temperature forwarded to drivers
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

fn default_providers() -> Vec<String> {
    vec!["anthropic".into(), "openai".into(), "mock".into()]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            name: None,
            max_tier: None,
            temperature: None,
            top_k: None,
            top_p: None,
        }
    }
}

// ─── Memory ───────────────────────────────────────────────────────────────────

/// Which memory implementation backs the conversation.
///
/// `Virtual` is the paging implementation; `Plain` keeps everything resident
/// and exists for debugging and as the hot-swap target of the `memory`
/// marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    Virtual,
    Plain,
}

impl std::fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryMode::Virtual => write!(f, "virtual"),
            MemoryMode::Plain => write!(f, "plain"),
        }
    }
}

impl std::str::FromStr for MemoryMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "virtual" => Ok(MemoryMode::Virtual),
            "plain" => Ok(MemoryMode::Plain),
            other => anyhow::bail!("unknown memory mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_mode")]
    pub mode: MemoryMode,
    /// Token ceiling for the non-page resident buffer.
    #[serde(default = "default_working_memory_tokens")]
    pub working_memory_tokens: usize,
    /// Token region reserved for currently-loaded pages.
    #[serde(default = "default_page_slot_tokens")]
    pub page_slot_tokens: usize,
    /// Allowance for system blocks above the working budget.
    #[serde(default = "default_system_overhead_tokens")]
    pub system_overhead_tokens: usize,
    /// Usage fraction of the working budget at which a background compaction
    /// is scheduled on `add`.
    #[serde(default = "default_high_water_ratio")]
    pub high_water_ratio: f32,
    /// Usage fraction at which `pre_tool_compact` fires before tool results
    /// arrive.
    #[serde(default = "default_pre_tool_threshold")]
    pub pre_tool_threshold: f32,
    /// Minimum messages preserved per non-empty lane across a compaction.
    #[serde(default = "default_min_recent_per_lane")]
    pub min_recent_per_lane: usize,
    /// Messages at or above this importance are exempt from eviction.
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f32,
    /// Average characters per token used by the estimator.
    #[serde(default = "default_avg_chars_per_token")]
    pub avg_chars_per_token: f32,
    /// Directory for persisted pages.  `None` keeps pages in memory only.
    #[serde(default)]
    pub page_dir: Option<String>,
}

fn default_memory_mode() -> MemoryMode {
    MemoryMode::Virtual
}
fn default_working_memory_tokens() -> usize {
    28_000
}
fn default_page_slot_tokens() -> usize {
    4_000
}
fn default_system_overhead_tokens() -> usize {
    2_000
}
fn default_high_water_ratio() -> f32 {
    0.95
}
fn default_pre_tool_threshold() -> f32 {
    0.80
}
fn default_min_recent_per_lane() -> usize {
    3
}
fn default_importance_threshold() -> f32 {
    0.8
}
fn default_avg_chars_per_token() -> f32 {
    2.8
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: default_memory_mode(),
            working_memory_tokens: default_working_memory_tokens(),
            page_slot_tokens: default_page_slot_tokens(),
            system_overhead_tokens: default_system_overhead_tokens(),
            high_water_ratio: default_high_water_ratio(),
            pre_tool_threshold: default_pre_tool_threshold(),
            min_recent_per_lane: default_min_recent_per_lane(),
            importance_threshold: default_importance_threshold(),
            avg_chars_per_token: default_avg_chars_per_token(),
            page_dir: None,
        }
    }
}

// ─── Sensory memory ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensoryConfig {
    /// Hard cap on the rendered sensory block, in tokens.
    #[serde(default = "default_sensory_budget_tokens")]
    pub budget_tokens: usize,
    /// Channel names bound to the three slots at startup.  Shorter lists
    /// leave trailing slots empty.
    #[serde(default = "default_slot_bindings")]
    pub slots: Vec<String>,
}

fn default_sensory_budget_tokens() -> usize {
    600
}
fn default_slot_bindings() -> Vec<String> {
    vec!["context".into(), "clock".into(), "notes".into()]
}

impl Default for SensoryConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_sensory_budget_tokens(),
            slots: default_slot_bindings(),
        }
    }
}

// ─── Turn loop ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model-call rounds per user input.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Persistent mode: after a text-only response, nudge the model to keep
    /// calling tools instead of ending the turn.
    #[serde(default)]
    pub persistent: bool,
    /// Maximum idle nudges per turn in persistent mode.
    #[serde(default = "default_max_idle_nudges")]
    pub max_idle_nudges: u32,
    /// Rounds between session saves and warm snapshots.
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval: u32,
    /// Base for exponential failure backoff, in milliseconds.  Overridable
    /// via `SKALD_RETRY_BASE_MS`.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Spend ceiling across the session, in accounted tokens.  `None`
    /// disables the cap.
    #[serde(default)]
    pub spend_ceiling_tokens: Option<u64>,
    /// Maximum tokens for a single tool result before deterministic
    /// head/tail truncation.  0 disables truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Consecutive listen-only rounds before an idle violation.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: u32,
    /// Consecutive identical single-tool rounds before a loop violation.
    #[serde(default = "default_same_tool_threshold")]
    pub same_tool_threshold: u32,
}

fn default_max_rounds() -> u32 {
    24
}
fn default_max_idle_nudges() -> u32 {
    3
}
fn default_auto_save_interval() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_tool_result_token_cap() -> usize {
    4_000
}
fn default_idle_threshold() -> u32 {
    5
}
fn default_same_tool_threshold() -> u32 {
    4
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            persistent: false,
            max_idle_nudges: default_max_idle_nudges(),
            auto_save_interval: default_auto_save_interval(),
            retry_base_ms: default_retry_base_ms(),
            spend_ceiling_tokens: None,
            tool_result_token_cap: default_tool_result_token_cap(),
            idle_threshold: default_idle_threshold(),
            same_tool_threshold: default_same_tool_threshold(),
        }
    }
}

// ─── Supervisor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a freshly started worker waits for `warm_state` before
    /// cold-starting, in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Grace period between `shutdown` and SIGKILL, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Total restart cap across the supervisor's lifetime.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Crash-loop guard: this many exits within `crash_window_ms` gives up.
    #[serde(default = "default_crash_exits")]
    pub crash_exits: u32,
    #[serde(default = "default_crash_window_ms")]
    pub crash_window_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    2_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_max_restarts() -> u32 {
    50
}
fn default_crash_exits() -> u32 {
    3
}
fn default_crash_window_ms() -> u64 {
    5_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_restarts: default_max_restarts(),
            crash_exits: default_crash_exits(),
            crash_window_ms: default_crash_window_ms(),
        }
    }
}

// ─── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session storage directory.  `None` resolves to the platform default
    /// (`~/.local/share/skald/sessions`).
    #[serde(default)]
    pub dir: Option<String>,
}

// ─── Environment overrides ────────────────────────────────────────────────────

/// Apply the boot-time environment overrides.  The core consumes only this
/// small set; everything else arrives via config.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("SKALD_RETRY_BASE_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            config.agent.retry_base_ms = ms;
        } else {
            tracing::warn!(value = %v, "SKALD_RETRY_BASE_MS is not an integer; ignored");
        }
    }
    if let Ok(v) = std::env::var("SKALD_MEMORY_MODE") {
        match v.parse::<MemoryMode>() {
            Ok(mode) => config.memory.mode = mode,
            Err(_) => tracing::warn!(value = %v, "SKALD_MEMORY_MODE not recognised; ignored"),
        }
    }
    if let Ok(v) = std::env::var("SKALD_MAX_TIER") {
        config.model.max_tier = Some(v);
    }
    if let Ok(v) = std::env::var("SKALD_PROVIDERS") {
        let list: Vec<String> = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !list.is_empty() {
            config.model.providers = list;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ─────────────────────────────────────────────────────────────

    #[test]
    fn default_memory_mode_is_virtual() {
        let c = Config::default();
        assert_eq!(c.memory.mode, MemoryMode::Virtual);
    }

    #[test]
    fn default_budgets_are_positive() {
        let c = Config::default();
        assert!(c.memory.working_memory_tokens > 0);
        assert!(c.memory.page_slot_tokens > 0);
        assert!(c.sensory.budget_tokens > 0);
    }

    #[test]
    fn default_high_water_above_pre_tool_threshold() {
        let c = Config::default();
        assert!(c.memory.high_water_ratio > c.memory.pre_tool_threshold);
    }

    #[test]
    fn default_sensory_slots_are_three() {
        let c = Config::default();
        assert_eq!(c.sensory.slots.len(), 3);
    }

    #[test]
    fn default_agent_not_persistent() {
        let c = Config::default();
        assert!(!c.agent.persistent);
        assert!(c.agent.max_rounds > 0);
    }

    #[test]
    fn default_supervisor_handshake_is_two_seconds() {
        let c = Config::default();
        assert_eq!(c.supervisor.handshake_timeout_ms, 2_000);
    }

    // ── YAML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn config_serialises_to_valid_yaml() {
        let c = Config::default();
        let yaml = serde_yaml::to_string(&c).unwrap();
        assert!(yaml.contains("working_memory_tokens"));
    }

    #[test]
    fn config_deserialises_from_partial_yaml() {
        let yaml = "memory:\n  working_memory_tokens: 500\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.memory.working_memory_tokens, 500);
        // untouched sections keep defaults
        assert_eq!(c.agent.max_rounds, AgentConfig::default().max_rounds);
    }

    #[test]
    fn memory_mode_yaml_round_trip() {
        let yaml = "memory:\n  mode: plain\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.memory.mode, MemoryMode::Plain);
        let back = serde_yaml::to_string(&c).unwrap();
        let c2: Config = serde_yaml::from_str(&back).unwrap();
        assert_eq!(c2.memory.mode, MemoryMode::Plain);
    }

    #[test]
    fn persistent_mode_parses_from_yaml() {
        let yaml = "agent:\n  persistent: true\n  max_rounds: 64\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(c.agent.persistent);
        assert_eq!(c.agent.max_rounds, 64);
    }

    // ── Env overrides ─────────────────────────────────────────────────────────

    #[test]
    fn env_override_retry_base() {
        let mut c = Config::default();
        std::env::set_var("SKALD_RETRY_BASE_MS", "250");
        apply_env_overrides(&mut c);
        std::env::remove_var("SKALD_RETRY_BASE_MS");
        assert_eq!(c.agent.retry_base_ms, 250);
    }

    #[test]
    fn env_override_providers_list() {
        let mut c = Config::default();
        std::env::set_var("SKALD_PROVIDERS", "mock, openai");
        apply_env_overrides(&mut c);
        std::env::remove_var("SKALD_PROVIDERS");
        assert_eq!(c.model.providers, vec!["mock", "openai"]);
    }

    #[test]
    fn env_override_bad_memory_mode_is_ignored() {
        let mut c = Config::default();
        std::env::set_var("SKALD_MEMORY_MODE", "quantum");
        apply_env_overrides(&mut c);
        std::env::remove_var("SKALD_MEMORY_MODE");
        assert_eq!(c.memory.mode, MemoryMode::Virtual);
    }
}
