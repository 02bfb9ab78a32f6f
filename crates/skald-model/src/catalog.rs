// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models, keyed by provider and tier.

use serde::{Deserialize, Serialize};

use crate::tier::Tier;

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "claude-sonnet-4-5")
    pub id: String,
    /// Provider identifier: "anthropic" | "openai" | "mock"
    pub provider: String,
    /// Capability tier this model serves in the thinking ladder.
    pub tier: Tier,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Short names accepted by the `model-change` marker.
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let json = include_str!("../models.json");
    let catalog: CatalogFile =
        serde_json::from_str(json).expect("bundled models.json must be valid");
    catalog.models
}

/// Look up a single model by provider and id (or alias).
pub fn lookup(provider: &str, model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && (e.id == model_id || e.aliases.iter().any(|a| a == model_id)))
}

/// Resolve a bare model name or alias (no provider prefix) to a catalog entry.
///
/// Used by the `model-change` marker: the model refers to models by short
/// alias ("sonnet") or full id.  Returns the first match.
pub fn resolve_alias(name: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.id == name || e.aliases.iter().any(|a| a == name))
}

/// The model a provider serves at `tier`, if any.
pub fn model_at(provider: &str, tier: Tier) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && e.tier == tier)
}

/// Context window for a model, falling back to `default` when unknown.
pub fn context_window(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id)
        .map(|e| e.context_window)
        .unwrap_or(default)
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
