// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thinking-tier ladder: maps the `[0,1]` thinking-budget lever to a model.
//!
//! The ladder is the only place where the budget knob touches model
//! selection.  A marker-set explicit model suspends auto-selection for the
//! round it was set in; the ladder resumes on the next round.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog;

/// Model capability tier.  Ordered: `Low < Mid < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Mid,
    High,
}

impl Tier {
    pub fn rank(self) -> u8 {
        match self {
            Tier::Low => 0,
            Tier::Mid => 1,
            Tier::High => 2,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Low => write!(f, "low"),
            Tier::Mid => write!(f, "mid"),
            Tier::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Tier::Low),
            "mid" | "medium" => Ok(Tier::Mid),
            "high" => Ok(Tier::High),
            other => anyhow::bail!("unknown tier: {other}"),
        }
    }
}

/// Budget→tier thresholds.  Providers can override; the defaults match the
/// runtime's standard ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    /// Budgets below this resolve to [`Tier::Low`].
    pub low_below: f32,
    /// Budgets below this (and at or above `low_below`) resolve to [`Tier::Mid`].
    pub mid_below: f32,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            low_below: 0.25,
            mid_below: 0.65,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, budget: f32) -> Tier {
        if budget < self.low_below {
            Tier::Low
        } else if budget < self.mid_below {
            Tier::Mid
        } else {
            Tier::High
        }
    }
}

/// A resolved model selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub provider: String,
    pub model: String,
    pub tier: Tier,
}

/// The cross-provider tier ladder.
///
/// `select` walks the preferred provider list and picks the first provider
/// serving a model at the target tier; when no provider serves that tier it
/// steps the tier down until one does.
#[derive(Debug, Clone)]
pub struct TierLadder {
    providers: Vec<String>,
    thresholds: TierThresholds,
    /// Hard cap from `--max-tier` / `SKALD_MAX_TIER`.
    max_tier: Option<Tier>,
    /// Floor from an explicit `--model`: auto-selection may promote above it
    /// but never demote below it.
    floor: Option<Selection>,
}

impl TierLadder {
    pub fn new(providers: Vec<String>) -> Self {
        Self {
            providers,
            thresholds: TierThresholds::default(),
            max_tier: None,
            floor: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: TierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_max_tier(mut self, cap: Option<Tier>) -> Self {
        self.max_tier = cap;
        self
    }

    /// Set the floor model from an explicit CLI selection.  When the floor's
    /// tier exceeds the `max_tier` cap, the cap wins: the floor is clamped
    /// down and a warning is logged.
    pub fn with_floor(mut self, provider: &str, model: &str) -> Self {
        let tier = catalog::lookup(provider, model)
            .map(|e| e.tier)
            .unwrap_or(Tier::Mid);
        let tier = match self.max_tier {
            Some(cap) if tier > cap => {
                warn!(%model, floor_tier = %tier, cap = %cap, "floor model exceeds max-tier cap; clamping");
                cap
            }
            _ => tier,
        };
        self.floor = Some(Selection {
            provider: provider.to_string(),
            model: model.to_string(),
            tier,
        });
        self
    }

    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    /// Resolve the thinking budget to a concrete model.
    ///
    /// Returns `None` only when the provider list is empty or no provider
    /// serves any tier at or below the target.
    pub fn select(&self, budget: f32) -> Option<Selection> {
        let mut tier = self.thresholds.tier_for(budget.clamp(0.0, 1.0));
        if let Some(cap) = self.max_tier {
            tier = tier.min(cap);
        }
        if let Some(floor) = &self.floor {
            if tier < floor.tier {
                tier = floor.tier;
            }
            // At exactly the floor tier the explicit model wins over the
            // ladder's provider walk.
            if tier == floor.tier {
                return Some(floor.clone());
            }
        }
        self.first_at_or_below(tier)
    }

    fn first_at_or_below(&self, target: Tier) -> Option<Selection> {
        let mut tier = target;
        loop {
            for p in &self.providers {
                if let Some(entry) = catalog::model_at(p, tier) {
                    return Some(Selection {
                        provider: p.clone(),
                        model: entry.id,
                        tier,
                    });
                }
            }
            tier = match tier {
                Tier::High => Tier::Mid,
                Tier::Mid => Tier::Low,
                Tier::Low => return None,
            };
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> TierLadder {
        TierLadder::new(vec!["mock".into()])
    }

    // ── Thresholds ────────────────────────────────────────────────────────────

    #[test]
    fn default_thresholds_partition_the_lever() {
        let t = TierThresholds::default();
        assert_eq!(t.tier_for(0.0), Tier::Low);
        assert_eq!(t.tier_for(0.24), Tier::Low);
        assert_eq!(t.tier_for(0.25), Tier::Mid);
        assert_eq!(t.tier_for(0.64), Tier::Mid);
        assert_eq!(t.tier_for(0.65), Tier::High);
        assert_eq!(t.tier_for(1.0), Tier::High);
    }

    #[test]
    fn tier_for_is_monotonic() {
        let t = TierThresholds::default();
        let mut prev = t.tier_for(0.0);
        let mut b = 0.0f32;
        while b <= 1.0 {
            let cur = t.tier_for(b);
            assert!(cur >= prev, "tier must not decrease as budget grows");
            prev = cur;
            b += 0.01;
        }
    }

    // ── Selection ─────────────────────────────────────────────────────────────

    #[test]
    fn select_maps_budget_to_mock_models() {
        let l = ladder();
        assert_eq!(l.select(0.1).unwrap().model, "mock-low");
        assert_eq!(l.select(0.5).unwrap().model, "mock-mid");
        assert_eq!(l.select(0.9).unwrap().model, "mock-high");
    }

    #[test]
    fn max_tier_cap_clamps_selection() {
        let l = ladder().with_max_tier(Some(Tier::Mid));
        let s = l.select(0.95).unwrap();
        assert_eq!(s.tier, Tier::Mid);
        assert!(s.tier.rank() <= Tier::Mid.rank());
    }

    #[test]
    fn floor_prevents_demotion() {
        let l = ladder().with_floor("mock", "mock-mid");
        let s = l.select(0.05).unwrap();
        assert_eq!(s.model, "mock-mid", "lever must not demote below the floor");
    }

    #[test]
    fn floor_allows_promotion() {
        let l = ladder().with_floor("mock", "mock-mid");
        let s = l.select(0.9).unwrap();
        assert_eq!(s.model, "mock-high", "lever may promote above the floor");
    }

    #[test]
    fn cap_wins_over_floor() {
        let l = ladder()
            .with_max_tier(Some(Tier::Low))
            .with_floor("mock", "mock-high");
        let s = l.select(0.9).unwrap();
        assert_eq!(s.tier, Tier::Low, "max-tier cap beats the CLI floor");
    }

    #[test]
    fn provider_walk_prefers_earlier_provider() {
        let l = TierLadder::new(vec!["anthropic".into(), "mock".into()]);
        let s = l.select(0.5).unwrap();
        assert_eq!(s.provider, "anthropic");
    }

    #[test]
    fn empty_provider_list_selects_nothing() {
        let l = TierLadder::new(vec![]);
        assert!(l.select(0.5).is_none());
    }

    #[test]
    fn unknown_provider_is_skipped() {
        let l = TierLadder::new(vec!["nope".into(), "mock".into()]);
        assert_eq!(l.select(0.5).unwrap().provider, "mock");
    }

    #[test]
    fn selection_is_monotonic_in_budget() {
        let l = ladder();
        let mut prev = l.select(0.0).unwrap().tier;
        let mut b = 0.0f32;
        while b <= 1.0 {
            let cur = l.select(b).unwrap().tier;
            assert!(cur >= prev);
            prev = cur;
            b += 0.05;
        }
    }
}
