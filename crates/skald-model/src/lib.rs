// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod tier;
mod driver;
mod mock;
mod types;

pub use driver::{ChatDriver, ResponseStream};
pub use mock::{FailingMockDriver, MockDriver, ScriptedMockDriver};
pub use tier::{Selection, Tier, TierLadder, TierThresholds};
pub use types::*;

use std::sync::Arc;

/// Constructor for drivers, used by the turn loop when a `model-change`
/// marker switches to a different provider mid-session.
///
/// The factory owns credential handling and transport construction; the core
/// only hands it `(provider, model)` pairs.
pub type DriverFactory =
    Arc<dyn Fn(&str, &str) -> anyhow::Result<Arc<dyn ChatDriver>> + Send + Sync>;

/// Construct a driver for `(provider, model)`.
///
/// Concrete network transports are external collaborators; the bundled
/// implementations are the deterministic mocks.  Unknown providers are a
/// configuration error.
pub fn from_provider(provider: &str, model: &str) -> anyhow::Result<Arc<dyn ChatDriver>> {
    match provider {
        "mock" => Ok(Arc::new(MockDriver)),
        other => anyhow::bail!(
            "no bundled driver for provider '{other}' (model '{model}'); \
             register a ChatDriver implementation via the driver factory"
        ),
    }
}

/// The default driver factory: resolves against [`from_provider`].
pub fn default_factory() -> DriverFactory {
    Arc::new(|provider, model| from_provider(provider, model))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
