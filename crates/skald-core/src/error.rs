// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Error taxonomy for the turn loop.
///
/// Recovery policy: `Tool` and `Session` recover locally (captured into tool
/// results / logged warnings) and never abort a running turn; `Provider` and
/// `BudgetExceeded` surface to the turn caller; `Config` aborts startup only.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("spend ceiling exceeded: {spent} accounted tokens over ceiling {ceiling}")]
    BudgetExceeded { spent: u64, ceiling: u64 },
}

impl CoreError {
    /// True when the turn caller should treat the error as fatal for the
    /// whole process (supervisor decides on restart).
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::BudgetExceeded { .. } | CoreError::Config(_))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_is_fatal() {
        assert!(CoreError::BudgetExceeded { spent: 10, ceiling: 5 }.is_fatal());
    }

    #[test]
    fn tool_errors_are_not_fatal() {
        assert!(!CoreError::Tool("boom".into()).is_fatal());
        assert!(!CoreError::Session("disk full".into()).is_fatal());
        assert!(!CoreError::Provider("503".into()).is_fatal());
    }

    #[test]
    fn display_includes_class() {
        let e = CoreError::BudgetExceeded { spent: 101, ceiling: 100 };
        assert!(e.to_string().contains("101"));
        assert!(e.to_string().contains("100"));
    }
}
