// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Character-heuristic token estimation.
//!
//! Fast, deterministic, provider-independent; never calls out.  All budget
//! math in virtual memory runs on these estimates, so the only properties
//! that matter are monotonicity in content length and additivity across
//! message sets (modulo the per-message envelope overhead).

use skald_model::Message;

/// Cap on the characters a single message contributes.  Prevents one
/// pathological message from dominating every budget calculation.
pub const MAX_CONTENT_CHARS: usize = 24_000;

/// Flat per-message overhead for role/envelope framing, in characters.
pub const ENVELOPE_CHARS: usize = 32;

/// Default average characters per token.
pub const DEFAULT_AVG_CHARS_PER_TOKEN: f32 = 2.8;

#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    avg_chars_per_token: f32,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            avg_chars_per_token: DEFAULT_AVG_CHARS_PER_TOKEN,
        }
    }
}

impl TokenEstimator {
    pub fn new(avg_chars_per_token: f32) -> Self {
        // Guard against a zero/negative divisor from bad config.
        let avg = if avg_chars_per_token > 0.1 {
            avg_chars_per_token
        } else {
            DEFAULT_AVG_CHARS_PER_TOKEN
        };
        Self {
            avg_chars_per_token: avg,
        }
    }

    /// Estimated tokens for one message.
    pub fn message(&self, message: &Message) -> usize {
        let chars = message.content_chars().min(MAX_CONTENT_CHARS) + ENVELOPE_CHARS;
        (chars as f32 / self.avg_chars_per_token).ceil() as usize
    }

    /// Estimated tokens for a message set.  Additive: the sum of per-message
    /// estimates.
    pub fn estimate(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.message(m)).sum()
    }

    /// Estimated tokens for a raw string with envelope overhead.
    pub fn text(&self, text: &str) -> usize {
        let chars = text.len().min(MAX_CONTENT_CHARS) + ENVELOPE_CHARS;
        (chars as f32 / self.avg_chars_per_token).ceil() as usize
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use skald_model::Message;

    #[test]
    fn empty_message_costs_only_envelope() {
        let e = TokenEstimator::default();
        let expected = (ENVELOPE_CHARS as f32 / DEFAULT_AVG_CHARS_PER_TOKEN).ceil() as usize;
        assert_eq!(e.message(&Message::user("")), expected);
    }

    #[test]
    fn estimate_is_monotonic_in_content_length() {
        let e = TokenEstimator::default();
        let mut prev = 0;
        for len in [0usize, 1, 10, 100, 1_000, 10_000] {
            let m = Message::user("x".repeat(len));
            let t = e.message(&m);
            assert!(t >= prev, "longer content must never estimate lower");
            prev = t;
        }
    }

    #[test]
    fn estimate_is_additive_across_sets() {
        let e = TokenEstimator::default();
        let a = Message::user("first message");
        let b = Message::assistant("second message, somewhat longer");
        let c = Message::tool_result("id", "tool output here");
        let joint = e.estimate(&[a.clone(), b.clone(), c.clone()]);
        let split = e.estimate(&[a, b]) + e.estimate(&[c]);
        assert_eq!(joint, split);
    }

    #[test]
    fn single_message_blowup_is_capped() {
        let e = TokenEstimator::default();
        let capped = e.message(&Message::user("x".repeat(MAX_CONTENT_CHARS)));
        let oversize = e.message(&Message::user("x".repeat(MAX_CONTENT_CHARS * 10)));
        assert_eq!(capped, oversize, "content beyond the cap must not count");
    }

    #[test]
    fn custom_ratio_changes_scale() {
        let fine = TokenEstimator::new(1.0);
        let coarse = TokenEstimator::new(4.0);
        let m = Message::user("abcdefgh");
        assert!(fine.message(&m) > coarse.message(&m));
    }

    #[test]
    fn degenerate_ratio_falls_back_to_default() {
        let e = TokenEstimator::new(0.0);
        let d = TokenEstimator::default();
        let m = Message::user("hello");
        assert_eq!(e.message(&m), d.message(&m));
    }

    #[test]
    fn text_matches_equivalent_message() {
        let e = TokenEstimator::default();
        assert_eq!(e.text("hello world"), e.message(&Message::user("hello world")));
    }
}
