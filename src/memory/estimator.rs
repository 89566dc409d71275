//! Token cost estimation.
//!
//! The estimator is a pure leaf: given text it returns an integer cost in
//! model tokens. Counts are heuristic (roughly four characters per token
//! plus a fixed per-message framing overhead), matching the fallback the
//! upstream integration used when no exact tokenizer was available. Costs
//! are computed once at append time and cached on the message, so the
//! heuristic only has to be consistent, not exact.

use serde::Serialize;

/// Characters per token for the default estimation model.
const CHARS_PER_TOKEN: f32 = 4.0;

/// Fixed framing overhead added per message (role markers, separators).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Heuristic token estimator.
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: f32,
}

impl TokenEstimator {
    /// Create an estimator with the default characters-per-token ratio.
    pub fn new() -> Self {
        Self {
            chars_per_token: CHARS_PER_TOKEN,
        }
    }

    /// Estimate the cost of raw text with no framing overhead.
    pub fn text_cost(&self, text: &str) -> u32 {
        (text.chars().count() as f32 / self.chars_per_token) as u32
    }

    /// Estimate the cost of one conversation message (content plus the
    /// per-message framing overhead).
    pub fn message_cost(&self, content: &str) -> u32 {
        self.text_cost(content) + MESSAGE_OVERHEAD_TOKENS
    }

    /// Estimate the cost of a set of tool schemas as they appear on the
    /// wire (serialized JSON).
    ///
    /// Falls back to zero for unserializable input rather than failing;
    /// schema types in this crate always serialize.
    pub fn schema_cost<T: Serialize>(&self, schemas: &[T]) -> u32 {
        match serde_json::to_string(schemas) {
            Ok(json) => self.text_cost(&json),
            Err(_) => 0,
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}
