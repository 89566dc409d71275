//! Process-scoped usage metrics.
//!
//! Lock-free counters shared across orchestration runs. The struct is
//! created once per [`crate::agent::ConversationAgent`] and handed out as
//! an `Arc`; it is never an implicit global.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Lock-free per-process usage counters.
#[derive(Debug)]
pub struct UsageMetrics {
    /// Total user turns processed.
    pub turns: AtomicU64,
    /// Total tool calls dispatched to the action layer.
    pub tool_calls: AtomicU64,
    /// Tool calls rejected by validation (including rate limits).
    pub rejected_calls: AtomicU64,
    /// Total prompt tokens sent to the endpoint.
    pub prompt_tokens: AtomicU64,
    /// Total completion tokens received from the endpoint.
    pub completion_tokens: AtomicU64,
    /// Interim replies produced by the continuation scheduler.
    pub interim_replies: AtomicU64,
    /// Total errors encountered.
    pub errors: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub turns: u64,
    pub tool_calls: u64,
    pub rejected_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub interim_replies: u64,
    pub errors: u64,
}

impl UsageMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            turns: AtomicU64::new(0),
            tool_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            interim_replies: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Increment the turn counter.
    pub fn record_turn(&self) {
        self.turns.fetch_add(1, Ordering::Relaxed);
    }

    /// Add dispatched tool calls.
    pub fn record_tool_calls(&self, count: u64) {
        self.tool_calls.fetch_add(count, Ordering::Relaxed);
    }

    /// Increment the rejected-call counter.
    pub fn record_rejected_call(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record token usage from a model reply.
    pub fn record_tokens(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(completion, Ordering::Relaxed);
    }

    /// Increment the interim-reply counter.
    pub fn record_interim(&self) {
        self.interim_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the error counter.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            turns: self.turns.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            interim_replies: self.interim_replies.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.turns.store(0, Ordering::Relaxed);
        self.tool_calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);
        self.interim_replies.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    /// Emit current counters as a structured log line.
    pub fn emit_usage(&self, reason: &str) {
        let snap = self.snapshot();
        info!(
            event = "usage_summary",
            reason = reason,
            turns = snap.turns,
            tool_calls = snap.tool_calls,
            rejected_calls = snap.rejected_calls,
            prompt_tokens = snap.prompt_tokens,
            completion_tokens = snap.completion_tokens,
            interim_replies = snap.interim_replies,
            errors = snap.errors,
            "Usage metrics"
        );
    }
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::new()
    }
}
