//! Error types for Hearthmind
//!
//! This module defines all error types used throughout the crate.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use thiserror::Error;

/// The primary error type for Hearthmind operations.
///
/// The taxonomy distinguishes errors that self-heal inside the
/// orchestration loop (parse failures, rejected tool calls, rate limits)
/// from errors that degrade to a partial answer (timeouts, iteration
/// limits) and the two conditions that must reach the operator
/// ([`AgentError::WindowTooSmall`] and an exhausted
/// [`AgentError::Protocol`]).
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration errors (invalid values, missing required fields)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed tool arguments or malformed stream frame.
    /// Recovered locally, never fatal.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Tool call rejected by the registry. Surfaced to the model as a
    /// structured tool result so it can self-correct.
    #[error("Tool call rejected: {0}")]
    Validation(String),

    /// Process-wide tool-call rate limit exceeded. Same treatment as
    /// [`AgentError::Validation`].
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Endpoint rejected the request shape. Triggers the fallback chain;
    /// fatal only after every shape/parameter combination was tried.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The configured window cannot hold the mandatory context.
    /// Operator-visible configuration error, never retried.
    #[error("Conversation window too small: {required} tokens required, budget is {max}")]
    WindowTooSmall { required: u32, max: u32 },

    /// Per-call or per-run timeout. Run-level timeouts terminate the loop
    /// and return the best partial answer.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The orchestration loop hit its iteration bound without a final
    /// answer. The caller still receives the last partial text.
    #[error("Maximum tool iterations ({0}) exceeded")]
    MaxIterationsExceeded(u32),

    /// Action layer failures (the local service call itself failed)
    #[error("Action error: {0}")]
    Action(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AgentError {
    /// Returns `true` if this error should be converted into a structured
    /// tool result and fed back to the model rather than aborting the run.
    pub fn feeds_back_to_model(&self) -> bool {
        matches!(
            self,
            AgentError::Parse(_) | AgentError::Validation(_) | AgentError::RateLimited(_)
        )
    }

    /// Returns `true` if this error must be reported to the operator
    /// instead of degrading to a partial answer.
    pub fn is_operator_visible(&self) -> bool {
        matches!(
            self,
            AgentError::WindowTooSmall { .. } | AgentError::Protocol(_) | AgentError::Config(_)
        )
    }
}

/// A specialized `Result` type for Hearthmind operations.
pub type Result<T> = std::result::Result<T, AgentError>;
