//! Configuration type definitions for Hearthmind
//!
//! This module defines all configuration structs consumed by the core.
//! All types implement serde traits for JSON serialization and have
//! defaults matching the recommended values of the upstream integration.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Main configuration struct for Hearthmind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Conversation window configuration
    pub window: WindowConfig,
    /// Tool registry, validation, and execution configuration
    pub tools: ToolsConfig,
    /// Orchestration loop configuration
    pub orchestrator: OrchestratorConfig,
    /// LLM endpoint configuration
    pub endpoint: EndpointConfig,
}

// ============================================================================
// Window Configuration
// ============================================================================

/// Conversation window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Token budget for a single conversation window.
    pub max_tokens: u32,
    /// Never evict system messages while non-system messages remain.
    pub preserve_system: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            preserve_system: true,
        }
    }
}

// ============================================================================
// Tools Configuration
// ============================================================================

/// Tool registry and execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Domains the model is allowed to act on. Empty means
    /// every non-denied domain is allowed.
    pub allowed_domains: Vec<String>,
    /// Extra action names denied in addition to the built-in deny list.
    pub denied_actions: Vec<String>,
    /// Process-wide tool-call rate limit (sliding one-minute window).
    pub max_calls_per_minute: u32,
    /// Dispatch all calls of one model turn concurrently instead of
    /// sequentially.
    pub parallel_execution: bool,
    /// Per-call execution timeout in seconds.
    pub call_timeout_secs: u64,
    /// Schema cache time-to-live in seconds.
    pub schema_cache_ttl_secs: u64,
}

impl ToolsConfig {
    /// Default safe domain allow-list.
    pub fn default_allowed_domains() -> Vec<String> {
        [
            "light",
            "switch",
            "climate",
            "cover",
            "fan",
            "media_player",
            "lock",
            "vacuum",
            "water_heater",
            "humidifier",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Self::default_allowed_domains(),
            denied_actions: Vec::new(),
            max_calls_per_minute: 30,
            parallel_execution: false,
            call_timeout_secs: 10,
            schema_cache_ttl_secs: 300,
        }
    }
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

/// Orchestration loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum model/tool round trips per user turn.
    pub max_iterations: u32,
    /// Overall run deadline in seconds. Exceeding it returns the best
    /// partial answer.
    pub run_timeout_secs: u64,
    /// Enable the early-continuation path.
    pub early_continuation: bool,
    /// Seconds to wait for a final answer before replying with an
    /// interim result and detaching the run.
    pub early_deadline_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            run_timeout_secs: 120,
            early_continuation: true,
            early_deadline_secs: 5,
        }
    }
}

// ============================================================================
// Endpoint Configuration
// ============================================================================

/// Which request field carries the maximum-output-size limit.
///
/// Deployments disagree: older chat surfaces want `max_tokens`, newer ones
/// reject it in favor of `max_completion_tokens`. Sending the wrong one is
/// a hard 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenParam {
    MaxTokens,
    MaxCompletionTokens,
}

impl TokenParam {
    /// Wire name of the field.
    pub fn field_name(&self) -> &'static str {
        match self {
            TokenParam::MaxTokens => "max_tokens",
            TokenParam::MaxCompletionTokens => "max_completion_tokens",
        }
    }

    /// The other field, for the one-shot retry after a rejection.
    pub fn alternate(&self) -> TokenParam {
        match self {
            TokenParam::MaxTokens => TokenParam::MaxCompletionTokens,
            TokenParam::MaxCompletionTokens => TokenParam::MaxTokens,
        }
    }
}

/// Role used to encode tool-execution results in the conversation.
///
/// Some model families reject the dedicated tool role; for those the
/// results are re-encoded as user messages (compatibility shim).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultRole {
    #[default]
    Tool,
    User,
}

/// LLM endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of the endpoint (e.g. `https://resource.example.com`).
    pub api_base: String,
    /// API credential sent in the `api-key` header.
    pub api_key: String,
    /// Model or deployment name.
    pub model: String,
    /// API version query parameter (e.g. `2024-06-01`).
    pub api_version: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum output tokens requested per call.
    pub max_output_tokens: u32,
    /// Per-call network timeout in seconds.
    pub timeout_secs: u64,
    /// Explicit token-parameter override. When unset, inferred from
    /// `api_version`.
    pub token_param: Option<TokenParam>,
    /// Role used for tool results, per endpoint quirks.
    pub tool_result_role: ToolResultRole,
}

impl EndpointConfig {
    /// Resolve the token parameter: explicit override wins, otherwise
    /// infer from the API version (2025-01-01 and later surfaces want
    /// `max_completion_tokens`).
    pub fn resolve_token_param(&self) -> TokenParam {
        if let Some(param) = self.token_param {
            return param;
        }
        if let Some(date) = parse_version_date(&self.api_version) {
            if date >= (2025, 1, 1) {
                return TokenParam::MaxCompletionTokens;
            }
        }
        TokenParam::MaxTokens
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            api_version: "2024-06-01".to_string(),
            temperature: 0.7,
            max_output_tokens: 512,
            timeout_secs: 30,
            token_param: None,
            tool_result_role: ToolResultRole::default(),
        }
    }
}

/// Parse the leading `YYYY-MM-DD` of an API version string.
fn parse_version_date(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.splitn(4, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    Some((year, month, day))
}

// ============================================================================
// Validation
// ============================================================================

impl Config {
    /// Validate the configuration, failing fast with a descriptive error.
    ///
    /// This catches structural problems only; whether the window can fit
    /// the system prompt plus tool schemas is checked at runtime when
    /// those sizes are known.
    pub fn validate(&self) -> Result<()> {
        if self.window.max_tokens == 0 {
            return Err(AgentError::Config(
                "window.max_tokens must be greater than zero".into(),
            ));
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(AgentError::Config(
                "orchestrator.max_iterations must be greater than zero".into(),
            ));
        }
        if self.tools.max_calls_per_minute == 0 {
            return Err(AgentError::Config(
                "tools.max_calls_per_minute must be greater than zero".into(),
            ));
        }
        if self.orchestrator.early_continuation && self.orchestrator.early_deadline_secs == 0 {
            return Err(AgentError::Config(
                "orchestrator.early_deadline_secs must be greater than zero when early continuation is enabled".into(),
            ));
        }
        if self.endpoint.timeout_secs == 0 {
            return Err(AgentError::Config(
                "endpoint.timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
