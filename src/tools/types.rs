//! Tool types for Hearthmind
//!
//! This module defines the core types for tool calling: the model-issued
//! `ToolCall`, its parsed form, the capability inventory it is validated
//! against, and the `ActionHandler` trait the local action layer
//! implements.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A tool call issued by the model.
///
/// Parsed exactly once into a [`ParsedAction`]; after that it is either
/// executed or rejected, never both, and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique identifier for this call, echoed back in the result
    pub id: String,
    /// Tool name in `domain_action` form (e.g. `light_turn_on`)
    pub name: String,
    /// Raw JSON-encoded arguments exactly as the model produced them
    pub raw_arguments: String,
}

impl ToolCall {
    /// Create a new tool call.
    pub fn new(id: &str, name: &str, raw_arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            raw_arguments: raw_arguments.to_string(),
        }
    }
}

/// A tool call after parsing: the local action it maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAction {
    /// Action domain (e.g. `light`)
    pub domain: String,
    /// Action name within the domain (e.g. `turn_on`)
    pub action: String,
    /// Targets the action applies to (e.g. `light.kitchen`)
    pub targets: Vec<String>,
    /// Remaining structured parameters
    pub parameters: Map<String, Value>,
}

/// Why a tool call was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Arguments were empty or not valid JSON, or the name was not in
    /// `domain_action` form
    ParseError(String),
    /// Domain is not on the allow-list
    DomainNotAllowed(String),
    /// Action is on the deny-list (destructive or irreversible)
    ActionDenied(String),
    /// A named target does not exist or is not exposed
    UnknownTarget(String),
    /// The process-wide call budget for the current window is spent
    RateLimited,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::ParseError(detail) => write!(f, "parse error: {}", detail),
            RejectReason::DomainNotAllowed(domain) => {
                write!(f, "domain '{}' is not allowed", domain)
            }
            RejectReason::ActionDenied(action) => {
                write!(f, "action '{}' is denied", action)
            }
            RejectReason::UnknownTarget(target) => {
                write!(f, "target '{}' does not exist or is not exposed", target)
            }
            RejectReason::RateLimited => write!(f, "rate limited"),
        }
    }
}

/// Outcome of validating one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(ParsedAction),
    Rejected(RejectReason),
}

impl Verdict {
    /// Whether the call passed validation.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// Status of an executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
}

/// Result of one local action execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub detail: String,
}

impl ActionOutcome {
    /// Successful outcome.
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            detail: detail.into(),
        }
    }

    /// Failed outcome.
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error,
            detail: detail.into(),
        }
    }

    /// Structured JSON payload for the tool-result message. A JSON
    /// object is more robust for the model to interpret than prose.
    pub fn to_payload(&self, action: &ParsedAction) -> String {
        serde_json::json!({
            "action": format!("{}.{}", action.domain, action.action),
            "status": self.status,
            "targets": action.targets,
            "detail": self.detail,
        })
        .to_string()
    }
}

/// The local action layer.
///
/// Calls are assumed idempotent-unsafe: the orchestrator never retries an
/// executed action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute one validated action and describe what happened.
    async fn execute(&self, action: &ParsedAction) -> Result<ActionOutcome>;
}

/// Definition of a tool as declared to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    /// Unique tool name in `domain_action` form
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

/// One domain's slice of the live capability inventory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainCapabilities {
    /// Action name to description
    pub actions: BTreeMap<String, String>,
    /// Exposed target ids (e.g. `light.kitchen`)
    pub targets: BTreeSet<String>,
}

/// Snapshot of the local capability inventory at the start of a turn.
///
/// Supplied by the caller on every turn; the core never queries the host
/// platform itself. Ordered maps keep schema builds deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySnapshot {
    pub domains: BTreeMap<String, DomainCapabilities>,
}

impl CapabilitySnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action to a domain.
    pub fn with_action(mut self, domain: &str, action: &str, description: &str) -> Self {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .actions
            .insert(action.to_string(), description.to_string());
        self
    }

    /// Expose a target under its domain.
    pub fn with_target(mut self, domain: &str, target: &str) -> Self {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .targets
            .insert(target.to_string());
        self
    }

    /// Whether a target id exists and is exposed anywhere in the
    /// inventory.
    pub fn target_exposed(&self, target: &str) -> bool {
        self.domains.values().any(|d| d.targets.contains(target))
    }

    /// Whether a domain declares the given action.
    pub fn has_action(&self, domain: &str, action: &str) -> bool {
        self.domains
            .get(domain)
            .map(|d| d.actions.contains_key(action))
            .unwrap_or(false)
    }

    /// Total number of declared actions across all domains.
    pub fn action_count(&self) -> usize {
        self.domains.values().map(|d| d.actions.len()).sum()
    }
}
