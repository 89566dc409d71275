//! Tool call validation.
//!
//! Every model-issued call passes through a short-circuiting pipeline
//! before anything executes: argument parse, domain allow-list, action
//! deny-list, target existence, then the process-wide rate limit. A
//! rejection is never fatal; it becomes a structured tool result the
//! model can react to.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::types::{CapabilitySnapshot, ParsedAction, RejectReason, ToolCall, Verdict};

/// Actions that are never executed regardless of the allow-list.
/// Restarting or stopping the host, wiping state, or disabling recording
/// are irreversible from the model's point of view.
static BASE_DENIED_ACTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "restart",
        "stop",
        "reload",
        "factory_reset",
        "purge",
        "disable",
    ]
    .into_iter()
    .collect()
});

/// Sliding-window rate limiter shared across the whole process.
///
/// Counts acquisitions in the trailing window; callers that would exceed
/// the budget are refused without recording a slot.
pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `max_calls` per `window`.
    pub fn new(max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Limiter allowing `max_calls` per minute.
    pub fn per_minute(max_calls: u32) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    /// Try to take a slot. Returns `false` when the budget is spent.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap();

        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }

        if calls.len() as u32 >= self.max_calls {
            return false;
        }
        calls.push_back(now);
        true
    }
}

/// Validator mapping model-declared calls to permitted local actions.
pub struct ToolValidator {
    allowed_domains: HashSet<String>,
    denied_actions: HashSet<String>,
    rate_limiter: RateLimiter,
}

impl ToolValidator {
    /// Create a validator.
    ///
    /// # Arguments
    /// * `allowed_domains` - domains the model may act on; empty allows
    ///   every non-denied domain
    /// * `extra_denied_actions` - denied in addition to the built-in list
    /// * `max_calls_per_minute` - process-wide rate limit
    pub fn new(
        allowed_domains: &[String],
        extra_denied_actions: &[String],
        max_calls_per_minute: u32,
    ) -> Self {
        let mut denied_actions: HashSet<String> =
            BASE_DENIED_ACTIONS.iter().map(|s| s.to_string()).collect();
        denied_actions.extend(extra_denied_actions.iter().cloned());

        Self {
            allowed_domains: allowed_domains.iter().cloned().collect(),
            denied_actions,
            rate_limiter: RateLimiter::per_minute(max_calls_per_minute),
        }
    }

    /// Run the validation pipeline, short-circuiting on the first failure.
    pub fn validate(&self, call: &ToolCall, capabilities: &CapabilitySnapshot) -> Verdict {
        // (1) Structured parse of name and arguments
        let action = match parse_call(call) {
            Ok(action) => action,
            Err(reason) => {
                warn!(tool = %call.name, id = %call.id, reason = %reason, "Tool call rejected");
                return Verdict::Rejected(reason);
            }
        };

        // (2) Domain allow-list
        if !self.allowed_domains.is_empty() && !self.allowed_domains.contains(&action.domain) {
            warn!(tool = %call.name, domain = %action.domain, "Domain not allowed");
            return Verdict::Rejected(RejectReason::DomainNotAllowed(action.domain));
        }

        // (3) Action deny-list, checked before anything touches the
        // inventory so destructive names are refused even when exposed
        if self.denied_actions.contains(&action.action) {
            warn!(tool = %call.name, action = %action.action, "Action denied");
            return Verdict::Rejected(RejectReason::ActionDenied(action.action));
        }

        // (4) Every named target must exist and be exposed
        for target in &action.targets {
            if !capabilities.target_exposed(target) {
                warn!(tool = %call.name, target = %target, "Unknown target");
                return Verdict::Rejected(RejectReason::UnknownTarget(target.clone()));
            }
        }

        // (5) Rate limit last, so refused calls don't burn budget
        if !self.rate_limiter.try_acquire() {
            warn!(tool = %call.name, "Rate limited");
            return Verdict::Rejected(RejectReason::RateLimited);
        }

        debug!(
            tool = %call.name,
            domain = %action.domain,
            action = %action.action,
            targets = action.targets.len(),
            "Tool call accepted"
        );
        Verdict::Accepted(action)
    }
}

/// Parse a tool call's name and raw arguments into a [`ParsedAction`].
///
/// The name must be `domain_action` (split on the first underscore, since
/// action names themselves contain underscores). Arguments must be a JSON
/// object; a `targets` field holding a string or array of strings is
/// lifted out, everything else stays as parameters.
fn parse_call(call: &ToolCall) -> std::result::Result<ParsedAction, RejectReason> {
    let (domain, action) = call
        .name
        .split_once('_')
        .filter(|(d, a)| !d.is_empty() && !a.is_empty())
        .ok_or_else(|| {
            RejectReason::ParseError(format!("invalid tool name format: '{}'", call.name))
        })?;

    let raw = call.raw_arguments.trim();
    let mut arguments: Map<String, Value> = if raw.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(RejectReason::ParseError(format!(
                    "arguments must be a JSON object, got {}",
                    type_name(&other)
                )))
            }
            Err(err) => return Err(RejectReason::ParseError(err.to_string())),
        }
    };

    let targets = match arguments.remove("targets") {
        None => Vec::new(),
        Some(Value::String(one)) => vec![one],
        Some(Value::Array(items)) => {
            let mut targets = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => targets.push(s),
                    other => {
                        return Err(RejectReason::ParseError(format!(
                            "targets must be strings, got {}",
                            type_name(&other)
                        )))
                    }
                }
            }
            targets
        }
        Some(other) => {
            return Err(RejectReason::ParseError(format!(
                "targets must be a string or array, got {}",
                type_name(&other)
            )))
        }
    };

    Ok(ParsedAction {
        domain: domain.to_string(),
        action: action.to_string(),
        targets,
        parameters: arguments,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
