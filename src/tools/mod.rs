//! Tools module - validation and execution of model-requested actions
//!
//! This module turns model-issued function calls into validated local
//! actions. It covers the full lifecycle:
//!
//! - `ToolSchema` building from the live capability inventory, behind a
//!   TTL cache (`SchemaCache`)
//! - `ToolValidator`: parse, allow-list, deny-list, target existence, and
//!   rate-limit checks, short-circuiting on the first failure
//! - `ActionDispatcher`: sequential or concurrent execution against the
//!   injected `ActionHandler`, with per-call timeouts and call-index
//!   ordered results
//!
//! Rejections are structured results fed back to the model, never fatal
//! errors; only the action layer itself can report a hard failure, and
//! even that degrades to an error outcome for the model to react to.

mod executor;
mod schema;
mod types;
mod validator;

pub use executor::{ActionDispatcher, ExecutableCall, ExecutionResult};
pub use schema::{build_schemas, SchemaCache};
pub use types::{
    ActionHandler, ActionOutcome, ActionStatus, CapabilitySnapshot, DomainCapabilities,
    ParsedAction, RejectReason, ToolCall, ToolSchema, Verdict,
};
pub use validator::{RateLimiter, ToolValidator};
