//! Client module - protocol translation for the LLM endpoint
//!
//! The endpoint may answer in one of three wire shapes: an incremental
//! delta stream, a single non-streaming document, or the alternate
//! "responses" surface used by reasoning-only deployments. This module
//! normalizes all of them into one internal `StreamEvent` union and
//! assembles a `ModelReply`; nothing downstream ever sees a wire format.
//!
//! The `ChatBackend` trait is the seam the orchestrator drives; tests
//! substitute scripted backends for the real `ChatClient`.

mod chat;
mod sse;
mod types;

pub use chat::ChatClient;
pub use sse::{DeltaStreamParser, ReplyAccumulator};
pub use types::{
    ChatBackend, ChatResponse, FinishReason, ModelReply, StreamEvent, TokenUsage, WireFunctionCall,
    WireMessage, WireToolCall, WireUsage,
};
