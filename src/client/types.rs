//! Client types for Hearthmind
//!
//! This module defines the normalized event stream all wire formats are
//! translated into, the assembled model reply, and the wire-level request
//! and response shapes of the chat surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ToolResultRole;
use crate::error::Result;
use crate::memory::{Message, Role};
use crate::tools::{ToolCall, ToolSchema};

// ============================================================================
// Normalized Events
// ============================================================================

/// Why the model stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of the answer
    Stop,
    /// The model requested tool calls
    ToolCalls,
    /// Output-size limit reached
    Length,
    /// Anything else the endpoint reported
    Other(String),
}

impl FinishReason {
    /// Map a wire finish reason string.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// The normalized internal representation of endpoint output.
///
/// All three wire shapes (delta stream, single response, alternate
/// surface) are decoded into this union; no downstream component ever
/// sees a wire format directly.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of answer text, in arrival order
    TextDelta(String),
    /// A fragment of one tool call. Id and name usually arrive in the
    /// first fragment for an index; argument text may arrive
    /// character-by-character and must be concatenated in arrival order.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// The stream finished
    Done(FinishReason),
    /// A frame-level problem worth a diagnostic; never aborts the stream
    Error(String),
}

/// Token usage for one model call, reported by the endpoint or estimated
/// when the usage record is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Usage with the total derived from the parts.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Whether nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

/// A fully assembled reply from one model call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    /// Accumulated answer text
    pub content: String,
    /// Complete tool calls, in index order
    pub tool_calls: Vec<ToolCall>,
    /// Usage, when known
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
}

impl ModelReply {
    /// Text-only reply.
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            ..Default::default()
        }
    }

    /// Whether the model requested tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// One model call against the stateless endpoint.
///
/// The backend is a pure protocol translator: it receives the full
/// snapshot (the caller re-feeds all state by value on every call) and
/// never inspects or retains conversation content.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send one conversation snapshot plus tool schemas and assemble the
    /// normalized reply.
    async fn complete(&self, messages: Vec<WireMessage>, tools: &[ToolSchema])
        -> Result<ModelReply>;
}

// ============================================================================
// Wire Request Types
// ============================================================================

/// A message in the chat surface's wire format.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireMessage {
    pub role: String,
    /// Omitted for assistant messages that only carry tool calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// An assistant-requested tool call echoed back with the history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireToolCall {
    pub id: String,
    pub r#type: String,
    pub function: WireFunctionCall,
}

/// Function name and raw argument text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

impl WireMessage {
    /// Encode a window message for the wire.
    ///
    /// `tool_result_role` controls how tool results are labeled: the
    /// dedicated tool role, or the user-role shim for endpoints that
    /// reject it (in which case the call id is dropped and the payload
    /// stands on its own).
    pub fn from_history(message: &Message, tool_result_role: ToolResultRole) -> Self {
        let is_tool_result = message.tool_call_id.is_some();
        let role = match (message.role, is_tool_result, tool_result_role) {
            (Role::Tool, _, ToolResultRole::User) | (_, true, ToolResultRole::User) => {
                "user".to_string()
            }
            (role, _, _) => role.to_string(),
        };

        let tool_calls = message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| WireToolCall {
                    id: c.id.clone(),
                    r#type: "function".to_string(),
                    function: WireFunctionCall {
                        name: c.name.clone(),
                        arguments: c.raw_arguments.clone(),
                    },
                })
                .collect()
        });

        let tool_call_id = match tool_result_role {
            ToolResultRole::Tool => message.tool_call_id.clone(),
            ToolResultRole::User => None,
        };

        let content = if message.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(message.content.clone())
        };

        Self {
            role,
            content,
            tool_calls,
            tool_call_id,
        }
    }
}

// ============================================================================
// Wire Response Types (non-streaming chat)
// ============================================================================

/// Single-document chat response body.
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseMessage {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ChatResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseToolCall {
    pub id: String,
    pub function: WireFunctionCall,
}

/// Usage record; field names differ between surfaces.
#[derive(Debug, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

impl WireUsage {
    /// Normalize whichever field names the surface used.
    pub fn normalize(&self) -> TokenUsage {
        let prompt = self.prompt_tokens.or(self.input_tokens).unwrap_or(0);
        let completion = self.completion_tokens.or(self.output_tokens).unwrap_or(0);
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: self.total_tokens.unwrap_or(prompt + completion),
        }
    }
}
