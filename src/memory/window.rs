//! Conversation window types.
//!
//! This module defines the core types for conversation memory: messages,
//! roles, and the bounded token-budgeted window with FIFO eviction.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::tools::ToolCall;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt and instructions
    System,
    /// Messages from the user
    User,
    /// Messages from the model
    Assistant,
    /// Results from tool executions
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A single message in a conversation window.
///
/// Immutable once appended; the token cost is computed at append time and
/// never recomputed because the content cannot change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The text content of the message
    pub content: String,
    /// Opaque labels for context grouping; filtered on read
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub tags: HashSet<String>,
    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Id of the tool call a tool-result message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Cached token cost, computed once at append time
    pub token_cost: u32,
    /// Monotonically increasing index within the window
    pub sequence: u64,
    /// When the message was appended
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Check whether this message carries any of the given tags.
    pub fn matches_tags(&self, filter: &HashSet<String>) -> bool {
        self.tags.iter().any(|t| filter.contains(t))
    }

    /// Whether this message requests tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}

/// The caller-supplied part of a message, before the window assigns the
/// token cost, sequence, and timestamp.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub tags: HashSet<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
}

impl MessageDraft {
    /// Plain message with no tool linkage.
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tags: HashSet::new(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Attach tags.
    pub fn with_tags(mut self, tags: HashSet<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Assistant message requesting tool calls.
    pub fn assistant_with_calls(content: &str, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.to_string(),
            tags: HashSet::new(),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Result of one tool call, encoded under the given role (the
    /// dedicated tool role, or the user-role shim for endpoints that
    /// reject it).
    pub fn tool_result(role: Role, call_id: &str, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tags: HashSet::new(),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

/// Statistics for one conversation window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub conversation_id: String,
    /// Whether the window currently exists. All other fields are zero
    /// when it does not.
    pub exists: bool,
    pub message_count: usize,
    pub current_tokens: u32,
    pub max_tokens: u32,
    /// Budget utilization in percent.
    pub utilization: f32,
    /// Tag name to number of messages carrying it.
    pub tag_distribution: HashMap<String, usize>,
    pub age_seconds: i64,
}

impl WindowStats {
    /// Stats for a conversation with no window.
    pub fn missing(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            exists: false,
            message_count: 0,
            current_tokens: 0,
            max_tokens: 0,
            utilization: 0.0,
            tag_distribution: HashMap::new(),
            age_seconds: 0,
        }
    }
}

/// A bounded, ordered buffer of conversation messages.
///
/// Invariant: `current_tokens` equals the base schema reservation plus the
/// sum of the token costs of the present messages. After any mutation the
/// window is back within budget, or the mutation failed with
/// [`AgentError::WindowTooSmall`].
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    /// Key identifying the conversation
    pub conversation_id: String,
    messages: Vec<Message>,
    max_tokens: u32,
    current_tokens: u32,
    /// Tokens reserved for the tool schemas sent with every request
    base_schema_tokens: u32,
    preserve_system: bool,
    next_sequence: u64,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl ConversationWindow {
    /// Create an empty window for a conversation.
    pub fn new(
        conversation_id: &str,
        max_tokens: u32,
        preserve_system: bool,
        base_schema_tokens: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.to_string(),
            messages: Vec::new(),
            max_tokens,
            current_tokens: base_schema_tokens,
            base_schema_tokens,
            preserve_system,
            next_sequence: 0,
            created_at: now,
            last_updated: now,
        }
    }

    /// Append a message with a precomputed token cost, then evict back to
    /// budget.
    ///
    /// Returns a clone of the appended message. Fails with
    /// [`AgentError::WindowTooSmall`] when the budget cannot be met even
    /// after evicting everything evictable; the append is kept in that
    /// case so the caller sees the offending state, but the error must be
    /// surfaced as a configuration problem.
    pub fn append(
        &mut self,
        role: Role,
        content: &str,
        tags: HashSet<String>,
        token_cost: u32,
    ) -> Result<Message> {
        self.append_draft(MessageDraft::new(role, content).with_tags(tags), token_cost)
    }

    /// Append a draft carrying tool-call linkage.
    pub fn append_draft(&mut self, draft: MessageDraft, token_cost: u32) -> Result<Message> {
        let message = Message {
            role: draft.role,
            content: draft.content,
            tags: draft.tags,
            tool_calls: draft.tool_calls,
            tool_call_id: draft.tool_call_id,
            token_cost,
            sequence: self.next_sequence,
            timestamp: Utc::now(),
        };
        self.next_sequence += 1;
        self.current_tokens += token_cost;
        self.messages.push(message.clone());
        self.last_updated = message.timestamp;

        self.evict_to_budget()?;
        Ok(message)
    }

    /// Insert or replace the system prompt.
    ///
    /// An existing system message is updated in place (applying the token
    /// delta) so rebuilt prompts never stack; otherwise the prompt is
    /// inserted at the front of the window.
    pub fn upsert_system(&mut self, content: &str, token_cost: u32) -> Result<()> {
        let now = Utc::now();
        if let Some(existing) = self.messages.iter_mut().find(|m| m.role == Role::System) {
            self.current_tokens = self.current_tokens - existing.token_cost + token_cost;
            existing.content = content.to_string();
            existing.token_cost = token_cost;
            existing.timestamp = now;
        } else {
            let message = Message {
                role: Role::System,
                content: content.to_string(),
                tags: HashSet::new(),
                tool_calls: None,
                tool_call_id: None,
                token_cost,
                sequence: self.next_sequence,
                timestamp: now,
            };
            self.next_sequence += 1;
            self.current_tokens += token_cost;
            self.messages.insert(0, message);
        }
        self.last_updated = now;
        self.evict_to_budget()
    }

    /// Adjust the schema token reservation by a delta, evicting if the
    /// window grew.
    pub fn adjust_base_schema_tokens(&mut self, new_base: u32) -> Result<()> {
        self.current_tokens = self.current_tokens - self.base_schema_tokens + new_base;
        self.base_schema_tokens = new_base;
        if self.current_tokens > self.max_tokens {
            self.evict_to_budget()?;
        }
        Ok(())
    }

    /// FIFO eviction back to the token budget.
    ///
    /// Removes the oldest evictable message until the budget holds. A
    /// message is evictable when it is not a system message (while
    /// `preserve_system` is set) and not the newest message in the window:
    /// the mandatory context (system prompt plus the message that
    /// triggered the check) must always fit, and when it does not the
    /// condition is a configuration error, never silent truncation.
    ///
    /// The eviction policy is deliberately simple; an importance-scoring
    /// policy would replace this routine without changing the window
    /// contract.
    fn evict_to_budget(&mut self) -> Result<()> {
        while self.current_tokens > self.max_tokens {
            let last = self.messages.len().saturating_sub(1);
            let evict_idx = self
                .messages
                .iter()
                .enumerate()
                .take(last)
                .find(|(_, m)| !(self.preserve_system && m.role == Role::System))
                .map(|(i, _)| i);

            match evict_idx {
                Some(idx) => {
                    let evicted = self.messages.remove(idx);
                    self.current_tokens -= evicted.token_cost;
                    tracing::debug!(
                        conversation_id = %self.conversation_id,
                        role = %evicted.role,
                        tokens = evicted.token_cost,
                        remaining = self.current_tokens,
                        "Evicted message"
                    );
                }
                None => {
                    return Err(AgentError::WindowTooSmall {
                        required: self.current_tokens,
                        max: self.max_tokens,
                    });
                }
            }
        }
        Ok(())
    }

    /// All messages, in append order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages whose tag set intersects the filter, in original order.
    /// `None` returns everything. Never mutates the window.
    pub fn snapshot(&self, tag_filter: Option<&HashSet<String>>) -> Vec<Message> {
        match tag_filter {
            Some(filter) => self
                .messages
                .iter()
                .filter(|m| m.matches_tags(filter))
                .cloned()
                .collect(),
            None => self.messages.clone(),
        }
    }

    /// Current token usage (messages plus schema reservation).
    pub fn current_tokens(&self) -> u32 {
        self.current_tokens
    }

    /// Token budget.
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Number of messages in the window.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the window holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Window statistics.
    pub fn stats(&self) -> WindowStats {
        let mut tag_distribution: HashMap<String, usize> = HashMap::new();
        for msg in &self.messages {
            for tag in &msg.tags {
                *tag_distribution.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        WindowStats {
            conversation_id: self.conversation_id.clone(),
            exists: true,
            message_count: self.messages.len(),
            current_tokens: self.current_tokens,
            max_tokens: self.max_tokens,
            utilization: if self.max_tokens > 0 {
                self.current_tokens as f32 / self.max_tokens as f32 * 100.0
            } else {
                0.0
            },
            tag_distribution,
            age_seconds: (Utc::now() - self.created_at).num_seconds(),
        }
    }

    /// Checked invariant: token counter equals the reservation plus the
    /// sum of message costs.
    #[cfg(test)]
    pub fn token_sum_matches(&self) -> bool {
        let sum: u32 = self.messages.iter().map(|m| m.token_cost).sum();
        self.current_tokens == self.base_schema_tokens + sum
    }
}
