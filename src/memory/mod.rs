//! Conversation memory - bounded sliding windows with token budgets
//!
//! This module gives the stateless model the illusion of stateful dialogue:
//! each conversation id owns an ordered window of messages with a token
//! budget and FIFO eviction, and every model call re-sends a snapshot of
//! that window. State is volatile and process-scoped; there is no
//! persistence.
//!
//! # Example
//!
//! ```
//! use hearthmind::memory::{ConversationMemory, Role};
//! use std::collections::HashSet;
//!
//! #[tokio::main]
//! async fn main() {
//!     let memory = ConversationMemory::new(4000, true);
//!
//!     memory
//!         .append("conv-1", Role::User, "Turn on the lights", HashSet::new())
//!         .await
//!         .unwrap();
//!
//!     let snapshot = memory.snapshot("conv-1", None).await;
//!     assert_eq!(snapshot.len(), 1);
//! }
//! ```

mod estimator;
mod window;

pub use estimator::TokenEstimator;
pub use window::{ConversationWindow, Message, MessageDraft, Role, WindowStats};

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;

/// Manager for all conversation windows in the process.
///
/// Windows are created lazily on first use for a conversation id and
/// destroyed on explicit reset or process shutdown. The manager owns the
/// only durable cross-turn state; everything else in a turn is ephemeral.
pub struct ConversationMemory {
    windows: Mutex<HashMap<String, ConversationWindow>>,
    estimator: TokenEstimator,
    max_tokens: u32,
    preserve_system: bool,
    /// Tokens reserved in every window for the tool schemas that ride
    /// along with each request. Updated when the schema cache rebuilds.
    base_schema_tokens: Mutex<u32>,
}

impl ConversationMemory {
    /// Create a memory manager.
    ///
    /// # Arguments
    /// * `max_tokens` - token budget per conversation window
    /// * `preserve_system` - never evict system messages while other
    ///   messages remain
    pub fn new(max_tokens: u32, preserve_system: bool) -> Self {
        info!(
            max_tokens = max_tokens,
            preserve_system = preserve_system,
            "Conversation memory initialized"
        );
        Self {
            windows: Mutex::new(HashMap::new()),
            estimator: TokenEstimator::new(),
            max_tokens,
            preserve_system,
            base_schema_tokens: Mutex::new(0),
        }
    }

    /// The estimator used for all token accounting.
    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Append a message, creating the window if needed.
    ///
    /// The token cost is computed once here and cached on the message.
    /// Fails with [`crate::error::AgentError::WindowTooSmall`] when the
    /// budget cannot hold the mandatory context.
    pub async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        tags: HashSet<String>,
    ) -> Result<Message> {
        self.append_draft(
            conversation_id,
            MessageDraft::new(role, content).with_tags(tags),
        )
        .await
    }

    /// Append a draft carrying tool-call linkage.
    ///
    /// Tool calls resent with the history cost tokens too, so their names
    /// and raw arguments are included in the message cost.
    pub async fn append_draft(
        &self,
        conversation_id: &str,
        draft: MessageDraft,
    ) -> Result<Message> {
        let mut cost = self.estimator.message_cost(&draft.content);
        if let Some(calls) = &draft.tool_calls {
            for call in calls {
                cost += self.estimator.text_cost(&call.name)
                    + self.estimator.text_cost(&call.raw_arguments);
            }
        }

        let base = *self.base_schema_tokens.lock().await;
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                ConversationWindow::new(conversation_id, self.max_tokens, self.preserve_system, base)
            });

        let message = window.append_draft(draft, cost)?;
        debug!(
            conversation_id = conversation_id,
            role = %message.role,
            tokens = message.token_cost,
            total_tokens = window.current_tokens(),
            max_tokens = window.max_tokens(),
            "Appended message"
        );
        Ok(message)
    }

    /// Insert or update the system prompt for a conversation.
    ///
    /// Rebuilt prompts replace the existing system message in place so
    /// they never stack up in the window.
    pub async fn set_system_prompt(&self, conversation_id: &str, content: &str) -> Result<()> {
        let cost = self.estimator.message_cost(content);
        let base = *self.base_schema_tokens.lock().await;
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                ConversationWindow::new(conversation_id, self.max_tokens, self.preserve_system, base)
            });
        window.upsert_system(content, cost)
    }

    /// Reserve tokens for the tool schemas sent with every request.
    ///
    /// The new reservation is applied to every live window; windows that
    /// grew past their budget evict immediately.
    pub async fn set_base_schema_tokens(&self, count: u32) -> Result<()> {
        let mut base = self.base_schema_tokens.lock().await;
        *base = count;

        let mut windows = self.windows.lock().await;
        for window in windows.values_mut() {
            window.adjust_base_schema_tokens(count)?;
        }
        info!(
            tokens = count,
            windows = windows.len(),
            "Schema token reservation updated"
        );
        Ok(())
    }

    /// Ordered snapshot of a conversation, optionally filtered by tags.
    ///
    /// Returns an empty sequence for an unknown conversation id.
    pub async fn snapshot(
        &self,
        conversation_id: &str,
        tag_filter: Option<&HashSet<String>>,
    ) -> Vec<Message> {
        let windows = self.windows.lock().await;
        windows
            .get(conversation_id)
            .map(|w| w.snapshot(tag_filter))
            .unwrap_or_default()
    }

    /// Destroy a conversation's window.
    pub async fn reset(&self, conversation_id: &str) {
        let mut windows = self.windows.lock().await;
        if windows.remove(conversation_id).is_some() {
            info!(conversation_id = conversation_id, "Conversation reset");
        }
    }

    /// Statistics for a conversation. Reports zeros when no window exists.
    pub async fn stats(&self, conversation_id: &str) -> WindowStats {
        let windows = self.windows.lock().await;
        windows
            .get(conversation_id)
            .map(|w| w.stats())
            .unwrap_or_else(|| WindowStats::missing(conversation_id))
    }

    /// All active conversation ids.
    pub async fn conversation_ids(&self) -> Vec<String> {
        let windows = self.windows.lock().await;
        windows.keys().cloned().collect()
    }
}
