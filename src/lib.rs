//! Hearthmind - conversation agent bridging a voice assistant front-end
//! to stateless LLM APIs

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod stats;
pub mod tools;

pub use agent::{ConversationAgent, LogNotifier, Notifier, TurnOutcome};
pub use client::{ChatBackend, ChatClient, ModelReply, StreamEvent};
pub use config::Config;
pub use error::{AgentError, Result};
pub use memory::{ConversationMemory, Message, Role};
pub use tools::{ActionHandler, ActionOutcome, CapabilitySnapshot, ToolCall, ToolSchema};
