//! Integration tests for Hearthmind
//!
//! These tests drive full turns through the conversation agent with a
//! scripted model backend and a recording action layer, covering the
//! tool-call loop, validation rejections, memory accumulation across
//! turns, degradation bounds, and background continuation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hearthmind::agent::{ConversationAgent, Notifier, TurnOutcome};
use hearthmind::client::{ChatBackend, ModelReply, WireMessage};
use hearthmind::config::Config;
use hearthmind::error::Result;
use hearthmind::tools::{
    ActionHandler, ActionOutcome, CapabilitySnapshot, ParsedAction, ToolCall, ToolSchema,
};

// ============================================================================
// Test doubles
// ============================================================================

/// Model backend that plays back scripted replies and records every
/// request it received.
struct ScriptedBackend {
    replies: Mutex<VecDeque<ModelReply>>,
    requests: Mutex<Vec<Vec<WireMessage>>>,
    delay: Duration,
}

impl ScriptedBackend {
    fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(
        &self,
        messages: Vec<WireMessage>,
        _tools: &[ToolSchema],
    ) -> Result<ModelReply> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.requests.lock().unwrap().push(messages);
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ModelReply::text("out of script")))
    }
}

/// Action layer that records executed actions.
struct RecordingHandler {
    executed: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
        }
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    async fn execute(&self, action: &ParsedAction) -> Result<ActionOutcome> {
        self.executed
            .lock()
            .unwrap()
            .push(format!("{}.{}", action.domain, action.action));
        Ok(ActionOutcome::success("done"))
    }
}

struct CountingNotifier {
    delivered: AtomicUsize,
    last: Mutex<Option<String>>,
}

impl CountingNotifier {
    fn new() -> Self {
        Self {
            delivered: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn deliver(&self, _conversation_id: &str, final_text: &str) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(final_text.to_string());
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn capabilities() -> CapabilitySnapshot {
    CapabilitySnapshot::new()
        .with_action("light", "turn_on", "Turn a light on")
        .with_action("light", "turn_off", "Turn a light off")
        .with_target("light", "light.kitchen")
        .with_target("light", "light.bedroom")
}

fn tool_reply(content: &str, calls: Vec<ToolCall>) -> ModelReply {
    ModelReply {
        content: content.to_string(),
        tool_calls: calls,
        usage: None,
        finish_reason: None,
    }
}

struct World {
    agent: ConversationAgent,
    backend: Arc<ScriptedBackend>,
    handler: Arc<RecordingHandler>,
    notifier: Arc<CountingNotifier>,
}

fn world_with_config(replies: Vec<ModelReply>, config: Config) -> World {
    let backend = Arc::new(ScriptedBackend::new(replies));
    let handler = Arc::new(RecordingHandler::new());
    let notifier = Arc::new(CountingNotifier::new());
    let agent = ConversationAgent::new(
        config,
        backend.clone() as Arc<dyn ChatBackend>,
        handler.clone() as Arc<dyn ActionHandler>,
        notifier.clone() as Arc<dyn Notifier>,
    )
    .unwrap();
    World {
        agent,
        backend,
        handler,
        notifier,
    }
}

fn world(replies: Vec<ModelReply>) -> World {
    world_with_config(replies, Config::default())
}

// ============================================================================
// Full turn flow
// ============================================================================

#[tokio::test]
async fn test_plain_question_and_answer() {
    let w = world(vec![ModelReply::text("It is 21 degrees inside.")]);

    let outcome = w
        .agent
        .process_turn("conv", "how warm is it?", &capabilities())
        .await
        .unwrap();

    assert_eq!(outcome.text(), "It is 21 degrees inside.");
    assert_eq!(w.backend.request_count(), 1);
    assert!(w.handler.executed().is_empty());
}

#[tokio::test]
async fn test_tool_loop_round_trip() {
    let w = world(vec![
        tool_reply(
            "",
            vec![ToolCall::new(
                "call_1",
                "light_turn_on",
                r#"{"targets": ["light.kitchen"]}"#,
            )],
        ),
        ModelReply::text("The kitchen light is now on."),
    ]);

    let outcome = w
        .agent
        .process_turn("conv", "turn on the kitchen light", &capabilities())
        .await
        .unwrap();

    assert_eq!(outcome.text(), "The kitchen light is now on.");
    assert_eq!(w.handler.executed(), vec!["light.turn_on".to_string()]);

    // The second request carried the tool exchange back to the model
    let requests = w.backend.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].len() > requests[0].len());
    assert!(requests[1].iter().any(|m| m.tool_call_id.is_some()));
}

#[tokio::test]
async fn test_parallel_tool_calls_keep_order() {
    let mut config = Config::default();
    config.tools.parallel_execution = true;

    let w = world_with_config(
        vec![
            tool_reply(
                "",
                vec![
                    ToolCall::new("call_a", "light_turn_on", r#"{"targets": ["light.kitchen"]}"#),
                    ToolCall::new("call_b", "light_turn_off", r#"{"targets": ["light.bedroom"]}"#),
                ],
            ),
            ModelReply::text("Both done."),
        ],
        config,
    );

    let outcome = w
        .agent
        .process_turn("conv", "kitchen on, bedroom off", &capabilities())
        .await
        .unwrap();
    assert_eq!(outcome.text(), "Both done.");

    // Results are appended in call-index order even under concurrency
    let snapshot = w.agent.memory().snapshot("conv", None).await;
    let result_ids: Vec<&str> = snapshot
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(result_ids, vec!["call_a", "call_b"]);
}

#[tokio::test]
async fn test_disallowed_domain_is_rejected_without_execution() {
    let w = world(vec![
        tool_reply(
            "",
            vec![ToolCall::new("call_1", "shell_run", r#"{"cmd": "reboot"}"#)],
        ),
        ModelReply::text("I am not allowed to do that."),
    ]);

    let outcome = w
        .agent
        .process_turn("conv", "run a shell command", &capabilities())
        .await
        .unwrap();

    // Nothing executed, the loop continued to a proper answer
    assert!(w.handler.executed().is_empty());
    assert_eq!(outcome.text(), "I am not allowed to do that.");

    // The rejection reached the model as a structured error result
    let snapshot = w.agent.memory().snapshot("conv", None).await;
    let result = snapshot
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_1"))
        .unwrap();
    assert!(result.content.contains("error"));
    assert_eq!(w.agent.metrics().snapshot().rejected_calls, 1);
}

#[tokio::test]
async fn test_memory_accumulates_across_turns() {
    let w = world(vec![
        ModelReply::text("Hello! How can I help?"),
        ModelReply::text("I remember."),
    ]);

    w.agent
        .process_turn("conv", "hello", &capabilities())
        .await
        .unwrap();
    w.agent
        .process_turn("conv", "do you remember me?", &capabilities())
        .await
        .unwrap();

    // The second request re-fed the whole first exchange
    let requests = w.backend.requests.lock().unwrap();
    assert!(requests[1].len() > requests[0].len());

    let stats = w.agent.stats("conv").await;
    assert!(stats.exists);
    assert_eq!(stats.message_count, 5); // system + 2 user + 2 assistant
    assert!(stats.current_tokens > 0);
    assert!(stats.current_tokens <= stats.max_tokens);
}

#[tokio::test]
async fn test_turns_for_one_conversation_are_serialized() {
    let backend = Arc::new(
        ScriptedBackend::new(vec![
            ModelReply::text("first answer"),
            ModelReply::text("second answer"),
        ])
        .with_delay(Duration::from_millis(20)),
    );
    let handler = Arc::new(RecordingHandler::new());
    let notifier = Arc::new(CountingNotifier::new());
    let agent = Arc::new(
        ConversationAgent::new(
            Config::default(),
            backend as Arc<dyn ChatBackend>,
            handler as Arc<dyn ActionHandler>,
            notifier as Arc<dyn Notifier>,
        )
        .unwrap(),
    );

    let a = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            agent
                .process_turn("conv", "first", &CapabilitySnapshot::new())
                .await
                .unwrap()
        })
    };
    let b = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            agent
                .process_turn("conv", "second", &CapabilitySnapshot::new())
                .await
                .unwrap()
        })
    };
    a.await.unwrap();
    b.await.unwrap();

    // Appends never interleave: each user turn is directly followed by
    // its answer
    let snapshot = agent.memory().snapshot("conv", None).await;
    let roles: Vec<String> = snapshot.iter().map(|m| m.role.to_string()).collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "user", "assistant"]);
}

#[tokio::test]
async fn test_reset_clears_state() {
    let w = world(vec![ModelReply::text("hi"), ModelReply::text("fresh")]);

    w.agent
        .process_turn("conv", "hello", &capabilities())
        .await
        .unwrap();
    w.agent.reset("conv").await;

    let stats = w.agent.stats("conv").await;
    assert!(!stats.exists);
    assert_eq!(stats.message_count, 0);
    assert_eq!(stats.current_tokens, 0);
}

// ============================================================================
// Degradation bounds
// ============================================================================

#[tokio::test]
async fn test_max_iterations_returns_partial_answer() {
    let mut config = Config::default();
    config.orchestrator.max_iterations = 3;

    let replies: Vec<ModelReply> = (0..5)
        .map(|i| {
            tool_reply(
                &format!("partial progress {}", i),
                vec![ToolCall::new(
                    &format!("call_{}", i),
                    "light_turn_on",
                    r#"{"targets": ["light.kitchen"]}"#,
                )],
            )
        })
        .collect();
    let w = world_with_config(replies, config);

    let outcome = w
        .agent
        .process_turn("conv", "keep going", &capabilities())
        .await
        .unwrap();

    // Last partial text, not an empty or error response
    assert_eq!(outcome.text(), "partial progress 2");
    assert_eq!(w.backend.request_count(), 3);
}

// ============================================================================
// Background continuation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_model_produces_interim_then_side_channel_delivery() {
    let mut config = Config::default();
    config.orchestrator.early_deadline_secs = 2;

    let backend = Arc::new(
        ScriptedBackend::new(vec![ModelReply::text("Here is your late answer.")])
            .with_delay(Duration::from_secs(20)),
    );
    let handler = Arc::new(RecordingHandler::new());
    let notifier = Arc::new(CountingNotifier::new());
    let agent = ConversationAgent::new(
        config,
        backend as Arc<dyn ChatBackend>,
        handler as Arc<dyn ActionHandler>,
        notifier.clone() as Arc<dyn Notifier>,
    )
    .unwrap();

    let outcome = agent
        .process_turn("conv", "think hard about this", &capabilities())
        .await
        .unwrap();

    let TurnOutcome::Interim { continuation, .. } = &outcome else {
        panic!("expected interim, got {:?}", outcome);
    };
    assert!(!continuation.is_empty());

    // Exactly one delivery through the side channel once the run lands
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(notifier.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(
        notifier.last.lock().unwrap().as_deref(),
        Some("Here is your late answer.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_follow_up_turn_claims_background_answer() {
    let mut config = Config::default();
    config.orchestrator.early_deadline_secs = 1;

    let backend = Arc::new(
        ScriptedBackend::new(vec![ModelReply::text("Claimed synchronously after all.")])
            .with_delay(Duration::from_secs(8)),
    );
    let notifier = Arc::new(CountingNotifier::new());
    let agent = ConversationAgent::new(
        config,
        backend as Arc<dyn ChatBackend>,
        Arc::new(RecordingHandler::new()) as Arc<dyn ActionHandler>,
        notifier.clone() as Arc<dyn Notifier>,
    )
    .unwrap();

    let first = agent
        .process_turn("conv", "slow question", &capabilities())
        .await
        .unwrap();
    assert!(matches!(first, TurnOutcome::Interim { .. }));

    // A non-numeric follow-up waits for the detached run
    let second = agent
        .process_turn("conv", "just wait for it", &capabilities())
        .await
        .unwrap();
    assert_eq!(second.text(), "Claimed synchronously after all.");
}

#[tokio::test]
async fn test_fast_answer_never_notifies() {
    let w = world(vec![ModelReply::text("quick")]);

    let outcome = w
        .agent
        .process_turn("conv", "hello", &capabilities())
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Answer { .. }));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(w.notifier.delivered.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Configuration surface
// ============================================================================

#[tokio::test]
async fn test_window_too_small_surfaces_to_operator() {
    let mut config = Config::default();
    config.window.max_tokens = 8;
    // Keep the failure on the synchronous path
    config.orchestrator.early_continuation = false;

    let w = world_with_config(vec![ModelReply::text("never")], config);

    let err = w
        .agent
        .process_turn("conv", "hello", &capabilities())
        .await
        .unwrap_err();
    assert!(err.is_operator_visible());
    assert!(err.to_string().contains("too small"));
}

#[tokio::test]
async fn test_invalid_configuration_rejected_at_construction() {
    let mut config = Config::default();
    config.orchestrator.max_iterations = 0;

    let result = ConversationAgent::new(
        config,
        Arc::new(ScriptedBackend::new(vec![])) as Arc<dyn ChatBackend>,
        Arc::new(RecordingHandler::new()) as Arc<dyn ActionHandler>,
        Arc::new(CountingNotifier::new()) as Arc<dyn Notifier>,
    );
    assert!(result.is_err());
}
