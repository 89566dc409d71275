//! Agent module - turn processing and background continuation
//!
//! This module ties the core together. `ConversationAgent` is the
//! process-scoped context object: it owns the conversation memory, the
//! orchestrator, the continuation table, and the usage metrics, and hands
//! them to each turn by injection. One inbound operation exists:
//! [`ConversationAgent::process_turn`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌─────────────┐
//! │ process_turn │────>│ Orchestrator │────>│ ChatBackend │
//! │  (caller)    │     │  (tool loop) │     │ (endpoint)  │
//! └──────────────┘     └──────────────┘     └─────────────┘
//!        │                    │
//!        ▼                    ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Continuation │     │ Conversation │     │ActionHandler │
//! │    Table     │     │    Memory    │     │ (local layer)│
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! Exactly one of {synchronous answer, interim + later notification} is
//! produced per user turn.

mod continuation;
mod orchestrator;

pub use continuation::{parse_wait_seconds, ContinuationTable, LogNotifier, Notifier};
pub use orchestrator::{Orchestrator, RunOutput, RunStatus};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::client::ChatBackend;
use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::memory::{ConversationMemory, WindowStats};
use crate::stats::UsageMetrics;
use crate::tools::{ActionHandler, CapabilitySnapshot};

/// Fallback when the model produced no text at all.
const EMPTY_RESPONSE_MESSAGE: &str = "No textual response was received from the model.";

/// Shown when a detached run died before producing an answer.
const TASK_FAILED_MESSAGE: &str = "The background request failed or was cancelled.";

fn interim_message(seconds: u64) -> String {
    format!(
        "No answer within {}s. Reply with a number of seconds to keep waiting (e.g. 15), \
         or any other text to wait for the answer.",
        seconds
    )
}

fn still_waiting_message(seconds: u64) -> String {
    format!(
        "Still no answer after {}s. Reply with more seconds to continue, \
         or any other text to wait for the answer.",
        seconds
    )
}

fn non_empty(text: String) -> String {
    if text.trim().is_empty() {
        EMPTY_RESPONSE_MESSAGE.to_string()
    } else {
        text
    }
}

/// Result of one inbound turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The final answer, produced synchronously
    Answer { speech: String },
    /// The run outlived the early deadline; the answer arrives later
    /// through the notification side channel
    Interim {
        text: String,
        continuation: String,
    },
}

impl TurnOutcome {
    /// The text to present for this turn, whichever variant.
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Answer { speech } => speech,
            TurnOutcome::Interim { text, .. } => text,
        }
    }
}

/// The process-scoped conversation agent.
///
/// All global mutable state (windows, schema cache, metrics, pending
/// continuations) lives behind this object with an explicit init/reset
/// lifecycle; components receive it by injection, never through an
/// implicit global.
pub struct ConversationAgent {
    config: Config,
    memory: Arc<ConversationMemory>,
    orchestrator: Arc<Orchestrator>,
    continuations: Arc<ContinuationTable>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<UsageMetrics>,
    /// Serializes turns per conversation id; distinct conversations
    /// proceed independently
    conversation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stop_signals: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl ConversationAgent {
    /// Wire up an agent from configuration and the external
    /// collaborators: the model backend, the local action layer, and the
    /// notification side channel.
    ///
    /// Fails fast on invalid configuration.
    pub fn new(
        config: Config,
        backend: Arc<dyn ChatBackend>,
        handler: Arc<dyn ActionHandler>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let memory = Arc::new(ConversationMemory::new(
            config.window.max_tokens,
            config.window.preserve_system,
        ));
        let metrics = Arc::new(UsageMetrics::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator.clone(),
            &config.tools,
            config.endpoint.tool_result_role,
            Arc::clone(&memory),
            backend,
            handler,
            Arc::clone(&metrics),
        ));

        info!(
            model = %config.endpoint.model,
            window_tokens = config.window.max_tokens,
            max_iterations = config.orchestrator.max_iterations,
            "Conversation agent initialized"
        );

        Ok(Self {
            config,
            memory,
            orchestrator,
            continuations: Arc::new(ContinuationTable::new()),
            notifier,
            metrics,
            conversation_locks: Mutex::new(HashMap::new()),
            stop_signals: Mutex::new(HashMap::new()),
        })
    }

    /// Process one user turn.
    ///
    /// Returns either the final answer or, when the run outlives the
    /// early deadline, an interim reply while orchestration continues in
    /// the background. A turn for a conversation with a pending detached
    /// run is treated as a continuation of that run.
    pub async fn process_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        capabilities: &CapabilitySnapshot,
    ) -> Result<TurnOutcome> {
        // Serialize turns for the same conversation id
        let conversation_lock = {
            let mut locks = self.conversation_locks.lock().await;
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = conversation_lock.lock().await;

        let request_id = Uuid::new_v4();
        let span = info_span!(
            "turn",
            request_id = %request_id,
            conversation_id = conversation_id,
        );

        async {
            self.metrics.record_turn();
            self.continuations.reap_expired().await;

            if self.continuations.is_pending(conversation_id).await {
                return self.handle_continuation(conversation_id, user_text).await;
            }

            let (stop_tx, stop_rx) = watch::channel(false);
            self.stop_signals
                .lock()
                .await
                .insert(conversation_id.to_string(), stop_tx);

            if !self.config.orchestrator.early_continuation {
                let output = self
                    .orchestrator
                    .run(conversation_id, user_text, capabilities, stop_rx)
                    .await?;
                return Ok(TurnOutcome::Answer {
                    speech: non_empty(output.text),
                });
            }

            self.run_with_early_deadline(conversation_id, user_text, capabilities, stop_rx)
                .await
        }
        .instrument(span)
        .await
    }

    /// Race the run against the early deadline, detaching it when the
    /// deadline fires first.
    async fn run_with_early_deadline(
        &self,
        conversation_id: &str,
        user_text: &str,
        capabilities: &CapabilitySnapshot,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<TurnOutcome> {
        // Pending entries outlive the longest possible run, with slack
        // for the user to come back and ask
        let ttl = Duration::from_secs(self.config.orchestrator.run_timeout_secs + 120);
        let (token, mut done_rx) = self.continuations.register(conversation_id, ttl).await;

        let orchestrator = Arc::clone(&self.orchestrator);
        let continuations = Arc::clone(&self.continuations);
        let notifier = Arc::clone(&self.notifier);
        let conversation = conversation_id.to_string();
        let text = user_text.to_string();
        let capabilities = capabilities.clone();

        tokio::spawn(async move {
            let outcome = orchestrator
                .run(&conversation, &text, &capabilities, stop_rx)
                .await;

            let final_text = match &outcome {
                Ok(output) => non_empty(output.text.clone()),
                Err(err) => {
                    error!(
                        conversation_id = %conversation,
                        error = %err,
                        "Detached run failed"
                    );
                    format!("The request failed: {}", err)
                }
            };

            // The table decides atomically whether the caller is still
            // waiting or the side channel must carry the answer
            if let Some(text) = continuations.finish(&conversation, outcome, final_text).await {
                notifier.deliver(&conversation, &text).await;
            }
        });

        let early = Duration::from_secs(self.config.orchestrator.early_deadline_secs);
        match tokio::time::timeout(early, done_rx.changed()).await {
            Ok(Ok(())) => match self.continuations.claim(conversation_id).await {
                Some(result) => {
                    let output = result?;
                    Ok(TurnOutcome::Answer {
                        speech: non_empty(output.text),
                    })
                }
                None => {
                    self.metrics.record_error();
                    Err(AgentError::Protocol(
                        "orchestration result vanished before it could be claimed".into(),
                    ))
                }
            },
            Ok(Err(_)) => {
                // The entry was removed (reset) while we waited
                self.metrics.record_error();
                Ok(TurnOutcome::Answer {
                    speech: TASK_FAILED_MESSAGE.to_string(),
                })
            }
            Err(_) => match self.continuations.detach(conversation_id).await {
                // The run completed in the race window: still synchronous
                Some(result) => {
                    let output = result?;
                    Ok(TurnOutcome::Answer {
                        speech: non_empty(output.text),
                    })
                }
                None => {
                    self.metrics.record_interim();
                    info!(
                        conversation_id = conversation_id,
                        deadline_secs = self.config.orchestrator.early_deadline_secs,
                        "Early deadline fired, continuing in background"
                    );
                    Ok(TurnOutcome::Interim {
                        text: interim_message(self.config.orchestrator.early_deadline_secs),
                        continuation: token,
                    })
                }
            },
        }
    }

    /// Handle a follow-up turn for a conversation with a pending
    /// detached run.
    async fn handle_continuation(
        &self,
        conversation_id: &str,
        user_text: &str,
    ) -> Result<TurnOutcome> {
        // The answer may already be cached
        if let Some(result) = self.continuations.claim(conversation_id).await {
            let output = result?;
            return Ok(TurnOutcome::Answer {
                speech: non_empty(output.text),
            });
        }

        let Some(mut done_rx) = self.continuations.subscribe(conversation_id).await else {
            return Ok(TurnOutcome::Answer {
                speech: TASK_FAILED_MESSAGE.to_string(),
            });
        };

        // The run may have finished between the claim and the subscribe;
        // a subscriber never sees that earlier signal
        if *done_rx.borrow() {
            return match self.continuations.claim(conversation_id).await {
                Some(result) => {
                    let output = result?;
                    Ok(TurnOutcome::Answer {
                        speech: non_empty(output.text),
                    })
                }
                None => Ok(TurnOutcome::Answer {
                    speech: TASK_FAILED_MESSAGE.to_string(),
                }),
            };
        }

        let wait = parse_wait_seconds(user_text);
        info!(
            conversation_id = conversation_id,
            bounded_secs = wait,
            "Continuation turn waiting for the detached run"
        );

        let completion = match wait {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs(seconds), done_rx.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => {
                        return Ok(TurnOutcome::Answer {
                            speech: still_waiting_message(seconds),
                        })
                    }
                }
            }
            None => done_rx.changed().await,
        };

        if completion.is_err() {
            // The entry was removed while we waited (reset)
            self.continuations.remove(conversation_id).await;
            return Ok(TurnOutcome::Answer {
                speech: TASK_FAILED_MESSAGE.to_string(),
            });
        }

        match self.continuations.claim(conversation_id).await {
            Some(result) => {
                let output = result?;
                Ok(TurnOutcome::Answer {
                    speech: non_empty(output.text),
                })
            }
            None => Ok(TurnOutcome::Answer {
                speech: TASK_FAILED_MESSAGE.to_string(),
            }),
        }
    }

    /// Signal the current run for a conversation to stop. In-flight
    /// network and tool work is abandoned; appended messages stay.
    pub async fn stop(&self, conversation_id: &str) {
        if let Some(stop_tx) = self.stop_signals.lock().await.get(conversation_id) {
            let _ = stop_tx.send(true);
            info!(conversation_id = conversation_id, "Stop signal sent");
        }
    }

    /// Destroy a conversation's state: window, pending continuation, and
    /// stop channel.
    pub async fn reset(&self, conversation_id: &str) {
        self.memory.reset(conversation_id).await;
        self.continuations.remove(conversation_id).await;
        self.stop_signals.lock().await.remove(conversation_id);
    }

    /// Window statistics for a conversation.
    pub async fn stats(&self, conversation_id: &str) -> WindowStats {
        self.memory.stats(conversation_id).await
    }

    /// Drop the cached tool schemas so the next turn rebuilds them.
    pub async fn invalidate_schemas(&self) {
        self.orchestrator.schema_cache().invalidate().await;
    }

    /// The conversation memory.
    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    /// The usage metrics.
    pub fn metrics(&self) -> &Arc<UsageMetrics> {
        &self.metrics
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ModelReply, WireMessage};
    use crate::tools::{ActionOutcome, ParsedAction, ToolSchema};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct DelayedBackend {
        delay: Duration,
        reply: String,
    }

    #[async_trait]
    impl ChatBackend for DelayedBackend {
        async fn complete(
            &self,
            _messages: Vec<WireMessage>,
            _tools: &[ToolSchema],
        ) -> Result<ModelReply> {
            tokio::time::sleep(self.delay).await;
            Ok(ModelReply::text(&self.reply))
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl ActionHandler for NoopHandler {
        async fn execute(&self, _action: &ParsedAction) -> Result<ActionOutcome> {
            Ok(ActionOutcome::success("ok"))
        }
    }

    struct CountingNotifier {
        delivered: AtomicUsize,
        last: StdMutex<Option<String>>,
    }

    impl CountingNotifier {
        fn new() -> Self {
            Self {
                delivered: AtomicUsize::new(0),
                last: StdMutex::new(None),
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

    fn agent_with(
        backend: Arc<dyn ChatBackend>,
        notifier: Arc<CountingNotifier>,
        early_deadline_secs: u64,
    ) -> ConversationAgent {
        let mut config = Config::default();
        config.orchestrator.early_deadline_secs = early_deadline_secs;
        ConversationAgent::new(config, backend, Arc::new(NoopHandler), notifier).unwrap()
    }

    #[tokio::test]
    async fn test_fast_answer_is_synchronous() {
        let notifier = Arc::new(CountingNotifier::new());
        let agent = agent_with(
            Arc::new(DelayedBackend {
                delay: Duration::from_millis(0),
                reply: "Hello!".into(),
            }),
            Arc::clone(&notifier),
            5,
        );

        let outcome = agent
            .process_turn("conv", "hi", &CapabilitySnapshot::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Answer {
                speech: "Hello!".to_string()
            }
        );
        // Synchronous answer means no notification, ever
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(notifier.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_answer_gets_fallback_text() {
        let notifier = Arc::new(CountingNotifier::new());
        let agent = agent_with(
            Arc::new(DelayedBackend {
                delay: Duration::from_millis(0),
                reply: "   ".into(),
            }),
            Arc::clone(&notifier),
            5,
        );

        let outcome = agent
            .process_turn("conv", "hi", &CapabilitySnapshot::new())
            .await
            .unwrap();
        assert_eq!(outcome.text(), EMPTY_RESPONSE_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_run_produces_interim_then_notification() {
        let notifier = Arc::new(CountingNotifier::new());
        let agent = agent_with(
            Arc::new(DelayedBackend {
                delay: Duration::from_secs(30),
                reply: "Late answer".into(),
            }),
            Arc::clone(&notifier),
            2,
        );

        let outcome = agent
            .process_turn("conv", "hard question", &CapabilitySnapshot::new())
            .await
            .unwrap();

        match &outcome {
            TurnOutcome::Interim { text, continuation } => {
                assert!(text.contains("2s"));
                assert!(!continuation.is_empty());
            }
            other => panic!("expected interim, got {:?}", other),
        }

        // Let the detached run finish; the answer goes out the side
        // channel exactly once
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(notifier.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(
            notifier.last.lock().unwrap().as_deref(),
            Some("Late answer")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_turn_waits_for_answer() {
        let notifier = Arc::new(CountingNotifier::new());
        let agent = agent_with(
            Arc::new(DelayedBackend {
                delay: Duration::from_secs(10),
                reply: "Eventually".into(),
            }),
            Arc::clone(&notifier),
            1,
        );

        let first = agent
            .process_turn("conv", "question", &CapabilitySnapshot::new())
            .await
            .unwrap();
        assert!(matches!(first, TurnOutcome::Interim { .. }));

        // Non-numeric follow-up waits until the run completes
        let second = agent
            .process_turn("conv", "keep waiting", &CapabilitySnapshot::new())
            .await
            .unwrap();
        assert_eq!(
            second,
            TurnOutcome::Answer {
                speech: "Eventually".to_string()
            }
        );

        // Claimed by the follow-up turn: no lingering pending state
        let third = agent
            .process_turn("conv", "thanks", &CapabilitySnapshot::new())
            .await
            .unwrap();
        assert!(matches!(third, TurnOutcome::Answer { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_bounded_wait_still_pending() {
        let notifier = Arc::new(CountingNotifier::new());
        let agent = agent_with(
            Arc::new(DelayedBackend {
                delay: Duration::from_secs(100),
                reply: "Very late".into(),
            }),
            Arc::clone(&notifier),
            1,
        );

        let first = agent
            .process_turn("conv", "question", &CapabilitySnapshot::new())
            .await
            .unwrap();
        assert!(matches!(first, TurnOutcome::Interim { .. }));

        // "5" waits five more seconds, then reports still-working
        let second = agent
            .process_turn("conv", "5", &CapabilitySnapshot::new())
            .await
            .unwrap();
        assert!(second.text().contains("Still no answer after 5s"));
    }

    #[tokio::test]
    async fn test_reset_clears_conversation() {
        let notifier = Arc::new(CountingNotifier::new());
        let agent = agent_with(
            Arc::new(DelayedBackend {
                delay: Duration::from_millis(0),
                reply: "Hi".into(),
            }),
            Arc::clone(&notifier),
            5,
        );

        agent
            .process_turn("conv", "hello", &CapabilitySnapshot::new())
            .await
            .unwrap();
        assert!(agent.stats("conv").await.exists);

        agent.reset("conv").await;
        let stats = agent.stats("conv").await;
        assert!(!stats.exists);
        assert_eq!(stats.message_count, 0);
        assert_eq!(stats.current_tokens, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let mut config = Config::default();
        config.window.max_tokens = 0;
        let result = ConversationAgent::new(
            config,
            Arc::new(DelayedBackend {
                delay: Duration::from_millis(0),
                reply: "x".into(),
            }),
            Arc::new(NoopHandler),
            Arc::new(CountingNotifier::new()),
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_concurrent_conversations_proceed_independently() {
        let notifier = Arc::new(CountingNotifier::new());
        let agent = Arc::new(agent_with(
            Arc::new(DelayedBackend {
                delay: Duration::from_millis(10),
                reply: "answer".into(),
            }),
            Arc::clone(&notifier),
            5,
        ));

        let mut handles = Vec::new();
        for i in 0..4 {
            let agent = Arc::clone(&agent);
            handles.push(tokio::spawn(async move {
                agent
                    .process_turn(
                        &format!("conv-{}", i),
                        "hello",
                        &CapabilitySnapshot::new(),
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.text(), "answer");
        }
        assert_eq!(agent.metrics().snapshot().turns, 4);
    }
}
