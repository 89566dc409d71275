//! Tool-call orchestration loop.
//!
//! Drives the multi-turn exchange with the stateless model: send the full
//! window snapshot, inspect the reply for requested tool calls, validate
//! and execute them, append one result per call, and repeat until the
//! model produces a final textual answer or a bound trips. The
//! orchestrator owns no shared mutable state outside one run; everything
//! durable lives in the conversation window.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{ChatBackend, WireMessage};
use crate::config::{OrchestratorConfig, ToolResultRole, ToolsConfig};
use crate::error::{AgentError, Result};
use crate::memory::{ConversationMemory, MessageDraft, Role};
use crate::stats::UsageMetrics;
use crate::tools::{
    ActionDispatcher, ActionHandler, CapabilitySnapshot, ExecutableCall, SchemaCache, ToolValidator,
    Verdict,
};

/// Base system prompt; the capability summary is appended per turn.
const SYSTEM_PROMPT: &str = "You are a conversational assistant for a smart home. \
Respond concisely and usefully. Use the available tools to act on the home; \
never invent devices or states you do not know. If a request is not about \
the home, still answer helpfully.";

/// How one run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The model produced a final textual answer
    Completed,
    /// The iteration bound tripped; the text is the last partial answer
    MaxIterations,
    /// The run deadline or a model-call timeout tripped; partial answer
    TimedOut,
    /// An explicit stop signal arrived; partial answer
    Stopped,
}

/// Result of one orchestration run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Final or best partial answer text (possibly empty)
    pub text: String,
    pub status: RunStatus,
    /// Model/tool round trips performed
    pub iterations: u32,
}

/// The orchestration engine.
///
/// One instance serves the whole process; each [`Orchestrator::run`] call
/// is an independent run for one user turn. Per-conversation
/// serialization is the caller's job.
pub struct Orchestrator {
    config: OrchestratorConfig,
    tool_result_role: ToolResultRole,
    memory: Arc<ConversationMemory>,
    backend: Arc<dyn ChatBackend>,
    validator: ToolValidator,
    schema_cache: SchemaCache,
    dispatcher: ActionDispatcher,
    handler: Arc<dyn ActionHandler>,
    metrics: Arc<UsageMetrics>,
}

impl Orchestrator {
    /// Wire up an orchestrator from configuration and collaborators.
    pub fn new(
        config: OrchestratorConfig,
        tools_config: &ToolsConfig,
        tool_result_role: ToolResultRole,
        memory: Arc<ConversationMemory>,
        backend: Arc<dyn ChatBackend>,
        handler: Arc<dyn ActionHandler>,
        metrics: Arc<UsageMetrics>,
    ) -> Self {
        Self {
            config,
            tool_result_role,
            memory,
            backend,
            validator: ToolValidator::new(
                &tools_config.allowed_domains,
                &tools_config.denied_actions,
                tools_config.max_calls_per_minute,
            ),
            schema_cache: SchemaCache::new(Duration::from_secs(tools_config.schema_cache_ttl_secs)),
            dispatcher: ActionDispatcher::new(
                tools_config.parallel_execution,
                Duration::from_secs(tools_config.call_timeout_secs),
            ),
            handler,
            metrics,
        }
    }

    /// The schema cache, for invalidation when capabilities change.
    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    /// Drive one user turn to completion.
    ///
    /// `stop_rx` carries the explicit cancellation signal; flipping it to
    /// `true` aborts the in-flight model call and skips further tool
    /// executions while leaving already-appended messages intact.
    pub async fn run(
        &self,
        conversation_id: &str,
        user_text: &str,
        capabilities: &CapabilitySnapshot,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<RunOutput> {
        let run_id = Uuid::new_v4();
        let started_at = Instant::now();
        let deadline = started_at + Duration::from_secs(self.config.run_timeout_secs);

        info!(
            run_id = %run_id,
            conversation_id = conversation_id,
            "Orchestration run started"
        );

        // Declared schemas for this turn; their cost is reserved in every
        // window so the budget check below is honest
        let schemas = self.schema_cache.get_or_build(capabilities).await;
        let schema_tokens = self.memory.estimator().schema_cost(&schemas);
        self.memory.set_base_schema_tokens(schema_tokens).await?;

        // Mandatory context: if this fails the window is misconfigured
        // and the operator has to hear about it
        self.memory
            .set_system_prompt(conversation_id, &self.build_system_prompt(capabilities))
            .await?;
        self.memory
            .append(conversation_id, Role::User, user_text, HashSet::new())
            .await?;

        let mut last_text = String::new();
        let mut iteration: u32 = 0;

        loop {
            if iteration >= self.config.max_iterations {
                warn!(
                    run_id = %run_id,
                    iterations = iteration,
                    "Iteration bound reached without a final answer"
                );
                self.metrics.record_error();
                return Ok(RunOutput {
                    text: last_text,
                    status: RunStatus::MaxIterations,
                    iterations: iteration,
                });
            }
            if *stop_rx.borrow() {
                return Ok(self.stopped(run_id, last_text, iteration));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(self.timed_out(run_id, last_text, iteration));
            }
            iteration += 1;

            // Re-snapshot the window so the stateless model receives the
            // full accumulated context, never partial state
            let snapshot = self.memory.snapshot(conversation_id, None).await;
            let wire: Vec<WireMessage> = snapshot
                .iter()
                .map(|m| WireMessage::from_history(m, self.tool_result_role))
                .collect();

            debug!(
                run_id = %run_id,
                iteration = iteration,
                messages = wire.len(),
                "Calling model"
            );

            let reply = tokio::select! {
                _ = stop_rx.changed() => {
                    return Ok(self.stopped(run_id, last_text, iteration));
                }
                outcome = tokio::time::timeout(remaining, self.backend.complete(wire, &schemas)) => {
                    match outcome {
                        Ok(Ok(reply)) => reply,
                        Ok(Err(AgentError::Timeout(detail))) => {
                            warn!(run_id = %run_id, detail = %detail, "Model call timed out");
                            return Ok(self.timed_out(run_id, last_text, iteration));
                        }
                        Ok(Err(err)) => {
                            error!(run_id = %run_id, error = %err, "Model call failed");
                            self.metrics.record_error();
                            return Err(err);
                        }
                        Err(_) => {
                            return Ok(self.timed_out(run_id, last_text, iteration));
                        }
                    }
                }
            };

            if let Some(usage) = &reply.usage {
                self.metrics
                    .record_tokens(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            }
            if !reply.content.is_empty() {
                last_text = reply.content.clone();
            }

            if !reply.has_tool_calls() {
                self.memory
                    .append(conversation_id, Role::Assistant, &reply.content, HashSet::new())
                    .await?;
                info!(
                    run_id = %run_id,
                    iterations = iteration,
                    latency_ms = started_at.elapsed().as_millis() as u64,
                    "Orchestration run completed"
                );
                return Ok(RunOutput {
                    text: reply.content,
                    status: RunStatus::Completed,
                    iterations: iteration,
                });
            }

            // Record the request before results, so the window replays
            // the exchange in order
            self.memory
                .append_draft(
                    conversation_id,
                    MessageDraft::assistant_with_calls(&reply.content, reply.tool_calls.clone()),
                )
                .await?;
            self.metrics.record_tool_calls(reply.tool_calls.len() as u64);

            // Validate every call; rejected ones become structured error
            // results so the model can self-correct
            let mut results: Vec<Option<(String, String)>> = vec![None; reply.tool_calls.len()];
            let mut executable = Vec::new();
            for (index, call) in reply.tool_calls.iter().enumerate() {
                match self.validator.validate(call, capabilities) {
                    Verdict::Accepted(action) => executable.push(ExecutableCall {
                        index,
                        call_id: call.id.clone(),
                        action,
                    }),
                    Verdict::Rejected(reason) => {
                        self.metrics.record_rejected_call();
                        let content = serde_json::json!({
                            "status": "error",
                            "error": reason.to_string(),
                        })
                        .to_string();
                        results[index] = Some((call.id.clone(), content));
                    }
                }
            }

            if *stop_rx.borrow() {
                return Ok(self.stopped(run_id, last_text, iteration));
            }

            for executed in self.dispatcher.run(executable, &self.handler).await {
                results[executed.index] = Some((executed.call_id, executed.content));
            }

            // Append in call-index order regardless of execution order
            for (call_id, content) in results.into_iter().flatten() {
                self.memory
                    .append_draft(
                        conversation_id,
                        MessageDraft::tool_result(Role::Tool, &call_id, &content),
                    )
                    .await?;
            }
        }
    }

    fn build_system_prompt(&self, capabilities: &CapabilitySnapshot) -> String {
        if capabilities.domains.is_empty() {
            return SYSTEM_PROMPT.to_string();
        }
        let domains: Vec<&str> = capabilities.domains.keys().map(|d| d.as_str()).collect();
        format!(
            "{}\n\nControllable domains: {}.",
            SYSTEM_PROMPT,
            domains.join(", ")
        )
    }

    fn stopped(&self, run_id: Uuid, text: String, iterations: u32) -> RunOutput {
        info!(run_id = %run_id, iterations = iterations, "Orchestration run stopped");
        RunOutput {
            text,
            status: RunStatus::Stopped,
            iterations,
        }
    }

    fn timed_out(&self, run_id: Uuid, text: String, iterations: u32) -> RunOutput {
        warn!(run_id = %run_id, iterations = iterations, "Orchestration run timed out");
        self.metrics.record_error();
        RunOutput {
            text,
            status: RunStatus::TimedOut,
            iterations,
        }
    }
}
