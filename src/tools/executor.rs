//! Action dispatch.
//!
//! Runs validated tool calls against the local action layer, sequentially
//! or concurrently per configuration. Concurrent execution joins all calls
//! of one model turn and returns results in call-index order, so the
//! conversation window sees the same ordering either way. Per-call
//! timeouts degrade to structured error outcomes; the turn never aborts
//! because one action hung.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info};

use super::types::{ActionHandler, ActionOutcome, ParsedAction};

/// One accepted call ready for dispatch.
#[derive(Debug, Clone)]
pub struct ExecutableCall {
    /// Position of the call within the model turn
    pub index: usize,
    /// Call id echoed back in the tool result
    pub call_id: String,
    pub action: ParsedAction,
}

/// Result of dispatching one call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub index: usize,
    pub call_id: String,
    /// Structured JSON payload for the tool-result message
    pub content: String,
    pub success: bool,
}

/// Dispatcher for the accepted calls of one model turn.
pub struct ActionDispatcher {
    parallel: bool,
    call_timeout: Duration,
}

impl ActionDispatcher {
    /// Create a dispatcher.
    ///
    /// # Arguments
    /// * `parallel` - dispatch all calls of a turn together instead of
    ///   one at a time
    /// * `call_timeout` - per-call execution budget
    pub fn new(parallel: bool, call_timeout: Duration) -> Self {
        Self {
            parallel,
            call_timeout,
        }
    }

    /// Execute all calls, returning results in call-index order.
    pub async fn run(
        &self,
        calls: Vec<ExecutableCall>,
        handler: &Arc<dyn ActionHandler>,
    ) -> Vec<ExecutionResult> {
        if calls.is_empty() {
            return Vec::new();
        }

        info!(
            calls = calls.len(),
            parallel = self.parallel,
            "Dispatching tool calls"
        );

        if self.parallel {
            let futures: Vec<_> = calls
                .into_iter()
                .map(|call| self.run_one(call, Arc::clone(handler)))
                .collect();
            // join_all preserves input order, which is call-index order
            join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.run_one(call, Arc::clone(handler)).await);
            }
            results
        }
    }

    async fn run_one(
        &self,
        call: ExecutableCall,
        handler: Arc<dyn ActionHandler>,
    ) -> ExecutionResult {
        let outcome =
            match tokio::time::timeout(self.call_timeout, handler.execute(&call.action)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    error!(
                        call_id = %call.call_id,
                        domain = %call.action.domain,
                        action = %call.action.action,
                        error = %err,
                        "Action execution failed"
                    );
                    ActionOutcome::error(err.to_string())
                }
                Err(_) => {
                    error!(
                        call_id = %call.call_id,
                        domain = %call.action.domain,
                        action = %call.action.action,
                        timeout_secs = self.call_timeout.as_secs(),
                        "Action execution timed out"
                    );
                    ActionOutcome::error(format!(
                        "execution timed out after {}s",
                        self.call_timeout.as_secs()
                    ))
                }
            };

        let success = matches!(outcome.status, super::types::ActionStatus::Success);
        ExecutionResult {
            content: outcome.to_payload(&call.action),
            index: call.index,
            call_id: call.call_id,
            success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, Result};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn action(domain: &str, name: &str) -> ParsedAction {
        ParsedAction {
            domain: domain.to_string(),
            action: name.to_string(),
            targets: vec![format!("{}.device", domain)],
            parameters: Map::new(),
        }
    }

    fn call(index: usize, domain: &str, name: &str) -> ExecutableCall {
        ExecutableCall {
            index,
            call_id: format!("call_{}", index),
            action: action(domain, name),
        }
    }

    /// Handler that succeeds after an optional per-domain delay.
    struct SlowHandler {
        delay_ms: u64,
        executed: AtomicUsize,
    }

    #[async_trait]
    impl ActionHandler for SlowHandler {
        async fn execute(&self, action: &ParsedAction) -> Result<ActionOutcome> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(ActionOutcome::success(format!(
                "{}.{} done",
                action.domain, action.action
            )))
        }
    }

    /// Handler that fails for one domain and succeeds for the rest.
    struct FlakyHandler;

    #[async_trait]
    impl ActionHandler for FlakyHandler {
        async fn execute(&self, action: &ParsedAction) -> Result<ActionOutcome> {
            if action.domain == "cover" {
                Err(AgentError::Action("device unreachable".into()))
            } else {
                Ok(ActionOutcome::success("ok"))
            }
        }
    }

    #[tokio::test]
    async fn test_sequential_execution_in_order() {
        let handler: Arc<dyn ActionHandler> = Arc::new(SlowHandler {
            delay_ms: 0,
            executed: AtomicUsize::new(0),
        });
        let dispatcher = ActionDispatcher::new(false, Duration::from_secs(5));

        let results = dispatcher
            .run(
                vec![
                    call(0, "light", "turn_on"),
                    call(1, "switch", "toggle"),
                    call(2, "fan", "turn_off"),
                ],
                &handler,
            )
            .await;

        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert!(result.success);
        }
    }

    #[tokio::test]
    async fn test_parallel_execution_preserves_index_order() {
        let handler: Arc<dyn ActionHandler> = Arc::new(SlowHandler {
            delay_ms: 10,
            executed: AtomicUsize::new(0),
        });
        let dispatcher = ActionDispatcher::new(true, Duration::from_secs(5));

        let results = dispatcher
            .run(
                (0..6).map(|i| call(i, "light", "turn_on")).collect(),
                &handler,
            )
            .await;

        let indexes: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_structured_result() {
        let handler: Arc<dyn ActionHandler> = Arc::new(FlakyHandler);
        let dispatcher = ActionDispatcher::new(false, Duration::from_secs(5));

        let results = dispatcher
            .run(
                vec![call(0, "light", "turn_on"), call(1, "cover", "open")],
                &handler,
            )
            .await;

        assert!(results[0].success);
        assert!(!results[1].success);
        let payload: serde_json::Value = serde_json::from_str(&results[1].content).unwrap();
        assert_eq!(payload["status"], "error");
        assert!(payload["detail"].as_str().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_per_call_timeout_degrades() {
        let handler: Arc<dyn ActionHandler> = Arc::new(SlowHandler {
            delay_ms: 200,
            executed: AtomicUsize::new(0),
        });
        let dispatcher = ActionDispatcher::new(false, Duration::from_millis(20));

        let results = dispatcher.run(vec![call(0, "light", "turn_on")], &handler).await;

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let handler: Arc<dyn ActionHandler> = Arc::new(FlakyHandler);
        let dispatcher = ActionDispatcher::new(true, Duration::from_secs(1));
        assert!(dispatcher.run(vec![], &handler).await.is_empty());
    }
}
