//! Background continuation.
//!
//! When a run outlives the early deadline, the caller gets an interim
//! reply and the run keeps going detached. The eventual result is cached
//! here, keyed by conversation id, and delivered exactly once through the
//! notification side channel. A follow-up turn for a pending conversation
//! is a continuation: a bare number means "wait that many more seconds",
//! anything else waits for the answer.
//!
//! The table is the single arbiter of the exactly-once contract. Both the
//! caller's deadline decision ([`ContinuationTable::detach`]) and the
//! run's completion ([`ContinuationTable::finish`]) happen under the
//! table lock, so a result can never fall between the synchronous path
//! and the side channel, and never travels down both.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;

use super::orchestrator::RunOutput;

/// Fire-and-forget delivery of a late final answer to the presentation
/// layer.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, conversation_id: &str, final_text: &str);
}

/// Default notifier: a structured log line. Deployments plug in their
/// own presentation channel.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, conversation_id: &str, final_text: &str) {
        info!(
            conversation_id = conversation_id,
            response_len = final_text.len(),
            "Delivering background answer"
        );
    }
}

/// Clamp bounds for "wait N more seconds" continuations.
const MIN_WAIT_SECS: u64 = 1;
const MAX_WAIT_SECS: u64 = 600;

/// Parse a continuation turn that is a bare number as a wait request.
pub fn parse_wait_seconds(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: u64 = trimmed.parse().ok()?;
    Some(value.clamp(MIN_WAIT_SECS, MAX_WAIT_SECS))
}

struct PendingEntry {
    /// Opaque token handed back with the interim reply
    continuation_token: String,
    /// The caller gave up waiting; completion goes to the side channel
    detached: bool,
    notified: bool,
    /// The run's outcome, once it finished
    result: Option<Result<RunOutput>>,
    /// Flipped to true when the result lands
    done_tx: watch::Sender<bool>,
    expires_at: Instant,
}

/// Table of possibly-detached runs, keyed by conversation id.
pub struct ContinuationTable {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ContinuationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a run that may outlive its caller. Returns the
    /// continuation token and a receiver that fires when the run
    /// finishes.
    pub async fn register(
        &self,
        conversation_id: &str,
        ttl: Duration,
    ) -> (String, watch::Receiver<bool>) {
        let token = Uuid::new_v4().to_string();
        let (done_tx, done_rx) = watch::channel(false);
        let mut pending = self.pending.lock().await;
        pending.insert(
            conversation_id.to_string(),
            PendingEntry {
                continuation_token: token.clone(),
                detached: false,
                notified: false,
                result: None,
                done_tx,
                expires_at: Instant::now() + ttl,
            },
        );
        (token, done_rx)
    }

    /// Whether a conversation has a pending run.
    pub async fn is_pending(&self, conversation_id: &str) -> bool {
        self.pending.lock().await.contains_key(conversation_id)
    }

    /// Remove an entry without delivering anything.
    pub async fn remove(&self, conversation_id: &str) {
        self.pending.lock().await.remove(conversation_id);
    }

    /// Record a run's completion.
    ///
    /// Returns `Some(final_text)` when the caller already detached and
    /// the text must go out through the notifier, exactly once. Returns
    /// `None` when the caller is still waiting (it will claim the
    /// result) or the entry is gone.
    pub async fn finish(
        &self,
        conversation_id: &str,
        outcome: Result<RunOutput>,
        final_text: String,
    ) -> Option<String> {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(conversation_id) {
            Some(entry) if entry.result.is_none() => {
                entry.result = Some(outcome);
                let _ = entry.done_tx.send(true);
                if entry.detached && !entry.notified {
                    entry.notified = true;
                    Some(final_text)
                } else {
                    None
                }
            }
            Some(_) => None,
            None => {
                debug!(
                    conversation_id = conversation_id,
                    "Run completed after its entry was removed"
                );
                None
            }
        }
    }

    /// The caller's early deadline fired.
    ///
    /// Normally marks the entry detached and returns `None` (interim
    /// path). When the run completed in the race window, the entry is
    /// consumed and the result returned so the caller can still answer
    /// synchronously.
    pub async fn detach(&self, conversation_id: &str) -> Option<Result<RunOutput>> {
        let mut pending = self.pending.lock().await;
        let entry = pending.get_mut(conversation_id)?;
        if entry.result.is_some() {
            return pending.remove(conversation_id).and_then(|e| e.result);
        }
        entry.detached = true;
        None
    }

    /// Take a completed result, consuming the entry. `None` while the
    /// run is still going (or the entry is gone).
    pub async fn claim(&self, conversation_id: &str) -> Option<Result<RunOutput>> {
        let mut pending = self.pending.lock().await;
        if pending
            .get(conversation_id)
            .map(|e| e.result.is_some())
            .unwrap_or(false)
        {
            return pending.remove(conversation_id).and_then(|e| e.result);
        }
        None
    }

    /// Subscribe to an entry's completion signal.
    pub async fn subscribe(&self, conversation_id: &str) -> Option<watch::Receiver<bool>> {
        let pending = self.pending.lock().await;
        pending
            .get(conversation_id)
            .map(|e| e.done_tx.subscribe())
    }

    /// The continuation token of a pending entry.
    pub async fn token(&self, conversation_id: &str) -> Option<String> {
        let pending = self.pending.lock().await;
        pending
            .get(conversation_id)
            .map(|e| e.continuation_token.clone())
    }

    /// Drop expired entries.
    pub async fn reap_expired(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.expires_at > now);
        let reaped = before - pending.len();
        if reaped > 0 {
            warn!(reaped = reaped, "Reaped expired continuation entries");
        }
    }

    /// Number of pending entries.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

impl Default for ContinuationTable {
    fn default() -> Self {
        Self::new()
    }
}
