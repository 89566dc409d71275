//! Delta-frame stream parsing.
//!
//! The streaming wire shape is a sequence of `data: {...}` framed partial
//! updates terminated by a `data: [DONE]` sentinel. Text arrives as
//! content deltas; tool calls arrive as per-index fragments whose id and
//! name usually come first and whose argument text may be split across
//! many frames. A malformed frame is logged and skipped; it never aborts
//! the stream.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::tools::ToolCall;

use super::types::{FinishReason, ModelReply, StreamEvent, TokenUsage, WireUsage};

// ============================================================================
// Frame wire shape
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeltaFrame {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    delta: Option<DeltaBody>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ============================================================================
// Line parser
// ============================================================================

/// Incremental parser for delta-framed stream lines.
///
/// Feed it lines as they arrive; it emits normalized [`StreamEvent`]s for
/// the primary choice and captures the usage record when the endpoint
/// sends one.
#[derive(Debug, Default)]
pub struct DeltaStreamParser {
    usage: Option<TokenUsage>,
    done: bool,
}

impl DeltaStreamParser {
    /// Create a parser for one stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel was seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The usage record, when the endpoint sent one.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// Parse one stream line into normalized events.
    ///
    /// Non-data lines (keep-alives, blank separators) produce nothing. A
    /// malformed data payload produces a single [`StreamEvent::Error`]
    /// and is otherwise skipped.
    pub fn parse_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return Vec::new();
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Vec::new();
        }

        let frame: DeltaFrame = match serde_json::from_str(data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Skipping malformed stream frame");
                return vec![StreamEvent::Error(format!("malformed frame: {}", err))];
            }
        };

        if let Some(usage) = &frame.usage {
            let normalized = usage.normalize();
            if !normalized.is_empty() {
                self.usage = Some(normalized);
            }
        }

        let mut events = Vec::new();
        for choice in frame.choices {
            // Only the primary choice drives the reply
            if choice.index != 0 {
                continue;
            }

            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content {
                    if !content.is_empty() {
                        events.push(StreamEvent::TextDelta(content));
                    }
                }

                for fragment in delta.tool_calls {
                    // A fragment without an index cannot be routed to an
                    // accumulator; skip it like any other malformed frame
                    let Some(index) = fragment.index else {
                        warn!("Skipping tool call fragment without index");
                        events.push(StreamEvent::Error(
                            "tool call fragment without index".to_string(),
                        ));
                        continue;
                    };
                    let (name, arguments) = match fragment.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    events.push(StreamEvent::ToolCallDelta {
                        index,
                        id: fragment.id.filter(|s| !s.is_empty()),
                        name: name.filter(|s| !s.is_empty()),
                        arguments,
                    });
                }
            }

            if let Some(reason) = choice.finish_reason {
                events.push(StreamEvent::Done(FinishReason::from_wire(&reason)));
            }
        }

        events
    }
}

// ============================================================================
// Reply assembly
// ============================================================================

/// Accumulator for one streamed tool call.
#[derive(Debug, Default, Clone)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    argument_fragments: Vec<String>,
}

impl ToolCallAccumulator {
    fn accumulated_arguments(&self) -> String {
        self.argument_fragments.concat()
    }

    /// Complete when id and name arrived and the concatenated arguments
    /// parse as JSON. Empty arguments are tolerated for parameterless
    /// tools.
    fn is_complete(&self) -> bool {
        if self.id.is_empty() || self.name.is_empty() {
            return false;
        }
        let args = self.accumulated_arguments();
        let trimmed = args.trim();
        trimmed.is_empty() || serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    }

    fn into_tool_call(self) -> ToolCall {
        let arguments = self.accumulated_arguments();
        ToolCall::new(&self.id, &self.name, &arguments)
    }
}

/// Folds normalized events into a [`ModelReply`].
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    content: String,
    tool_calls: Vec<ToolCallAccumulator>,
    finish_reason: Option<FinishReason>,
}

impl ReplyAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event.
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => self.content.push_str(&text),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ToolCallAccumulator::default());
                }
                let acc = &mut self.tool_calls[index];
                if let Some(id) = id {
                    acc.id = id;
                }
                if let Some(name) = name {
                    acc.name = name;
                }
                if let Some(fragment) = arguments {
                    acc.argument_fragments.push(fragment);
                }
            }
            StreamEvent::Done(reason) => self.finish_reason = Some(reason),
            StreamEvent::Error(detail) => {
                debug!(detail = %detail, "Recovered frame error");
            }
        }
    }

    /// Finalize into a reply, attaching the usage record when known.
    ///
    /// Incomplete tool calls (missing id or name, or arguments that never
    /// became valid JSON) are dropped with a diagnostic rather than
    /// handed to the validator half-built.
    pub fn finish(self, usage: Option<TokenUsage>) -> ModelReply {
        let mut tool_calls = Vec::new();
        for acc in self.tool_calls {
            if acc.is_complete() {
                tool_calls.push(acc.into_tool_call());
            } else {
                warn!(
                    id = %acc.id,
                    name = %acc.name,
                    arguments = %acc.accumulated_arguments(),
                    "Dropping incomplete tool call"
                );
            }
        }

        ModelReply {
            content: self.content,
            tool_calls,
            usage,
            finish_reason: self.finish_reason,
        }
    }
}
