//! Streaming response client.
//!
//! Sends one conversation snapshot plus tool schemas to the LLM endpoint
//! and assembles a normalized [`ModelReply`], regardless of which of the
//! three wire shapes the endpoint supports:
//!
//! 1. the incremental delta stream (preferred),
//! 2. the same chat surface without streaming, when the endpoint signals
//!    streaming is unsupported for the model,
//! 3. the alternate "responses" surface, when the chat surface rejects
//!    the request outright (reasoning-only deployments).
//!
//! On top of the shape chain sits token-parameter selection: exactly one
//! of the mutually exclusive output-size fields is sent, and a rejection
//! of that field triggers one retry with the alternate before anything
//! is surfaced as a protocol error. The working combination is remembered
//! for subsequent calls.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, TokenParam};
use crate::error::{AgentError, Result};
use crate::memory::TokenEstimator;
use crate::tools::ToolSchema;

use super::sse::{DeltaStreamParser, ReplyAccumulator};
use super::types::{
    ChatBackend, ChatResponse, FinishReason, ModelReply, StreamEvent, TokenUsage, WireMessage,
    WireUsage,
};

// ============================================================================
// Fallback bookkeeping
// ============================================================================

/// Request shape being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestShape {
    ChatStreaming,
    ChatSingle,
    Responses,
}

/// Why one attempt failed, and what the chain should try next.
#[derive(Debug)]
enum AttemptFailure {
    /// The output-size field was rejected; retry with the alternate.
    TokenParamRejected,
    /// Streaming is unsupported for this model; retry non-streaming.
    StreamingUnsupported,
    /// The surface rejected the request shape; try the alternate surface.
    ShapeRejected(String),
    /// Not recoverable by the fallback chain.
    Fatal(AgentError),
}

type AttemptResult = std::result::Result<ModelReply, AttemptFailure>;

/// Reasoning-only deployments (o-series models) reject the chat surface
/// outright; route them to the alternate surface from the start instead
/// of burning a round trip on the rejection.
fn prefers_responses_surface(model: &str) -> bool {
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}

/// Classify an HTTP rejection into the fallback action it warrants.
fn classify_rejection(status: u16, body: &str) -> AttemptFailure {
    if body.contains("Unsupported parameter")
        && (body.contains("max_tokens") || body.contains("max_completion_tokens"))
    {
        return AttemptFailure::TokenParamRejected;
    }
    if status == 400 && body.contains("stream") {
        return AttemptFailure::StreamingUnsupported;
    }
    if status == 400 || status == 404 {
        return AttemptFailure::ShapeRejected(format!("HTTP {}: {}", status, truncate(body, 300)));
    }
    AttemptFailure::Fatal(AgentError::Protocol(format!(
        "endpoint returned HTTP {}: {}",
        status,
        truncate(body, 300)
    )))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// Payload builders
// ============================================================================

/// Build the chat-surface request body.
fn build_chat_payload(
    messages: &[WireMessage],
    tools: &[ToolSchema],
    endpoint: &EndpointConfig,
    token_param: TokenParam,
    stream: bool,
) -> Value {
    let mut payload = json!({
        "messages": messages,
        "temperature": endpoint.temperature,
        "stream": stream,
    });
    payload[token_param.field_name()] = json!(endpoint.max_output_tokens);

    if !tools.is_empty() {
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();
        payload["tools"] = json!(wire_tools);
        payload["tool_choice"] = json!("auto");
    }

    payload
}

/// Build the alternate-surface request body.
///
/// The system message becomes `instructions`, the rest becomes `input`.
/// Temperature is deliberately omitted: this surface exists for
/// reasoning-only deployments, which reject it.
fn build_responses_payload(messages: &[WireMessage], endpoint: &EndpointConfig) -> Value {
    let mut instructions = String::new();
    let mut input = Vec::new();
    for message in messages {
        let content = message.content.clone().unwrap_or_default();
        if message.role == "system" {
            instructions = content;
        } else {
            input.push(json!({"role": message.role, "content": content}));
        }
    }

    json!({
        "model": endpoint.model,
        "instructions": instructions,
        "input": input,
        "max_output_tokens": endpoint.max_output_tokens,
    })
}

// ============================================================================
// Single-response conversion
// ============================================================================

/// Convert a non-streaming chat response into the equivalent event
/// sequence, so both paths are assembled by the same accumulator.
fn events_from_single_response(response: ChatResponse) -> (Vec<StreamEvent>, Option<TokenUsage>) {
    let usage = response
        .usage
        .map(|u| u.normalize())
        .filter(|u| !u.is_empty());

    let mut events = Vec::new();
    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(content) = choice.message.content {
            if !content.is_empty() {
                events.push(StreamEvent::TextDelta(content));
            }
        }
        if let Some(calls) = choice.message.tool_calls {
            for (index, call) in calls.into_iter().enumerate() {
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    id: Some(call.id),
                    name: Some(call.function.name),
                    arguments: Some(call.function.arguments),
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            events.push(StreamEvent::Done(FinishReason::from_wire(&reason)));
        }
    }

    (events, usage)
}

// ============================================================================
// Alternate-surface response shape
// ============================================================================

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputItem {
    #[serde(default)]
    content: Vec<ResponsesContent>,
}

#[derive(Debug, Deserialize)]
struct ResponsesContent {
    #[serde(default)]
    text: Option<String>,
}

impl ResponsesReply {
    fn extract_text(&self) -> String {
        if let Some(text) = &self.output_text {
            if !text.is_empty() {
                return text.clone();
            }
        }
        self.output
            .iter()
            .flat_map(|item| item.content.iter())
            .filter_map(|c| c.text.as_deref())
            .collect()
    }
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the LLM endpoint.
///
/// A pure protocol translator: it never inspects conversation content and
/// holds no conversation state. The only thing it remembers across calls
/// is which token parameter the deployment accepted.
pub struct ChatClient {
    http: Client,
    endpoint: EndpointConfig,
    token_param: Mutex<TokenParam>,
    estimator: TokenEstimator,
}

impl ChatClient {
    /// Create a client for the configured endpoint.
    pub fn new(endpoint: EndpointConfig) -> Self {
        let token_param = endpoint.resolve_token_param();
        debug!(
            model = %endpoint.model,
            api_version = %endpoint.api_version,
            token_param = token_param.field_name(),
            "Chat client initialized"
        );
        Self {
            http: Client::new(),
            endpoint,
            token_param: Mutex::new(token_param),
            estimator: TokenEstimator::new(),
        }
    }

    /// Create a client with a custom reqwest client (tests, proxies).
    pub fn with_http_client(endpoint: EndpointConfig, http: Client) -> Self {
        let token_param = endpoint.resolve_token_param();
        Self {
            http,
            endpoint,
            token_param: Mutex::new(token_param),
            estimator: TokenEstimator::new(),
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions",
            self.endpoint.api_base.trim_end_matches('/'),
            self.endpoint.model
        )
    }

    fn responses_url(&self) -> String {
        format!(
            "{}/openai/responses",
            self.endpoint.api_base.trim_end_matches('/')
        )
    }

    /// Estimated usage for deployments that omit the usage record.
    fn estimate_usage(&self, messages: &[WireMessage], completion: &str) -> TokenUsage {
        let prompt: u32 = messages
            .iter()
            .map(|m| {
                self.estimator
                    .message_cost(m.content.as_deref().unwrap_or_default())
            })
            .sum();
        TokenUsage::new(prompt, self.estimator.text_cost(completion))
    }

    async fn send(&self, url: &str, payload: &Value) -> std::result::Result<reqwest::Response, AttemptFailure> {
        let response = self
            .http
            .post(url)
            .query(&[("api-version", self.endpoint.api_version.as_str())])
            .header("api-key", &self.endpoint.api_key)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptFailure::Fatal(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = truncate(&body, 500), "Endpoint rejected request");
            return Err(classify_rejection(status.as_u16(), &body));
        }
        Ok(response)
    }

    /// One attempt against the chat surface.
    async fn chat_attempt(
        &self,
        messages: &[WireMessage],
        tools: &[ToolSchema],
        token_param: TokenParam,
        stream: bool,
    ) -> AttemptResult {
        let payload = build_chat_payload(messages, tools, &self.endpoint, token_param, stream);
        let url = self.chat_url();

        let work = async {
            let response = self.send(&url, &payload).await?;
            if stream {
                self.read_stream(response).await
            } else {
                let body: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| AttemptFailure::Fatal(e.into()))?;
                let (events, usage) = events_from_single_response(body);
                let mut accumulator = ReplyAccumulator::new();
                for event in events {
                    accumulator.apply(event);
                }
                Ok(accumulator.finish(usage))
            }
        };

        self.with_call_timeout(work).await
    }

    /// One attempt against the alternate surface. Tool calling is not
    /// available there; it exists so reasoning-only deployments can still
    /// answer.
    async fn responses_attempt(&self, messages: &[WireMessage]) -> AttemptResult {
        let payload = build_responses_payload(messages, &self.endpoint);
        let url = self.responses_url();

        let work = async {
            let response = self.send(&url, &payload).await?;
            let body: ResponsesReply = response
                .json()
                .await
                .map_err(|e| AttemptFailure::Fatal(e.into()))?;

            let usage = body.usage.as_ref().map(|u| u.normalize()).filter(|u| !u.is_empty());
            let mut reply = ModelReply::text(&body.extract_text());
            reply.usage = usage;
            reply.finish_reason = Some(FinishReason::Stop);
            Ok(reply)
        };

        self.with_call_timeout(work).await
    }

    /// Drain the delta stream into a reply.
    ///
    /// Frame-level problems are recovered inside the parser; only a
    /// connection failure aborts the read.
    async fn read_stream(&self, response: reqwest::Response) -> AttemptResult {
        let mut parser = DeltaStreamParser::new();
        let mut accumulator = ReplyAccumulator::new();
        let mut buffer = String::new();

        let mut byte_stream = response.bytes_stream();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| AttemptFailure::Fatal(AgentError::Http(e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                for event in parser.parse_line(line.trim_end()) {
                    accumulator.apply(event);
                }
            }

            if parser.is_done() {
                break;
            }
        }

        // Trailing partial line without a newline
        if !buffer.trim().is_empty() {
            for event in parser.parse_line(buffer.trim_end()) {
                accumulator.apply(event);
            }
        }

        Ok(accumulator.finish(parser.usage()))
    }

    async fn with_call_timeout(
        &self,
        work: impl std::future::Future<Output = AttemptResult>,
    ) -> AttemptResult {
        let timeout = Duration::from_secs(self.endpoint.timeout_secs);
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(AttemptFailure::Fatal(AgentError::Timeout(format!(
                "model call exceeded {}s",
                self.endpoint.timeout_secs
            )))),
        }
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn complete(
        &self,
        messages: Vec<WireMessage>,
        tools: &[ToolSchema],
    ) -> Result<ModelReply> {
        let mut shape = if prefers_responses_surface(&self.endpoint.model) {
            RequestShape::Responses
        } else {
            RequestShape::ChatStreaming
        };
        let mut token_param = *self.token_param.lock().unwrap();
        let mut attempted: HashSet<(RequestShape, TokenParam)> = HashSet::new();

        loop {
            if !attempted.insert((shape, token_param)) {
                return Err(AgentError::Protocol(
                    "all request shapes and parameter combinations were rejected".into(),
                ));
            }

            let attempt = match shape {
                RequestShape::ChatStreaming => {
                    self.chat_attempt(&messages, tools, token_param, true).await
                }
                RequestShape::ChatSingle => {
                    self.chat_attempt(&messages, tools, token_param, false).await
                }
                RequestShape::Responses => self.responses_attempt(&messages).await,
            };

            match attempt {
                Ok(mut reply) => {
                    // Remember the accepted parameter for future calls
                    *self.token_param.lock().unwrap() = token_param;
                    if reply.usage.is_none() {
                        reply.usage = Some(self.estimate_usage(&messages, &reply.content));
                    }
                    info!(
                        content_len = reply.content.len(),
                        tool_calls = reply.tool_calls.len(),
                        "Model reply assembled"
                    );
                    return Ok(reply);
                }
                Err(AttemptFailure::TokenParamRejected) => {
                    debug!(
                        rejected = token_param.field_name(),
                        retrying_with = token_param.alternate().field_name(),
                        "Output-size parameter rejected"
                    );
                    token_param = token_param.alternate();
                }
                Err(AttemptFailure::StreamingUnsupported) => {
                    info!("Streaming unsupported for this model, retrying non-streaming");
                    shape = RequestShape::ChatSingle;
                }
                Err(AttemptFailure::ShapeRejected(detail)) => {
                    if shape == RequestShape::Responses {
                        return Err(AgentError::Protocol(detail));
                    }
                    info!(detail = %detail, "Chat surface rejected request, trying alternate surface");
                    shape = RequestShape::Responses;
                }
                Err(AttemptFailure::Fatal(err)) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolResultRole;

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            api_base: "https://resource.example.com".into(),
            api_key: "key".into(),
            model: "gpt-4o-mini".into(),
            api_version: "2024-06-01".into(),
            temperature: 0.7,
            max_output_tokens: 512,
            timeout_secs: 30,
            token_param: None,
            tool_result_role: ToolResultRole::Tool,
        }
    }

    fn wire_user(content: &str) -> WireMessage {
        WireMessage {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn wire_system(content: &str) -> WireMessage {
        WireMessage {
            role: "system".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn test_classify_token_param_rejection() {
        let failure = classify_rejection(
            400,
            r#"{"error": {"message": "Unsupported parameter: 'max_tokens' is not supported with this model."}}"#,
        );
        assert!(matches!(failure, AttemptFailure::TokenParamRejected));

        let failure = classify_rejection(
            400,
            "Unsupported parameter: 'max_completion_tokens'",
        );
        assert!(matches!(failure, AttemptFailure::TokenParamRejected));
    }

    #[test]
    fn test_classify_streaming_unsupported() {
        let failure = classify_rejection(
            400,
            r#"{"error": {"message": "The model does not support stream mode."}}"#,
        );
        assert!(matches!(failure, AttemptFailure::StreamingUnsupported));
    }

    #[test]
    fn test_classify_shape_rejection() {
        let failure = classify_rejection(400, "reasoning models require the responses API");
        assert!(matches!(failure, AttemptFailure::ShapeRejected(_)));

        let failure = classify_rejection(404, "deployment not found");
        assert!(matches!(failure, AttemptFailure::ShapeRejected(_)));
    }

    #[test]
    fn test_classify_fatal() {
        let failure = classify_rejection(401, "invalid api key");
        match failure {
            AttemptFailure::Fatal(AgentError::Protocol(detail)) => {
                assert!(detail.contains("401"));
            }
            other => panic!("expected fatal, got {:?}", other),
        }

        let failure = classify_rejection(500, "internal error");
        assert!(matches!(failure, AttemptFailure::Fatal(_)));
    }

    #[test]
    fn test_build_chat_payload_token_field() {
        let payload = build_chat_payload(
            &[wire_user("hi")],
            &[],
            &endpoint(),
            TokenParam::MaxTokens,
            true,
        );
        assert_eq!(payload["max_tokens"], 512);
        assert!(payload.get("max_completion_tokens").is_none());
        assert_eq!(payload["stream"], true);
        assert!(payload.get("tools").is_none());

        let payload = build_chat_payload(
            &[wire_user("hi")],
            &[],
            &endpoint(),
            TokenParam::MaxCompletionTokens,
            false,
        );
        assert_eq!(payload["max_completion_tokens"], 512);
        assert!(payload.get("max_tokens").is_none());
        assert_eq!(payload["stream"], false);
    }

    #[test]
    fn test_build_chat_payload_with_tools() {
        let tools = vec![ToolSchema {
            name: "light_turn_on".into(),
            description: "Turn a light on".into(),
            parameters: json!({"type": "object"}),
        }];
        let payload = build_chat_payload(
            &[wire_user("hi")],
            &tools,
            &endpoint(),
            TokenParam::MaxTokens,
            true,
        );
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["tools"][0]["type"], "function");
        assert_eq!(payload["tools"][0]["function"]["name"], "light_turn_on");
    }

    #[test]
    fn test_build_responses_payload_splits_system() {
        let payload = build_responses_payload(
            &[wire_system("you are helpful"), wire_user("hello")],
            &endpoint(),
        );
        assert_eq!(payload["instructions"], "you are helpful");
        assert_eq!(payload["input"][0]["role"], "user");
        assert_eq!(payload["input"][0]["content"], "hello");
        assert_eq!(payload["max_output_tokens"], 512);
        // Reasoning deployments reject temperature
        assert!(payload.get("temperature").is_none());
    }

    #[test]
    fn test_events_from_single_response_matches_stream_assembly() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": "Turning it on.",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "light_turn_on", "arguments": "{\"targets\":[\"light.kitchen\"]}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4}
        }"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        let (events, usage) = events_from_single_response(response);

        let mut accumulator = ReplyAccumulator::new();
        for event in events {
            accumulator.apply(event);
        }
        let reply = accumulator.finish(usage);

        assert_eq!(reply.content, "Turning it on.");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].id, "call_1");
        assert_eq!(
            reply.tool_calls[0].raw_arguments,
            r#"{"targets":["light.kitchen"]}"#
        );
        assert_eq!(reply.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(reply.usage.unwrap().total_tokens, 13);
    }

    #[test]
    fn test_responses_reply_extract_text() {
        let reply: ResponsesReply = serde_json::from_str(
            r#"{"output_text": "direct answer", "output": [], "usage": null}"#,
        )
        .unwrap();
        assert_eq!(reply.extract_text(), "direct answer");

        let reply: ResponsesReply = serde_json::from_str(
            r#"{"output": [{"content": [{"text": "part one "}, {"text": "part two"}]}]}"#,
        )
        .unwrap();
        assert_eq!(reply.extract_text(), "part one part two");
    }

    #[test]
    fn test_client_resolves_initial_token_param() {
        let client = ChatClient::new(endpoint());
        assert_eq!(*client.token_param.lock().unwrap(), TokenParam::MaxTokens);

        let mut newer = endpoint();
        newer.api_version = "2025-03-01-preview".into();
        let client = ChatClient::new(newer);
        assert_eq!(
            *client.token_param.lock().unwrap(),
            TokenParam::MaxCompletionTokens
        );
    }

    #[test]
    fn test_chat_url_shape() {
        let client = ChatClient::new(endpoint());
        assert_eq!(
            client.chat_url(),
            "https://resource.example.com/openai/deployments/gpt-4o-mini/chat/completions"
        );
        assert_eq!(
            client.responses_url(),
            "https://resource.example.com/openai/responses"
        );
    }

    #[test]
    fn test_estimate_usage_nonzero() {
        let client = ChatClient::new(endpoint());
        let usage = client.estimate_usage(
            &[wire_system("prompt"), wire_user("question")],
            "a reasonably sized completion text",
        );
        assert!(usage.prompt_tokens > 0);
        assert!(usage.completion_tokens > 0);
        assert_eq!(
            usage.total_tokens,
            usage.prompt_tokens + usage.completion_tokens
        );
    }

    #[test]
    fn test_prefers_responses_surface_for_o_series() {
        assert!(prefers_responses_surface("o1"));
        assert!(prefers_responses_surface("o3-mini"));
        assert!(!prefers_responses_surface("gpt-4o-mini"));
        assert!(!prefers_responses_surface("omega"));
        assert!(!prefers_responses_surface(""));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 300), "hello");
        assert_eq!(truncate("ààààà", 2), "àà");
    }
}
