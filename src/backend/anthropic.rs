//! Anthropic Messages API backend
//!
//! Implements `InferenceBackend` over the Messages API with SSE streaming.
//! Conversation messages serialize straight into the block-based wire format,
//! and raw stream events are decoded into a provider-agnostic
//! [`BackendResponse`] before the loop engine ever sees them.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::agent::r#loop::run_rounds;
use crate::backend::{
    BackendResponse, FinishReason, InferenceBackend, InferenceModel, Interrupt, ProcessCallbacks,
    RoundClient, Usage,
};
use crate::conversation::{ChatMessage, ContentBlock};
use crate::error::BackendError;
use crate::prompt::SystemBlock;
use crate::tools::{ToolContext, ToolDefinition, ToolRegistry};

/// The Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

#[derive(Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
    system: &'a [SystemBlock],
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct CountTokensRequest<'a> {
    model: &'a str,
    system: &'a [SystemBlock],
    tools: &'a [ToolDefinition],
    messages: &'a [ChatMessage],
}

/// Anthropic inference backend.
pub struct AnthropicBackend {
    api_key: String,
    base_url: String,
    fast_model: InferenceModel,
    client: Client,
}

impl AnthropicBackend {
    /// Create a backend with the given API key.
    ///
    /// `fast_model` backs `utility_complete` for summaries and classification.
    pub fn new(api_key: String, fast_model: InferenceModel) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            fast_model,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Point the backend at a different base URL (testing, proxies).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn post_messages(
        &self,
        request: &MessagesRequest<'_>,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Api(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl RoundClient for AnthropicBackend {
    async fn request_round(
        &self,
        model: &InferenceModel,
        system: &[SystemBlock],
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        callbacks: &dyn ProcessCallbacks,
        thinking: bool,
    ) -> Result<BackendResponse, BackendError> {
        let thinking_config = match (thinking, model.thinking_budget) {
            (true, Some(budget)) => Some(ThinkingConfig {
                kind: "enabled",
                budget_tokens: budget,
            }),
            _ => None,
        };
        let request = MessagesRequest {
            model: &model.model_id,
            max_tokens: model.max_output_tokens,
            thinking: thinking_config,
            system,
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream: Some(true),
        };

        let response = self.post_messages(&request).await?;

        let mut decoder = StreamDecoder::new();
        let mut fired_first_text = false;
        let mut line_buffer = String::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| BackendError::Api(e.to_string()))?;
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=pos).collect();
                let line = line.trim_end();
                if let Some(data) = line.strip_prefix("data: ") {
                    let text_arrived = decoder.apply(data);
                    if text_arrived && !fired_first_text {
                        callbacks.on_first_text().await;
                        fired_first_text = true;
                    }
                }
            }
        }

        Ok(decoder.finish())
    }
}

#[async_trait]
impl InferenceBackend for AnthropicBackend {
    async fn run_agentic_loop(
        &self,
        model: &InferenceModel,
        system: &[SystemBlock],
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolDefinition],
        registry: &ToolRegistry,
        tool_ctx: &ToolContext,
        audit_dir: &Path,
        usage_dir: &Path,
        callbacks: &dyn ProcessCallbacks,
        interrupt: &Interrupt,
        thinking: bool,
    ) -> Result<String, BackendError> {
        run_rounds(
            self, model, system, messages, tools, registry, tool_ctx, audit_dir, usage_dir,
            callbacks, interrupt, thinking,
        )
        .await
    }

    async fn count_tokens(
        &self,
        model_id: &str,
        system: &[SystemBlock],
        tools: &[ToolDefinition],
        messages: &[ChatMessage],
    ) -> Result<i64, BackendError> {
        let request = CountTokensRequest {
            model: model_id,
            system,
            tools,
            messages,
        };
        let response = match self
            .client
            .post(format!("{}/v1/messages/count_tokens", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Token counting failed");
                return Ok(-1);
            }
        };

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Auth(error_message(status.as_u16(), &body)));
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "Token counting failed");
            return Ok(-1);
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Token count response unreadable");
                return Ok(-1);
            }
        };
        Ok(body
            .get("input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(-1))
    }

    async fn utility_complete(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let messages = vec![ChatMessage::user(prompt)];
        let request = MessagesRequest {
            model: &self.fast_model.model_id,
            max_tokens,
            thinking: None,
            system: &[],
            messages: &messages,
            tools: None,
            stream: None,
        };

        let response = self.post_messages(&request).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Api(e.to_string()))?;

        let text = body
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks.iter().find_map(|block| {
                    (block.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| block.get("text").and_then(Value::as_str))
                        .flatten()
                })
            })
            .unwrap_or_default();
        Ok(text.to_string())
    }
}

/// Translate an error status + body into the shared taxonomy.
fn classify_error(status: u16, body: &str) -> BackendError {
    let message = error_message(status, body);
    match status {
        401 | 403 => BackendError::Auth(message),
        413 => BackendError::ContextTooLarge(message),
        400 => {
            let lowered = body.to_lowercase();
            if lowered.contains("too long") || lowered.contains("too large") {
                BackendError::ContextTooLarge(message)
            } else {
                BackendError::Api(message)
            }
        }
        _ => BackendError::Api(message),
    }
}

/// Build a readable message from an error response body.
fn error_message(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(error) = parsed.get("error") {
            let kind = error.get("type").and_then(Value::as_str).unwrap_or("error");
            let message = error.get("message").and_then(Value::as_str).unwrap_or("");
            return format!("{} - {}: {}", status, kind, message);
        }
    }
    format!("{}: {}", status, body)
}

enum BlockAccum {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
    Skip,
}

/// Accumulates SSE events into a decoded response.
struct StreamDecoder {
    blocks: BTreeMap<usize, BlockAccum>,
    stop_reason: Option<String>,
    usage: Usage,
}

impl StreamDecoder {
    fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            stop_reason: None,
            usage: Usage::default(),
        }
    }

    /// Apply one `data:` payload. Returns `true` when response text arrived.
    fn apply(&mut self, data: &str) -> bool {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return false;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(usage) = event.pointer("/message/usage") {
                    self.usage.input_tokens = u64_field(usage, "input_tokens");
                    self.usage.cache_read_input_tokens = u64_field(usage, "cache_read_input_tokens");
                    self.usage.cache_creation_input_tokens =
                        u64_field(usage, "cache_creation_input_tokens");
                }
                false
            }
            Some("content_block_start") => {
                let Some(index) = event.get("index").and_then(Value::as_u64) else {
                    return false;
                };
                let accum = match event.pointer("/content_block/type").and_then(Value::as_str) {
                    Some("text") => BlockAccum::Text(String::new()),
                    Some("tool_use") => BlockAccum::ToolUse {
                        id: str_field(&event, "/content_block/id"),
                        name: str_field(&event, "/content_block/name"),
                        json: String::new(),
                    },
                    _ => BlockAccum::Skip,
                };
                self.blocks.insert(index as usize, accum);
                false
            }
            Some("content_block_delta") => {
                let Some(index) = event.get("index").and_then(Value::as_u64) else {
                    return false;
                };
                let Some(accum) = self.blocks.get_mut(&(index as usize)) else {
                    return false;
                };
                match event.pointer("/delta/type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let BlockAccum::Text(text) = accum {
                            let delta = str_field(&event, "/delta/text");
                            let arrived = !delta.is_empty();
                            text.push_str(&delta);
                            return arrived;
                        }
                        false
                    }
                    Some("input_json_delta") => {
                        if let BlockAccum::ToolUse { json, .. } = accum {
                            json.push_str(&str_field(&event, "/delta/partial_json"));
                        }
                        false
                    }
                    _ => false,
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = event.get("usage") {
                    self.usage.output_tokens = u64_field(usage, "output_tokens");
                }
                false
            }
            _ => false,
        }
    }

    fn finish(self) -> BackendResponse {
        let mut blocks = Vec::new();
        for (_, accum) in self.blocks {
            match accum {
                BlockAccum::Text(text) => {
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text { text });
                    }
                }
                BlockAccum::ToolUse { id, name, json } => {
                    // Malformed streamed arguments degrade to an empty map
                    let input = if json.trim().is_empty() {
                        Value::Object(serde_json::Map::new())
                    } else {
                        serde_json::from_str(&json)
                            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
                    };
                    blocks.push(ContentBlock::ToolUse { id, name, input });
                }
                BlockAccum::Skip => {}
            }
        }

        let finish_reason = match self.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") | None => FinishReason::EndTurn,
            Some("max_tokens") => FinishReason::MaxTokens,
            Some("tool_use") => FinishReason::ToolUse,
            Some(other) => FinishReason::Other(other.to_string()),
        };

        BackendResponse {
            blocks,
            finish_reason,
            usage: self.usage,
        }
    }
}

fn u64_field(value: &Value, field: &str) -> u64 {
    value.get(field).and_then(Value::as_u64).unwrap_or(0)
}

fn str_field(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_errors() {
        assert!(matches!(
            classify_error(401, r#"{"error":{"type":"authentication_error","message":"bad key"}}"#),
            BackendError::Auth(_)
        ));
        assert!(matches!(
            classify_error(403, "forbidden"),
            BackendError::Auth(_)
        ));
    }

    #[test]
    fn test_classify_context_too_large() {
        assert!(matches!(
            classify_error(413, "request too large"),
            BackendError::ContextTooLarge(_)
        ));
        assert!(matches!(
            classify_error(
                400,
                r#"{"error":{"type":"invalid_request_error","message":"prompt is too long"}}"#
            ),
            BackendError::ContextTooLarge(_)
        ));
    }

    #[test]
    fn test_classify_everything_else_is_api() {
        assert!(matches!(
            classify_error(400, "malformed tool id"),
            BackendError::Api(_)
        ));
        assert!(matches!(classify_error(429, "slow down"), BackendError::Api(_)));
        assert!(matches!(classify_error(529, "overloaded"), BackendError::Api(_)));
    }

    #[test]
    fn test_error_message_parses_body() {
        let message = error_message(
            401,
            r#"{"error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        );
        assert!(message.contains("authentication_error"));
        assert!(message.contains("invalid x-api-key"));
    }

    #[test]
    fn test_decoder_text_stream() {
        let mut decoder = StreamDecoder::new();
        assert!(!decoder.apply(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":10,"cache_read_input_tokens":3,"cache_creation_input_tokens":2}}}"#
        ));
        assert!(!decoder.apply(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#
        ));
        assert!(decoder.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#
        ));
        assert!(decoder.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#
        ));
        assert!(!decoder.apply(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#
        ));

        let response = decoder.finish();
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.finish_reason, FinishReason::EndTurn);
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.cache_read_input_tokens, 3);
        assert_eq!(response.usage.output_tokens, 5);
    }

    #[test]
    fn test_decoder_tool_use_stream() {
        let mut decoder = StreamDecoder::new();
        decoder.apply(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"list_files"}}"#,
        );
        decoder.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
        );
        decoder.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\".\"}"}}"#,
        );
        decoder.apply(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#);

        let response = decoder.finish();
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!(calls[0].name, "list_files");
        assert_eq!(calls[0].input["path"], ".");
    }

    #[test]
    fn test_decoder_malformed_tool_json_degrades_to_empty() {
        let mut decoder = StreamDecoder::new();
        decoder.apply(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"echo"}}"#,
        );
        decoder.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{broken"}}"#,
        );

        let response = decoder.finish();
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].input.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_decoder_skips_thinking_blocks() {
        let mut decoder = StreamDecoder::new();
        decoder.apply(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
        );
        decoder.apply(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
        );
        decoder.apply(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"visible"}}"#,
        );

        let response = decoder.finish();
        assert_eq!(response.blocks.len(), 1);
        assert_eq!(response.text(), "visible");
    }

    #[test]
    fn test_decoder_max_tokens_stop() {
        let mut decoder = StreamDecoder::new();
        decoder.apply(r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"}}"#);
        assert_eq!(decoder.finish().finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_decoder_ignores_garbage_events() {
        let mut decoder = StreamDecoder::new();
        assert!(!decoder.apply("not json at all"));
        assert!(!decoder.apply(r#"{"type":"ping"}"#));
        let response = decoder.finish();
        assert!(response.blocks.is_empty());
    }
}
