//! OpenAI-compatible chat-completions backend
//!
//! Talks the chat-completions wire format against a configurable base URL,
//! which covers DeepInfra-style hosts as well as OpenAI itself. Tool-call
//! deltas stream without ids on later chunks, so accumulation is keyed by the
//! chunk index. Token counting is not part of this wire format, so
//! `count_tokens` reports -1.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::r#loop::run_rounds;
use crate::backend::{
    BackendResponse, FinishReason, InferenceBackend, InferenceModel, Interrupt, ProcessCallbacks,
    RoundClient, Usage,
};
use crate::conversation::{ChatMessage, ContentBlock, MessageBody, Role};
use crate::error::BackendError;
use crate::prompt::SystemBlock;
use crate::tools::{ToolContext, ToolDefinition, ToolRegistry};

/// OpenAI-compatible inference backend.
pub struct OpenAiCompatBackend {
    base_url: String,
    api_key: String,
    fast_model: InferenceModel,
    client: Client,
}

impl OpenAiCompatBackend {
    /// Create a backend against a chat-completions host.
    pub fn new(base_url: String, api_key: String, fast_model: InferenceModel) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            fast_model,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    async fn post_completion(&self, body: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Api(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl RoundClient for OpenAiCompatBackend {
    async fn request_round(
        &self,
        model: &InferenceModel,
        system: &[SystemBlock],
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        callbacks: &dyn ProcessCallbacks,
        _thinking: bool,
    ) -> Result<BackendResponse, BackendError> {
        let mut body = json!({
            "model": model.model_id,
            "messages": serialize_messages(system, messages),
            "max_tokens": model.max_output_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(serialize_tool).collect());
        }

        let response = self.post_completion(&body).await?;

        let mut decoder = ChunkDecoder::new();
        let mut fired_first_text = false;
        let mut line_buffer = String::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| BackendError::Api(e.to_string()))?;
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=pos).collect();
                let line = line.trim_end();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let text_arrived = decoder.apply(data);
                if text_arrived && !fired_first_text {
                    callbacks.on_first_text().await;
                    fired_first_text = true;
                }
            }
        }

        Ok(decoder.finish())
    }
}

#[async_trait]
impl InferenceBackend for OpenAiCompatBackend {
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
        _model_id: &str,
        _system: &[SystemBlock],
        _tools: &[ToolDefinition],
        _messages: &[ChatMessage],
    ) -> Result<i64, BackendError> {
        // The chat-completions wire format has no counting endpoint
        Ok(-1)
    }

    async fn utility_complete(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let body = json!({
            "model": self.fast_model.model_id,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
        });

        let response = self.post_completion(&body).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Api(e.to_string()))?;
        Ok(parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

/// Translate an error status + body into the shared taxonomy.
fn classify_error(status: u16, body: &str) -> BackendError {
    let message = format!("{}: {}", status, body);
    match status {
        401 | 403 => BackendError::Auth(message),
        413 => BackendError::ContextTooLarge(message),
        400 => {
            let lowered = body.to_lowercase();
            if lowered.contains("context length") || lowered.contains("too long") {
                BackendError::ContextTooLarge(message)
            } else {
                BackendError::Api(message)
            }
        }
        _ => BackendError::Api(message),
    }
}

/// Flatten system blocks + conversation into chat-completions messages.
///
/// Tool results become `tool`-role messages; tool calls ride on assistant
/// messages; images have no portable representation here and degrade to a
/// placeholder line.
fn serialize_messages(system: &[SystemBlock], messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::new();

    if !system.is_empty() {
        let text = system
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        out.push(json!({"role": "system", "content": text}));
    }

    for msg in messages {
        match (&msg.role, &msg.content) {
            (Role::User, MessageBody::Text(text)) => {
                out.push(json!({"role": "user", "content": text}));
            }
            (Role::Assistant, MessageBody::Text(text)) => {
                out.push(json!({"role": "assistant", "content": text}));
            }
            (Role::User, MessageBody::Blocks(blocks)) => {
                let mut texts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        })),
                        ContentBlock::Text { text } => texts.push(text.clone()),
                        ContentBlock::Image { .. } => texts.push("[image attachment]".to_string()),
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                if !texts.is_empty() {
                    out.push(json!({"role": "user", "content": texts.join("\n")}));
                }
            }
            (Role::Assistant, MessageBody::Blocks(blocks)) => {
                let text = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let tool_calls: Vec<Value> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        })),
                        _ => None,
                    })
                    .collect();

                let mut message = json!({"role": "assistant", "content": text});
                if !tool_calls.is_empty() {
                    message["tool_calls"] = Value::Array(tool_calls);
                }
                out.push(message);
            }
        }
    }

    out
}

fn serialize_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        },
    })
}

#[derive(Default)]
struct ToolCallAccum {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed completion chunks into a decoded response.
struct ChunkDecoder {
    content: String,
    tool_calls: BTreeMap<usize, ToolCallAccum>,
    finish_reason: Option<String>,
    usage: Usage,
}

impl ChunkDecoder {
    fn new() -> Self {
        Self {
            content: String::new(),
            tool_calls: BTreeMap::new(),
            finish_reason: None,
            usage: Usage::default(),
        }
    }

    /// Apply one chunk payload. Returns `true` when response text arrived.
    fn apply(&mut self, data: &str) -> bool {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return false;
        };

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage.input_tokens = usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.usage.output_tokens = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.usage.cache_read_input_tokens = usage
                .pointer("/prompt_tokens_details/cached_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
        }

        let Some(choice) = chunk.pointer("/choices/0") else {
            return false;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            return false;
        };

        let mut text_arrived = false;
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.content.push_str(text);
                text_arrived = true;
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let Some(index) = call.get("index").and_then(Value::as_u64) else {
                    continue;
                };
                let accum = self.tool_calls.entry(index as usize).or_default();
                // The id only appears on the first chunk of a call
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    accum.id = id.to_string();
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    accum.name.push_str(name);
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                    accum.arguments.push_str(args);
                }
            }
        }

        text_arrived
    }

    fn finish(self) -> BackendResponse {
        let mut blocks = Vec::new();
        if !self.content.is_empty() {
            blocks.push(ContentBlock::Text {
                text: self.content,
            });
        }

        for (index, accum) in self.tool_calls {
            let id = if accum.id.is_empty() {
                format!("call_{}_{}", index, Uuid::new_v4().simple())
            } else {
                accum.id
            };
            // Empty or malformed streamed arguments degrade to an empty map
            let input = if accum.arguments.trim().is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&accum.arguments)
                    .unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
            };
            blocks.push(ContentBlock::ToolUse {
                id,
                name: accum.name,
                input,
            });
        }

        let finish_reason = match self.finish_reason.as_deref() {
            Some("length") => FinishReason::MaxTokens,
            Some("tool_calls") => FinishReason::ToolUse,
            Some("stop") | None => FinishReason::EndTurn,
            Some(other) => FinishReason::Other(other.to_string()),
        };

        BackendResponse {
            blocks,
            finish_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        assert!(matches!(classify_error(401, "no"), BackendError::Auth(_)));
        assert!(matches!(
            classify_error(400, "this model's maximum context length is 131072 tokens"),
            BackendError::ContextTooLarge(_)
        ));
        assert!(matches!(classify_error(500, "boom"), BackendError::Api(_)));
    }

    #[test]
    fn test_serialize_messages_system_and_text() {
        let system = vec![SystemBlock::new("be brief")];
        let messages = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let out = serialize_messages(&system, &messages);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["role"], "system");
        assert_eq!(out[1]["content"], "hi");
        assert_eq!(out[2]["role"], "assistant");
    }

    #[test]
    fn test_serialize_messages_tool_plumbing() {
        let messages = vec![
            ChatMessage::assistant_blocks(vec![
                ContentBlock::text("checking"),
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "list_files".into(),
                    input: json!({"path": "."}),
                },
            ]),
            ChatMessage::user_blocks(vec![ContentBlock::tool_result("call_1", "3 files", false)]),
        ];
        let out = serialize_messages(&[], &messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["tool_calls"][0]["function"]["name"], "list_files");
        assert_eq!(out[1]["role"], "tool");
        assert_eq!(out[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_serialize_tool_shape() {
        let def = ToolDefinition::new("echo", "Echo text", json!({"type": "object"}));
        let out = serialize_tool(&def);
        assert_eq!(out["type"], "function");
        assert_eq!(out["function"]["name"], "echo");
    }

    #[test]
    fn test_decoder_content_stream() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.apply(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#));
        assert!(decoder.apply(r#"{"choices":[{"delta":{"content":"lo"}}]}"#));
        assert!(!decoder.apply(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));
        assert!(!decoder.apply(
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2,"prompt_tokens_details":{"cached_tokens":4}}}"#
        ));

        let response = decoder.finish();
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.finish_reason, FinishReason::EndTurn);
        assert_eq!(response.usage.input_tokens, 9);
        assert_eq!(response.usage.cache_read_input_tokens, 4);
    }

    #[test]
    fn test_decoder_tool_calls_accumulate_by_index() {
        let mut decoder = ChunkDecoder::new();
        decoder.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"ec","arguments":""}}]}}]}"#,
        );
        decoder.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"ho","arguments":"{\"text\""}}]}}]}"#,
        );
        decoder.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"hi\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        );

        let response = decoder.finish();
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].name, "echo");
        assert_eq!(calls[0].input["text"], "hi");
    }

    #[test]
    fn test_decoder_invalid_arguments_degrade() {
        let mut decoder = ChunkDecoder::new();
        decoder.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"echo","arguments":"{oops"}}]}}]}"#,
        );
        let response = decoder.finish();
        assert!(response.tool_calls()[0].input.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_decoder_missing_id_gets_fallback() {
        let mut decoder = ChunkDecoder::new();
        decoder.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":2,"function":{"name":"echo","arguments":"{}"}}]}}]}"#,
        );
        let response = decoder.finish();
        assert!(response.tool_calls()[0].id.starts_with("call_2_"));
    }

    #[test]
    fn test_decoder_length_finish() {
        let mut decoder = ChunkDecoder::new();
        decoder.apply(r#"{"choices":[{"delta":{"content":"cut"},"finish_reason":"length"}]}"#);
        assert_eq!(decoder.finish().finish_reason, FinishReason::MaxTokens);
    }
}
