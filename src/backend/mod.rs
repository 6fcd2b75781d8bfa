//! Inference backend abstraction
//!
//! This module defines the `InferenceBackend` trait that normalizes divergent
//! provider wire formats and failure modes into one contract, plus the
//! provider-agnostic decoded response record the agent loop consumes. Each
//! concrete backend decodes its raw responses into [`BackendResponse`] at the
//! boundary; the loop engine never branches on provider type.

pub mod anthropic;
pub mod cli_agent;
pub mod openai_compat;

pub use anthropic::AnthropicBackend;
pub use cli_agent::CliAgentBackend;
pub use openai_compat::OpenAiCompatBackend;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::conversation::{ChatMessage, ContentBlock};
use crate::error::{BackendError, FamulusError};
use crate::prompt::SystemBlock;
use crate::tools::{ToolContext, ToolDefinition, ToolRegistry};

/// A concrete model an agent turn runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceModel {
    /// Provider-side model identifier
    pub model_id: String,
    /// Maximum output tokens per response
    pub max_output_tokens: u32,
    /// Reasoning-token budget, when the model supports extended thinking
    #[serde(default)]
    pub thinking_budget: Option<u32>,
}

impl InferenceModel {
    /// Create a model entry without a thinking budget.
    pub fn new(model_id: &str, max_output_tokens: u32) -> Self {
        Self {
            model_id: model_id.to_string(),
            max_output_tokens,
            thinking_budget: None,
        }
    }
}

/// Token usage information from one inference round.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

/// Why a response round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of turn
    EndTurn,
    /// The output token budget was exhausted
    MaxTokens,
    /// The model stopped to call tools
    ToolUse,
    /// Any other provider-specific reason
    Other(String),
}

/// One decoded tool invocation from a response round.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Provider-agnostic record of one response round.
///
/// Every backend decodes its raw wire response into this shape immediately,
/// so the loop engine sees one format regardless of provider.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    /// Text and tool-use blocks, in response order
    pub blocks: Vec<ContentBlock>,
    /// Why the round ended
    pub finish_reason: FinishReason,
    /// Token usage for the round
    pub usage: Usage,
}

impl BackendResponse {
    /// Tool calls contained in this round, in response order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Text blocks joined with newlines, trimmed.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n").trim().to_string()
    }

    /// Returns `true` if this round requested any tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.blocks.iter().any(|b| {
            matches!(b, ContentBlock::ToolUse { .. })
        })
    }
}

/// Callbacks fired during processing for typing/presence signals.
///
/// All methods default to no-ops so callers implement only what they need.
#[async_trait]
pub trait ProcessCallbacks: Send + Sync {
    /// Fired once when the first text token of a turn arrives.
    async fn on_first_text(&self) {}
    /// Fired with intermediate round text when the round also calls tools.
    async fn on_text(&self, _text: &str) {}
    /// Fired before each tool call executes.
    async fn on_tool_start(&self, _tool: &str) {}
    /// Fired after a tool batch finishes.
    async fn on_tool_end(&self) {}
}

/// The do-nothing callback set.
pub struct NoCallbacks;

#[async_trait]
impl ProcessCallbacks for NoCallbacks {}

/// Cooperative cancellation token for in-flight message handling.
///
/// Setting the token is idempotent and safe after the handler has already
/// completed. The loop engine polls it only at defined suspension points
/// (between rounds), never mid network call.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// Create a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal interruption.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check whether interruption was signaled.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One streamed request/response cycle against a provider.
///
/// Implemented by the API backends so the shared loop engine in
/// [`crate::agent::r#loop`] can drive rounds without knowing wire formats.
#[async_trait]
pub trait RoundClient: Send + Sync {
    /// Send system + messages + tools and decode the response.
    ///
    /// Fires `callbacks.on_first_text()` once when the first text token of
    /// the round streams in.
    async fn request_round(
        &self,
        model: &InferenceModel,
        system: &[SystemBlock],
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        callbacks: &dyn ProcessCallbacks,
        thinking: bool,
    ) -> Result<BackendResponse, BackendError>;
}

/// The interface the Brain uses to talk to LLM providers.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run the multi-round tool-use loop and return the final reply text.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<String, BackendError>;

    /// Count tokens for the given context.
    ///
    /// Returns `Ok(-1)` when counting is unsupported or fails transiently;
    /// errors are reserved for hard failures.
    async fn count_tokens(
        &self,
        model_id: &str,
        system: &[SystemBlock],
        tools: &[ToolDefinition],
        messages: &[ChatMessage],
    ) -> Result<i64, BackendError>;

    /// One-shot low-latency completion for summarization and classification
    /// helpers. Runs on the configured fast tier.
    async fn utility_complete(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError>;
}

/// Construct the configured inference backend.
///
/// Backends are built here and injected explicitly into the Brain; there is
/// no ambient "current backend" state anywhere in the crate.
pub fn create_backend(config: &Config) -> Result<Arc<dyn InferenceBackend>, FamulusError> {
    match config.backend.as_str() {
        "anthropic" => {
            let api_key = config
                .anthropic_api_key
                .clone()
                .ok_or_else(|| FamulusError::Config("anthropic backend needs an API key".into()))?;
            Ok(Arc::new(AnthropicBackend::new(
                api_key,
                config.fast_model(),
            )))
        }
        "openai-compat" => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                FamulusError::Config("openai-compat backend needs an API key".into())
            })?;
            Ok(Arc::new(OpenAiCompatBackend::new(
                config.openai_base_url.clone(),
                api_key,
                config.fast_model(),
            )))
        }
        "cli-agent" => Ok(Arc::new(CliAgentBackend::new(
            config.cli_agent_binary.clone(),
            config.data_dir.join("cli-agent"),
        ))),
        other => Err(FamulusError::Config(format!(
            "Unknown inference backend: {:?}",
            other
        ))),
    }
}
