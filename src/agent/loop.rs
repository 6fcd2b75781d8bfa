//! Agentic tool-use round engine
//!
//! Drives the request/response/tool-execution cycle against any backend that
//! can serve a single round ([`RoundClient`]). The engine is provider
//! agnostic: backends decode their wire formats into [`BackendResponse`]
//! before the engine ever sees them.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::audit::{audit_log, log_usage, record_usage};
use crate::backend::{
    BackendResponse, FinishReason, InferenceModel, Interrupt, ProcessCallbacks, RoundClient,
    ToolCall,
};
use crate::conversation::{ChatMessage, ContentBlock};
use crate::error::BackendError;
use crate::prompt::SystemBlock;
use crate::tools::{ToolContext, ToolDefinition, ToolRegistry};

use super::cache::update_cache_breakpoints;

/// Maximum tool rounds per processed message. A finite bound on total work;
/// interruption is only observed between rounds, so this also caps how long a
/// stale handler can run after being superseded.
pub const MAX_TOOL_ROUNDS: usize = 10;

/// Appended once when a no-tool response was cut off by the output budget.
const CUT_OFF_NOTICE: &str =
    "\n\n(I hit my response length limit — ask me to continue if I got cut off)";

/// Injected when the round cap is reached while the model still wants tools.
const ROUND_LIMIT_NUDGE: &str = "[system: you've used all your tool rounds for this turn — \
please reply with a summary of what you found or did]";

/// Run the tool-use loop and return the final reply text.
///
/// Rounds are capped at [`MAX_TOOL_ROUNDS`]. The interruption token is polled
/// once per round, before the provider call (and therefore before that
/// round's tool batch); on interruption the text assembled from completed
/// rounds is returned as-is.
#[allow(clippy::too_many_arguments)]
pub async fn run_rounds(
    client: &dyn RoundClient,
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
    let mut used_tools = false;
    let mut rounds = 0;
    let mut exhausted = true;
    let mut partial = String::new();
    let mut last_response: Option<BackendResponse> = None;

    for _ in 0..MAX_TOOL_ROUNDS {
        if interrupt.is_set() {
            info!(rounds, "Agentic loop interrupted by new message");
            return Ok(partial.trim().to_string());
        }
        rounds += 1;

        let response = client
            .request_round(model, system, messages, tools, callbacks, thinking)
            .await?;

        log_usage(&model.model_id, &response.usage);
        record_usage(usage_dir, &model.model_id, &response.usage);

        let calls = response.tool_calls();
        if !calls.is_empty() {
            let text = response.text();
            if !text.is_empty() {
                callbacks.on_text(&text).await;
                partial.push_str(&text);
                partial.push('\n');
            }
            used_tools = true;

            for call in &calls {
                callbacks.on_tool_start(&call.name).await;
            }
            let mut results = execute_tools(&calls, registry, tool_ctx, audit_dir).await;
            callbacks.on_tool_end().await;

            update_cache_breakpoints(messages, &mut results);
            messages.push(ChatMessage::assistant_blocks(response.blocks.clone()));
            messages.push(ChatMessage::user_blocks(results));
            last_response = Some(response);
        } else if response.finish_reason == FinishReason::MaxTokens {
            warn!(
                max_output_tokens = model.max_output_tokens,
                "Response truncated at output budget"
            );
            exhausted = false;
            last_response = Some(response);
            break;
        } else {
            exhausted = false;
            last_response = Some(response);
            break;
        }
    }

    let Some(mut response) = last_response else {
        return Ok(partial.trim().to_string());
    };

    if exhausted && used_tools {
        info!(rounds, "Tool round limit reached, nudging for a text reply");
        messages.push(ChatMessage::user(ROUND_LIMIT_NUDGE));
        response = client
            .request_round(model, system, messages, &[], callbacks, thinking)
            .await?;
        log_usage(&model.model_id, &response.usage);
        record_usage(usage_dir, &model.model_id, &response.usage);
    }

    Ok(build_reply(&response, used_tools, rounds))
}

/// Execute a batch of tool calls, in order.
///
/// Returns one tool-result block per call, same order and length as the
/// input. Never fails: tool errors arrive as result text with `is_error`
/// set, and audit writing is fire-and-forget.
pub async fn execute_tools(
    calls: &[ToolCall],
    registry: &ToolRegistry,
    tool_ctx: &ToolContext,
    audit_dir: &Path,
) -> Vec<ContentBlock> {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        info!(tool = %call.name, "Tool call");
        let result = registry
            .execute(&call.name, call.input.clone(), tool_ctx)
            .await;
        let is_error = result.starts_with("Error:") || result.starts_with("Unknown tool:");
        debug!(tool = %call.name, result = %excerpt(&result), "Tool result");

        audit_log(audit_dir, &call.name, &call.input, &result, is_error);

        results.push(ContentBlock::tool_result(&call.id, &result, is_error));
    }
    results
}

fn excerpt(text: &str) -> String {
    text.chars().take(100).collect()
}

/// Extract the final reply text from a response.
///
/// Pure given (blocks, finish reason, tool-use flag): text blocks joined; a
/// cut-off notice appended exactly once when the output budget truncated a
/// no-tool turn; `""` for tool-only turns with no text; the literal
/// `"(no response)"` when nothing at all came back.
pub fn build_reply(response: &BackendResponse, had_tool_use: bool, rounds: usize) -> String {
    let text = response.text();
    let truncated = response.finish_reason == FinishReason::MaxTokens;

    if truncated && !had_tool_use {
        if text.is_empty() {
            return CUT_OFF_NOTICE.trim_start().to_string();
        }
        return format!("{}{}", text, CUT_OFF_NOTICE);
    }

    if text.is_empty() {
        if had_tool_use {
            info!(rounds, "Tool-only response, no text to send");
            return String::new();
        }
        warn!(
            finish_reason = ?response.finish_reason,
            rounds,
            max_rounds = MAX_TOOL_ROUNDS,
            "No text in response"
        );
        return "(no response)".to_string();
    }

    text
}
