//! Prompt-cache breakpoint maintenance
//!
//! Exactly one ephemeral cache marker is kept across a conversation. Each
//! tool round the marker moves to the newest tool result, so the whole prefix
//! up to that result is reusable by the provider's prompt cache.

use crate::conversation::{CacheControl, ChatMessage, ContentBlock, MessageBody, Role};

/// Move the cache breakpoint to the latest tool result.
///
/// Strips any existing marker from every tool-result block across the full
/// history, then sets a fresh marker on the last of `new_results`. Plain
/// string message bodies are left untouched. Idempotent: repeated calls never
/// leave more than one marker.
pub fn update_cache_breakpoints(messages: &mut [ChatMessage], new_results: &mut [ContentBlock]) {
    for msg in messages.iter_mut() {
        if msg.role != Role::User {
            continue;
        }
        let MessageBody::Blocks(blocks) = &mut msg.content else {
            continue;
        };
        for block in blocks {
            if let ContentBlock::ToolResult { cache_control, .. } = block {
                *cache_control = None;
            }
        }
    }

    if let Some(ContentBlock::ToolResult { cache_control, .. }) = new_results.last_mut() {
        *cache_control = Some(CacheControl::ephemeral());
    }
}
