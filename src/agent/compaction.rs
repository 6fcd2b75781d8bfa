//! History compaction
//!
//! When a room's conversation grows past the context budget, the aged prefix
//! is summarized by a fast-tier completion and replaced with a two-message
//! synthetic exchange. A failing summarizer degrades to hard truncation, so
//! the conversation never blocks on a flaky model.

use tracing::error;

use crate::backend::InferenceBackend;
use crate::conversation::{extract_text, ChatMessage, ConversationStore};

/// How many recent messages survive compaction verbatim.
pub const MIN_RECENT_MESSAGES: usize = 6;

/// Marker prefix of the synthetic summary message.
pub const SUMMARY_MARKER: &str = "[Earlier conversation summary]";

const SUMMARY_PROMPT: &str = "Summarize this conversation into a concise recap. \
Preserve key facts, decisions, and context that would be needed to continue \
the conversation naturally. Be brief but thorough.";

/// Summarize older messages to free up context space.
///
/// No-op when the conversation is short or the aged prefix has no extractable
/// text. On success the conversation becomes
/// `[summary user message, assistant acknowledgement, ...recent]`; on
/// summarizer failure it becomes just the recent suffix.
pub async fn compact_history(
    backend: &dyn InferenceBackend,
    store: &ConversationStore,
    room_id: &str,
) {
    let messages = store.checkout(room_id).await;
    if messages.len() <= MIN_RECENT_MESSAGES {
        return;
    }

    let split = messages.len() - MIN_RECENT_MESSAGES;
    let (old, recent) = messages.split_at(split);

    let transcript = old
        .iter()
        .filter_map(|msg| {
            let text = extract_text(&msg.content);
            if text.is_empty() {
                None
            } else {
                Some(format!("{}: {}", msg.role, text))
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    if transcript.trim().is_empty() {
        return;
    }

    match summarize_transcript(backend, &transcript).await {
        Some(summary) => {
            let mut compacted = vec![
                ChatMessage::user(&format!("{}\n{}", SUMMARY_MARKER, summary)),
                ChatMessage::assistant("Got it, I have that context."),
            ];
            compacted.extend_from_slice(recent);
            store.commit(room_id, compacted).await;
        }
        None => {
            store.commit(room_id, recent.to_vec()).await;
        }
    }
}

/// Ask the backend for a conversation summary, or `None` on failure.
async fn summarize_transcript(backend: &dyn InferenceBackend, transcript: &str) -> Option<String> {
    match backend
        .utility_complete(&format!("{}\n\n{}", SUMMARY_PROMPT, transcript), 1024)
        .await
    {
        Ok(summary) => Some(summary),
        Err(e) => {
            error!(error = %e, "Summarization failed, falling back to truncation");
            None
        }
    }
}
