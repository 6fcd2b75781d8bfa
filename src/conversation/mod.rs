//! Conversation state management
//!
//! This module provides the `ConversationStore`: per-room ordered message
//! history plus room metadata. The Brain owns exactly one store; the loop
//! engine works on a conversation checked out for the duration of a single
//! `process` call, and the store lock is never held across an external call.

pub mod types;

pub use types::{
    extract_text, CacheControl, ChatMessage, ContentBlock, ImageSource, MessageBody,
    MessageContent, Role, RoomInfo, RoomKind, RoomMessage,
};

use std::collections::HashMap;
use tokio::sync::RwLock;

/// Per-room conversation history and room metadata.
///
/// All methods take and release the internal lock synchronously; callers that
/// need to run a conversation through an inference backend check the message
/// list out with [`checkout`](ConversationStore::checkout), mutate their local
/// copy, and write it back with [`commit`](ConversationStore::commit). The
/// scheduler guarantees at most one in-flight handler, so a room is only ever
/// mutated from one logical thread of control.
#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
    rooms: RwLock<HashMap<String, RoomInfo>>,
}

impl ConversationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a room has been seen before (history loaded or any
    /// message appended).
    pub async fn has_room(&self, room_id: &str) -> bool {
        self.conversations.read().await.contains_key(room_id)
    }

    /// Number of messages currently stored for a room.
    pub async fn len(&self, room_id: &str) -> usize {
        self.conversations
            .read()
            .await
            .get(room_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Returns `true` if the room has no stored messages.
    pub async fn is_empty(&self, room_id: &str) -> bool {
        self.len(room_id).await == 0
    }

    /// Append one message to a room, creating the room entry if needed.
    pub async fn append(&self, room_id: &str, message: ChatMessage) {
        self.conversations
            .write()
            .await
            .entry(room_id.to_string())
            .or_default()
            .push(message);
    }

    /// Clone the current message list for a room.
    ///
    /// The engine mutates the returned copy while the store stays unlocked,
    /// then writes the result back with [`commit`](ConversationStore::commit).
    pub async fn checkout(&self, room_id: &str) -> Vec<ChatMessage> {
        self.conversations
            .write()
            .await
            .entry(room_id.to_string())
            .or_default()
            .clone()
    }

    /// Replace a room's message list wholesale.
    ///
    /// Used both to check a worked-on conversation back in and by compaction,
    /// which swaps aged history for a summary in one step.
    pub async fn commit(&self, room_id: &str, messages: Vec<ChatMessage>) {
        self.conversations
            .write()
            .await
            .insert(room_id.to_string(), messages);
    }

    /// Seed a room from transport-side history. Returns the count loaded.
    ///
    /// Messages from the agent itself become assistant messages; everything
    /// else becomes a user message prefixed with its timestamp and sender so
    /// the model keeps multi-user attribution.
    pub async fn load_history(
        &self,
        room_id: &str,
        agent_username: &str,
        messages: &[RoomMessage],
    ) -> usize {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.entry(room_id.to_string()).or_default();
        for msg in messages {
            if msg.username == agent_username {
                conversation.push(ChatMessage::assistant(&msg.text));
            } else {
                let ts = msg.timestamp.format("%Y-%m-%d %H:%M");
                conversation.push(ChatMessage::user(&format!(
                    "[{}] @{}: {}",
                    ts, msg.username, msg.text
                )));
            }
        }
        messages.len()
    }

    /// Store metadata about a room.
    pub async fn set_room_info(&self, info: RoomInfo) {
        self.rooms.write().await.insert(info.room_id.clone(), info);
    }

    /// Fetch metadata about a room, if known.
    pub async fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Count active cache markers across a room's whole history.
    ///
    /// The conversation invariant is that this never exceeds one.
    pub async fn cache_marker_count(&self, room_id: &str) -> usize {
        self.conversations
            .read()
            .await
            .get(room_id)
            .map(|msgs| msgs.iter().map(ChatMessage::cache_marker_count).sum())
            .unwrap_or(0)
    }
}
