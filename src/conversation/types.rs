//! Conversation types for Famulus
//!
//! This module defines the core types for conversation state: rooms, chat
//! messages, and the typed content blocks that travel to and from inference
//! backends (text, images, tool calls, tool results).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How many characters of a tool result survive into a compaction transcript.
const TOOL_RESULT_EXCERPT_CHARS: usize = 200;

/// The kind of a chat room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// One-on-one direct message
    Direct,
    /// Multi-user direct message
    Group,
    /// Public channel
    Public,
    /// Private channel
    Private,
}

impl RoomKind {
    /// Returns `true` for direct and group DMs.
    pub fn is_dm(&self) -> bool {
        matches!(self, RoomKind::Direct | RoomKind::Group)
    }
}

/// Metadata about a chat room.
///
/// Created on first contact with a room and updated when membership or
/// naming changes; lives for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Stable room identifier from the chat transport
    pub room_id: String,
    /// The kind of room
    pub kind: RoomKind,
    /// Usernames of the room members
    pub members: Vec<String>,
    /// Display name, if the room has one
    #[serde(default)]
    pub name: String,
}

impl RoomInfo {
    /// Create room metadata with the given id and kind.
    pub fn new(room_id: &str, kind: RoomKind) -> Self {
        Self {
            room_id: room_id.to_string(),
            kind,
            members: Vec::new(),
            name: String::new(),
        }
    }

    /// Set the member list (builder pattern).
    pub fn with_members(mut self, members: Vec<String>) -> Self {
        self.members = members;
        self
    }

    /// Set the display name (builder pattern).
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

/// A message fetched from a room's transport-side history.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    /// Transport message id
    pub message_id: String,
    /// Sender username
    pub username: String,
    /// Plain message text
    pub text: String,
    /// When the message was sent
    pub timestamp: DateTime<Utc>,
    /// Thread the message belongs to, empty if none
    pub thread_id: String,
}

/// The role of a conversation message.
///
/// Tool results travel inside user-role block messages and system content
/// travels as separate system blocks, per the provider wire formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Messages from users (including tool-result carrier messages)
    User,
    /// Messages from the model
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// An ephemeral prompt-cache marker with a fixed TTL.
///
/// At most one marker is active across a conversation at any time; the cache
/// manager moves it to the newest tool result each round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheControl {
    #[serde(rename = "type")]
    kind: String,
    ttl: String,
}

impl CacheControl {
    /// Create the standard ephemeral marker.
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
            ttl: "5m".to_string(),
        }
    }
}

impl Default for CacheControl {
    fn default() -> Self {
        Self::ephemeral()
    }
}

/// A base64 image payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    kind: String,
    /// MIME type, e.g. "image/png"
    pub media_type: String,
    /// Base64-encoded image bytes
    pub data: String,
}

impl ImageSource {
    /// Create a base64 image source.
    pub fn base64(media_type: &str, data: String) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: media_type.to_string(),
            data,
        }
    }
}

/// A typed content block inside a conversation message.
///
/// The tagged serde representation matches the block-based provider wire
/// format, so block messages serialize without an intermediate mapping step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text { text: String },
    /// An inline image
    Image { source: ImageSource },
    /// A tool invocation requested by the model
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// The result of a tool invocation, fed back to the model
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentBlock {
    /// Create a text block.
    pub fn text(text: &str) -> Self {
        ContentBlock::Text {
            text: text.to_string(),
        }
    }

    /// Create a tool-result block.
    pub fn tool_result(tool_use_id: &str, content: &str, is_error: bool) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: content.to_string(),
            is_error,
            cache_control: None,
        }
    }

    /// Returns `true` for tool-result blocks.
    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }
}

/// The body of a conversation message: a plain string or typed blocks.
///
/// Plain-string bodies are never cache-marked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    /// Simple text content
    Text(String),
    /// An ordered list of typed blocks
    Blocks(Vec<ContentBlock>),
}

/// A single message in a room's conversation.
///
/// Messages are immutable once appended, except for wholesale replacement of
/// a conversation by compaction and cache-marker maintenance on tool-result
/// blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender
    pub role: Role,
    /// The message content
    pub content: MessageBody,
}

impl ChatMessage {
    /// Create a plain-text user message.
    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageBody::Text(text.to_string()),
        }
    }

    /// Create a plain-text assistant message.
    pub fn assistant(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageBody::Text(text.to_string()),
        }
    }

    /// Create a user message carrying typed blocks (e.g. tool results).
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageBody::Blocks(blocks),
        }
    }

    /// Create an assistant message carrying typed blocks.
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageBody::Blocks(blocks),
        }
    }

    /// Count active cache markers on this message's tool-result blocks.
    pub fn cache_marker_count(&self) -> usize {
        match &self.content {
            MessageBody::Text(_) => 0,
            MessageBody::Blocks(blocks) => blocks
                .iter()
                .filter(|b| {
                    matches!(
                        b,
                        ContentBlock::ToolResult {
                            cache_control: Some(_),
                            ..
                        }
                    )
                })
                .count(),
        }
    }
}

/// Pull plain text from a message body for compaction transcripts.
///
/// Text blocks pass through verbatim; images and tool invocations are
/// skipped; tool results are annotated compactly with a short excerpt.
pub fn extract_text(content: &MessageBody) -> String {
    match content {
        MessageBody::Text(text) => text.clone(),
        MessageBody::Blocks(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(text.clone()),
                    ContentBlock::ToolResult { content, .. } if !content.is_empty() => {
                        let excerpt: String =
                            content.chars().take(TOOL_RESULT_EXCERPT_CHARS).collect();
                        parts.push(format!("[tool result: {}]", excerpt));
                    }
                    _ => {}
                }
            }
            parts.join("\n")
        }
    }
}

/// Content of one incoming chat message, ready for the Brain.
///
/// The transport handler resolves attachments into raw image bytes before
/// constructing this, so the Brain never performs transport I/O.
#[derive(Debug, Clone, Default)]
pub struct MessageContent {
    /// Sender username
    pub username: String,
    /// Transport message id, empty for synthetic messages
    pub message_id: String,
    /// Pre-formatted local timestamp, empty if unknown
    pub timestamp: String,
    /// Plain message text
    pub text: String,
    /// Thread the message belongs to, empty if none
    pub thread_id: String,
    /// (media type, raw bytes) pairs for image attachments
    pub images: Vec<(String, Vec<u8>)>,
}

impl MessageContent {
    /// Create text-only content from a sender.
    pub fn text(username: &str, text: &str) -> Self {
        Self {
            username: username.to_string(),
            text: text.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_kind_is_dm() {
        assert!(RoomKind::Direct.is_dm());
        assert!(RoomKind::Group.is_dm());
        assert!(!RoomKind::Public.is_dm());
        assert!(!RoomKind::Private.is_dm());
    }

    #[test]
    fn test_room_info_builder() {
        let info = RoomInfo::new("r1", RoomKind::Private)
            .with_members(vec!["ada".into(), "grace".into()])
            .with_name("ops");
        assert_eq!(info.room_id, "r1");
        assert_eq!(info.members.len(), 2);
        assert_eq!(info.name, "ops");
    }

    #[test]
    fn test_role_serialize() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), r#""user""#);
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            r#""assistant""#
        );
    }

    #[test]
    fn test_cache_control_wire_format() {
        let json = serde_json::to_value(CacheControl::ephemeral()).unwrap();
        assert_eq!(json["type"], "ephemeral");
        assert_eq!(json["ttl"], "5m");
    }

    #[test]
    fn test_content_block_tagged_serialization() {
        let block = ContentBlock::text("hello");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");

        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "list_files".into(),
            input: serde_json::json!({"path": "."}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "list_files");
    }

    #[test]
    fn test_tool_result_omits_absent_cache_control() {
        let block = ContentBlock::tool_result("tu_1", "ok", false);
        let json = serde_json::to_string(&block).unwrap();
        assert!(!json.contains("cache_control"));
    }

    #[test]
    fn test_message_body_untagged_roundtrip() {
        let text: MessageBody = serde_json::from_str(r#""plain words""#).unwrap();
        assert!(matches!(text, MessageBody::Text(_)));

        let blocks: MessageBody =
            serde_json::from_str(r#"[{"type": "text", "text": "hi"}]"#).unwrap();
        assert!(matches!(blocks, MessageBody::Blocks(_)));
    }

    #[test]
    fn test_cache_marker_count() {
        let plain = ChatMessage::user("hi");
        assert_eq!(plain.cache_marker_count(), 0);

        let mut marked = ContentBlock::tool_result("tu_1", "ok", false);
        if let ContentBlock::ToolResult { cache_control, .. } = &mut marked {
            *cache_control = Some(CacheControl::ephemeral());
        }
        let msg = ChatMessage::user_blocks(vec![
            ContentBlock::tool_result("tu_0", "ok", false),
            marked,
        ]);
        assert_eq!(msg.cache_marker_count(), 1);
    }

    #[test]
    fn test_extract_text_plain() {
        assert_eq!(extract_text(&MessageBody::Text("hi".into())), "hi");
    }

    #[test]
    fn test_extract_text_skips_images_and_tool_use() {
        let body = MessageBody::Blocks(vec![
            ContentBlock::Image {
                source: ImageSource::base64("image/png", "aGk=".into()),
            },
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "list_files".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::text("visible"),
        ]);
        assert_eq!(extract_text(&body), "visible");
    }

    #[test]
    fn test_extract_text_annotates_tool_results() {
        let body = MessageBody::Blocks(vec![ContentBlock::tool_result("tu_1", "42 files", false)]);
        assert_eq!(extract_text(&body), "[tool result: 42 files]");
    }

    #[test]
    fn test_extract_text_truncates_long_tool_results() {
        let long = "x".repeat(500);
        let body = MessageBody::Blocks(vec![ContentBlock::tool_result("tu_1", &long, false)]);
        let text = extract_text(&body);
        assert!(text.len() < 300);
        assert!(text.starts_with("[tool result: xxx"));
    }

    #[test]
    fn test_extract_text_skips_empty_tool_results() {
        let body = MessageBody::Blocks(vec![ContentBlock::tool_result("tu_1", "", false)]);
        assert_eq!(extract_text(&body), "");
    }
}
