//! System prompt construction
//!
//! The system prompt is assembled as content blocks so that tools + system
//! form a fully cacheable prefix. Everything here is stable between requests;
//! per-request context (time, room, sender) goes into the user message via
//! [`build_dynamic_context`].

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::conversation::{CacheControl, RoomInfo, RoomKind};

/// Default persona used when the workspace has no PERSONA.md yet.
const DEFAULT_PERSONA: &str = "You are Famulus, a helpful personal assistant living in a chat \
server.\n\nKeep responses concise and friendly. You are part of the conversation, not a formal \
assistant.";

/// A text block in the system prompt.
#[derive(Debug, Clone, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    kind: String,
    /// The block text
    pub text: String,
    /// Prompt-cache marker for the stable prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl SystemBlock {
    /// Create a text block.
    pub fn new(text: &str) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.to_string(),
            cache_control: None,
        }
    }
}

/// Write the default persona file into the workspace if it doesn't exist.
pub fn ensure_persona(workspace: &Path) {
    let path = workspace.join("PERSONA.md");
    if path.exists() {
        return;
    }
    let result =
        std::fs::create_dir_all(workspace).and_then(|_| std::fs::write(&path, DEFAULT_PERSONA));
    match result {
        Ok(()) => info!(path = %path.display(), "Wrote default persona"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to write default persona"),
    }
}

/// Build the system prompt as stable content blocks for prompt caching.
///
/// Reads PERSONA.md (and PRACTICE.md when present) from the workspace and
/// marks the final block with the cache marker.
pub fn build_system_blocks(workspace: &Path) -> Vec<SystemBlock> {
    let mut text = std::fs::read_to_string(workspace.join("PERSONA.md"))
        .unwrap_or_else(|_| DEFAULT_PERSONA.to_string());

    if let Ok(practice) = std::fs::read_to_string(workspace.join("PRACTICE.md")) {
        text.push_str("\n\n");
        text.push_str(&practice);
    }

    let mut blocks = vec![SystemBlock::new(&text)];
    if let Some(last) = blocks.last_mut() {
        last.cache_control = Some(CacheControl::ephemeral());
    }
    blocks
}

/// Describe a room for the model.
fn room_label(info: &RoomInfo) -> String {
    match info.kind {
        RoomKind::Direct => "a direct message".to_string(),
        RoomKind::Group => format!("a group DM with @{}", info.members.join(", @")),
        RoomKind::Private => format!("the private channel #{}", info.name),
        RoomKind::Public => format!("the channel #{}", info.name),
    }
}

/// Build per-request dynamic context to prepend to the user message.
///
/// Kept out of the system prompt so that tools + system stay a stable
/// cacheable prefix.
pub fn build_dynamic_context(
    current_time: &str,
    username: &str,
    room_info: Option<&RoomInfo>,
) -> String {
    let mut parts = vec![format!("Current time: {}", current_time)];
    if let Some(info) = room_info {
        parts.push(format!("This conversation is in {}.", room_label(info)));
    }
    parts.push(format!("Talking to: @{}", username));
    parts.join("\n")
}
