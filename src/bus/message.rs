//! Message types for the Famulus message bus
//!
//! These are the transport-neutral shapes chat adapters publish into the bus
//! and read back out of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::RoomKind;

/// A reference to an attachment on an incoming message.
///
/// The transport resolves the URL to bytes on demand; the bus only carries
/// the reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Transport URL of the attachment
    pub url: String,
    /// MIME type, e.g. "image/png"
    pub media_type: String,
}

/// An incoming message from a chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport message id
    pub message_id: String,
    /// Sender username
    pub username: String,
    /// Plain message text
    pub text: String,
    /// Room the message arrived in
    pub room_id: String,
    /// Thread the message belongs to, empty if none
    #[serde(default)]
    pub thread_id: String,
    /// The kind of room
    pub kind: RoomKind,
    /// Attachment references
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// When the message was sent
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a text message with no attachments, timestamped now.
    pub fn new(message_id: &str, username: &str, room_id: &str, text: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            username: username.to_string(),
            text: text.to_string(),
            room_id: room_id.to_string(),
            thread_id: String::new(),
            kind: RoomKind::Direct,
            attachments: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the room kind (builder pattern).
    pub fn with_kind(mut self, kind: RoomKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the thread id (builder pattern).
    pub fn with_thread(mut self, thread_id: &str) -> Self {
        self.thread_id = thread_id.to_string();
        self
    }

    /// Add an attachment reference (builder pattern).
    pub fn with_attachment(mut self, url: &str, media_type: &str) -> Self {
        self.attachments.push(AttachmentRef {
            url: url.to_string(),
            media_type: media_type.to_string(),
        });
        self
    }
}

/// An outgoing reply to be delivered by a chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Target room
    pub room_id: String,
    /// Reply text
    pub text: String,
    /// Thread to reply in, empty for the main room
    #[serde(default)]
    pub thread_id: String,
}

impl OutboundMessage {
    /// Create a reply for a room.
    pub fn new(room_id: &str, text: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            text: text.to_string(),
            thread_id: String::new(),
        }
    }

    /// Set the thread id (builder pattern).
    pub fn with_thread(mut self, thread_id: &str) -> Self {
        self.thread_id = thread_id.to_string();
        self
    }
}
