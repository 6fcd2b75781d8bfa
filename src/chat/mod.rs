//! Chat transport interface
//!
//! Concrete chat protocols (websocket subscriptions, DDP, terminal rendering)
//! live outside this crate; the core consumes them through the `ChatClient`
//! trait. A small console client is included so the binary can run without an
//! external transport: it publishes replies onto the bus's outbound side,
//! where a printer task picks them up.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{MessageBus, OutboundMessage};
use crate::conversation::RoomMessage;
use crate::error::{FamulusError, Result};

/// The interface the scheduler and handlers use to talk back to chat.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// The agent's own username on this transport.
    fn username(&self) -> &str;

    /// Send a message to a room, optionally inside a thread.
    async fn send_message(&self, room_id: &str, text: &str, thread_id: &str) -> Result<()>;

    /// Toggle the typing indicator in a room.
    async fn send_typing(&self, room_id: &str, typing: bool) -> Result<()>;

    /// Signal that the agent is busy (running tools).
    async fn set_status_busy(&self) -> Result<()>;

    /// Signal that the agent is available again.
    async fn set_status_available(&self) -> Result<()>;

    /// Fetch recent history for a room, oldest first.
    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<RoomMessage>>;

    /// Fetch an attachment's raw bytes by transport URL.
    async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>>;
}

/// Development transport backed by the message bus.
///
/// Replies go to the outbound queue; the binary runs a printer task over it.
/// Has no history and no attachments; status and typing signals are logged at
/// debug level only.
pub struct ConsoleChatClient {
    username: String,
    bus: Arc<MessageBus>,
}

impl ConsoleChatClient {
    /// Create a console client with the given agent username.
    pub fn new(username: &str, bus: Arc<MessageBus>) -> Self {
        Self {
            username: username.to_string(),
            bus,
        }
    }
}

#[async_trait]
impl ChatClient for ConsoleChatClient {
    fn username(&self) -> &str {
        &self.username
    }

    async fn send_message(&self, room_id: &str, text: &str, thread_id: &str) -> Result<()> {
        self.bus
            .publish_outbound(OutboundMessage::new(room_id, text).with_thread(thread_id))
            .await
    }

    async fn send_typing(&self, room_id: &str, typing: bool) -> Result<()> {
        debug!(room = room_id, typing, "typing signal");
        Ok(())
    }

    async fn set_status_busy(&self) -> Result<()> {
        debug!("status: busy");
        Ok(())
    }

    async fn set_status_available(&self) -> Result<()> {
        debug!("status: available");
        Ok(())
    }

    async fn fetch_messages(&self, _room_id: &str) -> Result<Vec<RoomMessage>> {
        Ok(Vec::new())
    }

    async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>> {
        Err(FamulusError::Chat(format!(
            "console transport has no attachments: {}",
            url
        )))
    }
}
