//! Message processing scheduler
//!
//! Supervises concurrent inbound-message handling with interruption. The
//! scheduler races exactly two futures: the in-flight handler task and the
//! fetch of the next inbound message. When the next message wins the race,
//! the in-flight handler is signaled through its cooperative `Interrupt`
//! token and awaited to natural completion before the successor's handler
//! starts. Handlers run strictly in arrival order, one at a time.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Local;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::agent::{Brain, BrainResponse, APOLOGY};
use crate::backend::{Interrupt, ProcessCallbacks};
use crate::bus::{InboundMessage, MessageBus};
use crate::chat::ChatClient;
use crate::conversation::{MessageContent, RoomInfo};
use crate::error::Result;

/// Scheduler lifecycle state, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for an inbound message
    Idle,
    /// A handler is in flight
    Processing,
    /// The in-flight handler was superseded and is finishing up
    Interrupted,
}

/// Supervises message handlers over the bus.
pub struct MessageScheduler {
    bus: Arc<MessageBus>,
    client: Arc<dyn ChatClient>,
    brain: Arc<Brain>,
    state: AtomicU8,
}

impl MessageScheduler {
    /// Create a scheduler over injected collaborators.
    pub fn new(bus: Arc<MessageBus>, client: Arc<dyn ChatClient>, brain: Arc<Brain>) -> Self {
        Self {
            bus,
            client,
            brain,
            state: AtomicU8::new(SchedulerState::Idle as u8),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::SeqCst) {
            1 => SchedulerState::Processing,
            2 => SchedulerState::Interrupted,
            _ => SchedulerState::Idle,
        }
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(?state, "Scheduler state");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Run until the inbound channel closes or a fatal error occurs.
    ///
    /// Fatal classification: authentication errors from anywhere inside
    /// message handling propagate out unmodified and terminate the loop;
    /// every other failure is logged and the loop continues with the next
    /// message.
    pub async fn run(&self) -> Result<()> {
        let mut pending: Option<InboundMessage> = None;

        loop {
            let msg = match pending.take() {
                Some(msg) => msg,
                None => {
                    self.set_state(SchedulerState::Idle);
                    match self.bus.consume_inbound().await {
                        Some(msg) => msg,
                        None => break,
                    }
                }
            };

            self.set_state(SchedulerState::Processing);
            let interrupt = Interrupt::new();
            let mut handler = tokio::spawn(handle_message(
                self.client.clone(),
                self.brain.clone(),
                msg,
                interrupt.clone(),
            ));

            tokio::select! {
                joined = &mut handler => {
                    check_handler_result(joined)?;
                }
                next = self.bus.consume_inbound() => {
                    self.set_state(SchedulerState::Interrupted);
                    interrupt.set();
                    // The superseded handler finishes naturally before the
                    // successor starts.
                    let joined = (&mut handler).await;
                    check_handler_result(joined)?;
                    match next {
                        Some(msg) => pending = Some(msg),
                        None => break,
                    }
                }
            }
        }

        self.set_state(SchedulerState::Idle);
        info!("Scheduler stopped");
        Ok(())
    }
}

/// Propagate fatal errors; log everything else and keep going.
fn check_handler_result(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_fatal() => Err(e),
        Ok(Err(e)) => {
            error!(error = %e, "Unhandled error processing message");
            Ok(())
        }
        Err(join_err) => {
            error!(error = %join_err, "Message handler panicked");
            Ok(())
        }
    }
}

/// Typing/status signals bridged back to the chat transport.
struct ChatSignals {
    client: Arc<dyn ChatClient>,
    room_id: String,
    thread_id: String,
}

#[async_trait::async_trait]
impl ProcessCallbacks for ChatSignals {
    async fn on_first_text(&self) {
        if let Err(e) = self.client.send_typing(&self.room_id, true).await {
            warn!(error = %e, "Failed to send typing signal");
        }
    }

    async fn on_text(&self, text: &str) {
        if let Err(e) = self
            .client
            .send_message(&self.room_id, text, &self.thread_id)
            .await
        {
            warn!(error = %e, "Failed to surface intermediate text");
        }
    }

    async fn on_tool_start(&self, _tool: &str) {
        let _ = self.client.send_typing(&self.room_id, false).await;
        if let Err(e) = self.client.set_status_busy().await {
            warn!(error = %e, "Failed to set busy status");
        }
    }

    async fn on_tool_end(&self) {
        if let Err(e) = self.client.set_status_available().await {
            warn!(error = %e, "Failed to set available status");
        }
    }
}

/// Handle one incoming message end to end.
pub async fn handle_message(
    client: Arc<dyn ChatClient>,
    brain: Arc<Brain>,
    msg: InboundMessage,
    interrupt: Interrupt,
) -> Result<()> {
    info!(
        from = %msg.username,
        room = %msg.room_id,
        text = %msg.text.chars().take(50).collect::<String>(),
        "Message"
    );

    if !brain.has_history(&msg.room_id).await {
        info!(room = %msg.room_id, "New room, loading history");
        match client.fetch_messages(&msg.room_id).await {
            Ok(history) => {
                let count = brain.load_history(&msg.room_id, &history).await;
                info!(count, "Loaded history");
            }
            Err(e) => warn!(error = %e, "Failed to fetch room history"),
        }
        brain
            .set_room_info(
                RoomInfo::new(&msg.room_id, msg.kind).with_members(vec![msg.username.clone()]),
            )
            .await;
    }

    let content = build_content(client.as_ref(), &msg).await;
    let callbacks = ChatSignals {
        client: client.clone(),
        room_id: msg.room_id.clone(),
        thread_id: msg.thread_id.clone(),
    };

    let response = match brain
        .process(&msg.room_id, content, &callbacks, &interrupt, None, false)
        .await
    {
        Ok(response) => response,
        Err(e) if e.is_fatal() => {
            let _ = client.send_typing(&msg.room_id, false).await;
            return Err(e);
        }
        Err(e) => {
            error!(error = %e, from = %msg.username, room = %msg.room_id, "Error processing message");
            BrainResponse {
                text: APOLOGY.to_string(),
            }
        }
    };

    let _ = client.send_typing(&msg.room_id, false).await;

    // Tool-only turns yield no text and therefore no reply
    if !response.text.is_empty() {
        if let Err(e) = client
            .send_message(&msg.room_id, &response.text, &msg.thread_id)
            .await
        {
            error!(error = %e, room = %msg.room_id, "Failed to send response");
        }
    }

    Ok(())
}

/// Build `MessageContent` from an inbound message, fetching any attachments.
async fn build_content(client: &dyn ChatClient, msg: &InboundMessage) -> MessageContent {
    let mut images = Vec::new();
    for att in &msg.attachments {
        match client.fetch_attachment(&att.url).await {
            Ok(data) => images.push((att.media_type.clone(), data)),
            Err(e) => warn!(url = %att.url, error = %e, "Failed to fetch attachment"),
        }
    }

    MessageContent {
        username: msg.username.clone(),
        message_id: msg.message_id.clone(),
        timestamp: msg
            .timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        text: msg.text.clone(),
        thread_id: msg.thread_id.clone(),
        images,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, FamulusError};

    #[tokio::test]
    async fn test_check_handler_result_ok() {
        let task = tokio::spawn(async { Ok(()) });
        assert!(check_handler_result(task.await).is_ok());
    }

    #[tokio::test]
    async fn test_check_handler_result_propagates_auth() {
        let task = tokio::spawn(async {
            Err(FamulusError::from(BackendError::Auth("expired".into())))
        });
        let joined = task.await;
        let result = check_handler_result(joined);
        assert!(result.is_err());
        assert!(result.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_check_handler_result_swallows_api_errors() {
        let task =
            tokio::spawn(async { Err(FamulusError::from(BackendError::Api("flaky".into()))) });
        assert!(check_handler_result(task.await).is_ok());
    }

    #[tokio::test]
    async fn test_check_handler_result_swallows_panics() {
        let task = tokio::spawn(async {
            panic!("handler blew up");
            #[allow(unreachable_code)]
            Ok(())
        });
        assert!(check_handler_result(task.await).is_ok());
    }
}
