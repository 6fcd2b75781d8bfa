//! Message bus
//!
//! The `MessageBus` routes inbound messages (from chat transports to the
//! scheduler) and outbound messages (replies going back to transports). Both
//! directions are bounded Tokio MPSC queues, so arrival order is preserved;
//! the scheduler's ordering guarantee starts here.

pub mod message;

pub use message::{AttachmentRef, InboundMessage, OutboundMessage};

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::{FamulusError, Result};

/// Default buffer size for message channels
const DEFAULT_BUFFER_SIZE: usize = 100;

/// The central message bus between chat transports and the scheduler.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
}

impl MessageBus {
    /// Create a bus with the default buffer size.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a bus with a custom buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);
        Self {
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
        }
    }

    /// Publish an inbound message. Called by chat transport adapters.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| FamulusError::BusClosed)
    }

    /// Consume the next inbound message, in arrival order.
    ///
    /// Returns `None` when every sender has been dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Publish an outbound reply for a transport to deliver.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| FamulusError::BusClosed)
    }

    /// Consume the next outbound reply.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }

    /// A cloneable sender for transports that publish inbound messages.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
