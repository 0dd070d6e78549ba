//! `ConnectionHandle` - outbound side of one client connection.
//!
//! The room never writes to a socket. It pushes frames into a bounded queue
//! that the transport task drains. Sends never wait: when the queue is full
//! the frame is dropped and counted, so one slow client cannot stall its
//! room.

use super::messages::ConnectionMessage;

use crate::observability::metrics as prom;
use crate::protocol::ServerMessage;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Default capacity of the outbound queue per connection.
pub const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// Sender side of a client connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection_id: String,
    sender: mpsc::Sender<ConnectionMessage>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the transport drains.
    #[must_use]
    pub fn new(
        connection_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ConnectionMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                connection_id: connection_id.into(),
                sender,
            },
            receiver,
        )
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a protocol message. Returns `false` if it was not queued.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match message.to_text() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(
                    target: "rs.transport",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Failed to encode outbound message"
                );
                false
            }
        }
    }

    /// Queue a raw text frame. Returns `false` if it was not queued.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        match self.sender.try_send(ConnectionMessage::Text(text.into())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                prom::record_message_dropped();
                warn!(
                    target: "rs.transport",
                    connection_id = %self.connection_id,
                    "Outbound queue full, dropping frame"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the transport to close the connection after draining queued frames.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.sender.try_send(ConnectionMessage::Close {
            reason: reason.into(),
        });
    }

    /// Whether the transport side is still reading the queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
