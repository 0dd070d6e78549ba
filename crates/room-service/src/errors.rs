//! Room service error types.
//!
//! Protocol and negotiation errors are reported to the originating client as
//! `{"id": "error", "data": ...}`. Internal details are logged server-side
//! but not exposed to clients.

use crate::negotiation::NegotiationError;
use thiserror::Error;

/// Room service error type.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Operation requires a participant but the connection has not joined.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// No live publication exists for the requested channel.
    #[error("Wrong channel: {0}")]
    WrongChannel(String),

    /// Unknown, malformed or non-JSON message.
    #[error("Wrong message")]
    WrongMessage,

    /// Another publication already holds this channel in the room.
    #[error("Channel already published: {0}")]
    ChannelInUse(String),

    /// The connection already has a participant in this room.
    #[error("Participant already joined: {0}")]
    AlreadyJoined(String),

    /// The negotiation backend rejected the session.
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// The room actor is gone (shut down or evicted).
    #[error("Room is closed")]
    RoomClosed,

    /// A different room is already registered under this id.
    #[error("Room already exists: {0}")]
    RoomExists(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Returns the client-facing text carried in the `data` field of an
    /// `error` message.
    pub fn client_message(&self) -> String {
        match self {
            RoomError::ParticipantNotFound(_) => "Participant not found".to_string(),
            RoomError::WrongChannel(_) => "Wrong channel".to_string(),
            RoomError::WrongMessage => "Wrong message".to_string(),
            RoomError::ChannelInUse(_) => "Channel already published".to_string(),
            RoomError::AlreadyJoined(_) => "Already joined".to_string(),
            RoomError::Negotiation(_) => "Negotiation failed".to_string(),
            RoomError::RoomClosed => "Room is closed".to_string(),
            RoomError::RoomExists(_) | RoomError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Short bounded label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomError::ParticipantNotFound(_) => "participant_not_found",
            RoomError::WrongChannel(_) => "wrong_channel",
            RoomError::WrongMessage => "wrong_message",
            RoomError::ChannelInUse(_) => "channel_in_use",
            RoomError::AlreadyJoined(_) => "already_joined",
            RoomError::Negotiation(_) => "negotiation",
            RoomError::RoomClosed => "room_closed",
            RoomError::RoomExists(_) => "room_exists",
            RoomError::Internal(_) => "internal",
        }
    }
}
