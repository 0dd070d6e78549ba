//! Message types for actor communication.
//!
//! Inter-actor communication uses typed messages over `tokio::sync::mpsc`;
//! request/reply uses `tokio::sync::oneshot`.

use super::connection::ConnectionHandle;
use super::room::RoomHandle;

use crate::errors::RoomError;
use crate::negotiation::{NegotiatedSession, NegotiationError};
use crate::report::RoomReport;

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Messages sent to the `RoomPool` actor.
#[derive(Debug)]
pub enum PoolMessage {
    /// Look up a live room.
    Get {
        room_id: String,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },

    /// Register a room spawned by the caller.
    Attach {
        room_id: String,
        handle: RoomHandle,
        task_handle: JoinHandle<()>,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    /// Return the room for `room_id`, spawning it on a miss.
    GetOrCreate {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomHandle, RoomError>>,
    },

    /// Collect inspection reports from every room.
    Report {
        respond_to: oneshot::Sender<Vec<RoomReport>>,
    },

    /// Get current pool status.
    Status {
        respond_to: oneshot::Sender<PoolStatus>,
    },

    /// Run an idle sweep now. Replies with the number of evicted rooms.
    Sweep { respond_to: oneshot::Sender<usize> },

    /// Outcome of an idle sweep: rooms that expired themselves.
    IdleChecked {
        expired: Vec<RoomHandle>,
        respond_to: Option<oneshot::Sender<usize>>,
    },

    /// Stop accepting rooms and cancel every room.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// A transport connection reached this room. No participant exists yet.
    Join {
        participant_id: String,
        connection: ConnectionHandle,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    /// One inbound text frame from a connection.
    Inbound { participant_id: String, text: String },

    /// The connection closed or failed.
    Disconnected {
        participant_id: String,
        reason: DisconnectReason,
    },

    /// A publish negotiation finished.
    PublishNegotiated {
        participant_id: String,
        channel: String,
        negotiation_id: u64,
        result: Result<NegotiatedSession, NegotiationError>,
    },

    /// A subscribe negotiation finished.
    SubscribeNegotiated {
        participant_id: String,
        channel: String,
        negotiation_id: u64,
        result: Result<NegotiatedSession, NegotiationError>,
    },

    /// Read-only inspection snapshot.
    GetReport {
        respond_to: oneshot::Sender<RoomReport>,
    },

    /// Participant id of the established publisher of `channel`, if any.
    FindPublisher {
        channel: String,
        respond_to: oneshot::Sender<Option<String>>,
    },

    /// Shut the room down if it has been idle for at least `idle_timeout`.
    /// Replies `true` when the room shut down.
    ExpireIfIdle {
        idle_timeout: Duration,
        respond_to: oneshot::Sender<bool>,
    },

    /// Detach every participant and stop.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly close from either side.
    Closed,
    /// Transport error.
    Error(String),
}

impl DisconnectReason {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::Error(e) => e,
        }
    }
}

/// Frames queued for a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMessage {
    /// Text frame to write.
    Text(String),
    /// Close the connection after the frames queued before it.
    Close { reason: String },
}

/// Pool status snapshot.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Rooms currently registered.
    pub room_count: usize,
    /// Participants joined across all rooms.
    pub participant_count: usize,
    /// Whether the pool stopped accepting rooms.
    pub is_shutting_down: bool,
    /// Current pool mailbox depth.
    pub mailbox_depth: usize,
}
