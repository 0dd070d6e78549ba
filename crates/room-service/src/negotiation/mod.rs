//! Negotiation backend surface.
//!
//! The media relay is an external collaborator. The room service only needs
//! an opaque capability to:
//!
//! - create a media session (publisher or subscriber side)
//! - connect a publisher session to a subscriber session
//! - process a remote SDP offer and produce the local SDP answer
//! - start gathering local ICE candidates, which the backend pushes into the
//!   candidate channel handed over at session creation
//! - accept remote ICE candidates
//! - release the session
//!
//! Nothing else about the relay's internals is assumed here.

pub mod mock;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque ICE candidate as exchanged with clients and the backend.
pub type IceCandidate = serde_json::Value;

/// Capacity of the per-session local candidate channel.
pub const CANDIDATE_CHANNEL_BUFFER: usize = 64;

/// Errors reported by the negotiation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    /// The backend refused the SDP offer.
    #[error("offer rejected: {0}")]
    OfferRejected(String),

    /// Connecting two sessions failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A remote ICE candidate could not be applied.
    #[error("ICE candidate rejected: {0}")]
    IceCandidate(String),

    /// Releasing the session failed.
    #[error("release failed: {0}")]
    Release(String),

    /// The backend is not reachable.
    #[error("negotiation backend unavailable")]
    Unavailable,
}

/// Which side of the media flow a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Receives media from a publishing client.
    Publisher,
    /// Sends media to a subscribing client.
    Subscriber,
}

impl SessionRole {
    /// Returns the role as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Publisher => "publisher",
            SessionRole::Subscriber => "subscriber",
        }
    }
}

/// Factory for media sessions.
#[async_trait::async_trait]
pub trait NegotiationBackend: Send + Sync {
    /// Create a media session.
    ///
    /// Local ICE candidates gathered for this session are sent on
    /// `candidates` until the session is released.
    async fn create_session(
        &self,
        role: SessionRole,
        candidates: mpsc::Sender<IceCandidate>,
    ) -> Result<Arc<dyn MediaSession>, NegotiationError>;
}

/// One negotiated media session inside the backend.
#[async_trait::async_trait]
pub trait MediaSession: Send + Sync + fmt::Debug {
    /// Backend identifier of this session.
    fn id(&self) -> &str;

    /// Route the media of this session into `sink`.
    async fn connect(&self, sink: &dyn MediaSession) -> Result<(), NegotiationError>;

    /// Apply the remote offer and return the local answer.
    async fn process_offer(&self, sdp_offer: &str) -> Result<String, NegotiationError>;

    /// Start gathering local ICE candidates.
    async fn gather_candidates(&self) -> Result<(), NegotiationError>;

    /// Apply a remote ICE candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Release the session and all backend resources behind it.
    async fn release(&self) -> Result<(), NegotiationError>;
}

/// Outcome of a successful offer/answer exchange.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    /// The established backend session.
    pub session: Arc<dyn MediaSession>,
    /// Local SDP answer to deliver to the client.
    pub sdp_answer: String,
}

/// Release sessions one after another, in the given order.
///
/// Runs off the room's execution context. Failures are logged and do not
/// stop the remaining releases.
pub fn spawn_release(room_id: &str, sessions: Vec<Arc<dyn MediaSession>>) {
    if sessions.is_empty() {
        return;
    }
    let room_id = room_id.to_string();
    tokio::spawn(async move {
        for session in sessions {
            if let Err(e) = session.release().await {
                tracing::warn!(
                    target: "rs.negotiation",
                    room_id = %room_id,
                    session_id = %session.id(),
                    error = %e,
                    "Failed to release media session"
                );
            }
        }
    });
}

/// Forward a remote ICE candidate to the backend without waiting for it.
pub fn spawn_add_ice_candidate(session: Arc<dyn MediaSession>, candidate: IceCandidate) {
    tokio::spawn(async move {
        if let Err(e) = session.add_ice_candidate(candidate).await {
            tracing::debug!(
                target: "rs.negotiation",
                session_id = %session.id(),
                error = %e,
                "ICE candidate ignored by backend"
            );
        }
    });
}

/// Ask the backend to start gathering local candidates without waiting for it.
pub fn spawn_gather_candidates(session: Arc<dyn MediaSession>) {
    tokio::spawn(async move {
        if let Err(e) = session.gather_candidates().await {
            tracing::warn!(
                target: "rs.negotiation",
                session_id = %session.id(),
                error = %e,
                "Failed to start ICE candidate gathering"
            );
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_role_labels() {
        assert_eq!(SessionRole::Publisher.as_str(), "publisher");
        assert_eq!(SessionRole::Subscriber.as_str(), "subscriber");
    }

    #[test]
    fn test_negotiation_error_display() {
        assert_eq!(
            NegotiationError::OfferRejected("bad sdp".to_string()).to_string(),
            "offer rejected: bad sdp"
        );
        assert_eq!(
            NegotiationError::Unavailable.to_string(),
            "negotiation backend unavailable"
        );
    }
}
