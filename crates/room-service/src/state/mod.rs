//! Room membership state owned by a `RoomActor`.
//!
//! Nothing here is shared: a room exclusively owns its participants, and each
//! participant exclusively owns its publications and subscriptions. Backend
//! sessions are the only `Arc`s, because negotiation and release tasks run
//! outside the room.

pub mod participant;
pub mod publication;
pub mod subscription;

pub use participant::{Participant, Role};
pub use publication::Publication;
pub use subscription::Subscription;

use crate::actors::ConnectionHandle;
use crate::negotiation::{
    spawn_add_ice_candidate, IceCandidate, MediaSession, SessionRole, CANDIDATE_CHANNEL_BUFFER,
};
use crate::protocol::ServerMessage;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Remote candidates kept per entry while its negotiation is in flight.
const MAX_PENDING_CANDIDATES: usize = CANDIDATE_CHANNEL_BUFFER;

/// Negotiation progress of a publication or subscription.
#[derive(Debug)]
pub enum NegotiationState {
    /// Offer sent to the backend, answer not yet applied.
    Negotiating {
        negotiation_id: u64,
        /// Remote candidates received before the session existed.
        pending_candidates: Vec<IceCandidate>,
    },
    /// Backend session is live.
    Established { session: Arc<dyn MediaSession> },
}

impl NegotiationState {
    fn negotiating(negotiation_id: u64) -> Self {
        NegotiationState::Negotiating {
            negotiation_id,
            pending_candidates: Vec::new(),
        }
    }

    fn negotiation_id(&self) -> Option<u64> {
        match self {
            NegotiationState::Negotiating { negotiation_id, .. } => Some(*negotiation_id),
            NegotiationState::Established { .. } => None,
        }
    }

    fn session(&self) -> Option<&Arc<dyn MediaSession>> {
        match self {
            NegotiationState::Negotiating { .. } => None,
            NegotiationState::Established { session } => Some(session),
        }
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        match self {
            NegotiationState::Negotiating {
                negotiation_id,
                pending_candidates,
            } => {
                if pending_candidates.len() < MAX_PENDING_CANDIDATES {
                    pending_candidates.push(candidate);
                } else {
                    debug!(
                        target: "rs.negotiation",
                        negotiation_id = *negotiation_id,
                        "Candidate queue full, dropping remote candidate"
                    );
                }
            }
            NegotiationState::Established { session } => {
                spawn_add_ice_candidate(Arc::clone(session), candidate);
            }
        }
    }

    /// Switch to established and flush queued candidates into the session.
    fn establish(&mut self, session: Arc<dyn MediaSession>) {
        let previous = std::mem::replace(
            self,
            NegotiationState::Established {
                session: Arc::clone(&session),
            },
        );
        if let NegotiationState::Negotiating {
            pending_candidates, ..
        } = previous
        {
            for candidate in pending_candidates {
                spawn_add_ice_candidate(Arc::clone(&session), candidate);
            }
        }
    }

    fn into_session(self) -> Option<Arc<dyn MediaSession>> {
        match self {
            NegotiationState::Negotiating { .. } => None,
            NegotiationState::Established { session } => Some(session),
        }
    }
}

/// Create the local candidate channel for a new session and forward every
/// gathered candidate to the client.
///
/// The forwarder ends when the backend drops its sender (session released)
/// or the client connection goes away.
fn candidate_forwarder(
    role: SessionRole,
    channel: String,
    connection: ConnectionHandle,
) -> mpsc::Sender<IceCandidate> {
    let (sender, mut receiver) = mpsc::channel(CANDIDATE_CHANNEL_BUFFER);

    tokio::spawn(async move {
        while let Some(candidate) = receiver.recv().await {
            let message = match role {
                SessionRole::Publisher => ServerMessage::IceCandidateForPublisher {
                    channel: channel.clone(),
                    candidate,
                },
                SessionRole::Subscriber => ServerMessage::IceCandidateForSubscriber {
                    channel: channel.clone(),
                    candidate,
                },
            };
            connection.send(&message);
            if !connection.is_open() {
                break;
            }
        }
        debug!(
            target: "rs.negotiation",
            role = role.as_str(),
            channel = %channel,
            "Candidate forwarder finished"
        );
    });

    sender
}

/// Release a session created by a negotiation that did not complete.
async fn release_abandoned(session: &dyn MediaSession) {
    if let Err(e) = session.release().await {
        warn!(
            target: "rs.negotiation",
            session_id = %session.id(),
            error = %e,
            "Failed to release abandoned media session"
        );
    }
}
