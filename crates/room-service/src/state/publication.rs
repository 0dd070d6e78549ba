//! Outbound media stream of one participant on a named channel.

use super::{candidate_forwarder, release_abandoned, NegotiationState};

use crate::actors::ConnectionHandle;
use crate::negotiation::{
    IceCandidate, MediaSession, NegotiatedSession, NegotiationBackend, NegotiationError,
    SessionRole,
};

use std::sync::Arc;

#[derive(Debug)]
pub struct Publication {
    channel: String,
    state: NegotiationState,
}

impl Publication {
    /// New publication waiting for negotiation `negotiation_id` to finish.
    #[must_use]
    pub fn new(channel: impl Into<String>, negotiation_id: u64) -> Self {
        Self {
            channel: channel.into(),
            state: NegotiationState::negotiating(negotiation_id),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Id of the negotiation in flight, `None` once established.
    #[must_use]
    pub fn negotiation_id(&self) -> Option<u64> {
        self.state.negotiation_id()
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state.session().is_some()
    }

    /// Backend session, once established.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<dyn MediaSession>> {
        self.state.session()
    }

    /// Forward a remote candidate, or queue it while negotiating.
    pub fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        self.state.add_ice_candidate(candidate);
    }

    pub fn establish(&mut self, session: Arc<dyn MediaSession>) {
        self.state.establish(session);
    }

    /// Consume the publication, returning the session the caller must release.
    #[must_use]
    pub fn unpublish(self) -> Option<Arc<dyn MediaSession>> {
        self.state.into_session()
    }

    /// Run the publisher offer/answer exchange against the backend.
    ///
    /// Runs outside the room. On failure any session created here has already
    /// been released.
    pub async fn negotiate(
        backend: Arc<dyn NegotiationBackend>,
        connection: ConnectionHandle,
        channel: String,
        sdp_offer: String,
    ) -> Result<NegotiatedSession, NegotiationError> {
        let candidates = candidate_forwarder(SessionRole::Publisher, channel, connection);
        let session = backend
            .create_session(SessionRole::Publisher, candidates)
            .await?;

        match session.process_offer(&sdp_offer).await {
            Ok(sdp_answer) => Ok(NegotiatedSession {
                session,
                sdp_answer,
            }),
            Err(e) => {
                release_abandoned(session.as_ref()).await;
                Err(e)
            }
        }
    }
}
