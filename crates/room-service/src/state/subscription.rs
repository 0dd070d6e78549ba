//! Inbound view of another participant's publication.

use super::{candidate_forwarder, release_abandoned, NegotiationState};

use crate::actors::ConnectionHandle;
use crate::negotiation::{
    IceCandidate, MediaSession, NegotiatedSession, NegotiationBackend, NegotiationError,
    SessionRole,
};

use std::sync::Arc;

#[derive(Debug)]
pub struct Subscription {
    channel: String,
    /// Participant whose publication this subscription is bound to.
    publisher_id: String,
    state: NegotiationState,
}

impl Subscription {
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        publisher_id: impl Into<String>,
        negotiation_id: u64,
    ) -> Self {
        Self {
            channel: channel.into(),
            publisher_id: publisher_id.into(),
            state: NegotiationState::negotiating(negotiation_id),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    #[must_use]
    pub fn negotiation_id(&self) -> Option<u64> {
        self.state.negotiation_id()
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state.session().is_some()
    }

    pub fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        self.state.add_ice_candidate(candidate);
    }

    pub fn establish(&mut self, session: Arc<dyn MediaSession>) {
        self.state.establish(session);
    }

    /// Consume the subscription, returning the session the caller must release.
    #[must_use]
    pub fn unsubscribe(self) -> Option<Arc<dyn MediaSession>> {
        self.state.into_session()
    }

    /// Run the subscriber offer/answer exchange: create the session, wire the
    /// publisher's media into it, then answer the offer.
    ///
    /// On failure any session created here has already been released. The
    /// publisher session is never touched beyond `connect`.
    pub async fn negotiate(
        backend: Arc<dyn NegotiationBackend>,
        connection: ConnectionHandle,
        channel: String,
        source: Arc<dyn MediaSession>,
        sdp_offer: String,
    ) -> Result<NegotiatedSession, NegotiationError> {
        let candidates = candidate_forwarder(SessionRole::Subscriber, channel, connection);
        let session = backend
            .create_session(SessionRole::Subscriber, candidates)
            .await?;

        let answer = match source.connect(session.as_ref()).await {
            Ok(()) => session.process_offer(&sdp_offer).await,
            Err(e) => Err(e),
        };

        match answer {
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::negotiation::mock::MockNegotiationBackend;
    use crate::negotiation::CANDIDATE_CHANNEL_BUFFER;
    use tokio::sync::mpsc;

    async fn publisher_session(backend: &MockNegotiationBackend) -> Arc<dyn MediaSession> {
        let (tx, _rx) = mpsc::channel(CANDIDATE_CHANNEL_BUFFER);
        backend
            .create_session(SessionRole::Publisher, tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_negotiate_connects_source_to_new_session() {
        let backend = MockNegotiationBackend::accepting();
        let source = publisher_session(&backend).await;
        let (connection, _rx) = ConnectionHandle::new("c2", 8);

        let negotiated = Subscription::negotiate(
            Arc::new(backend.clone()),
            connection,
            "cam".to_string(),
            Arc::clone(&source),
            "a=recvonly".to_string(),
        )
        .await
        .unwrap();

        assert_eq!(negotiated.sdp_answer, "a=sendonly");
        assert_eq!(
            backend.calls().connections,
            vec![(source.id().to_string(), negotiated.session.id().to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_publisher_alone() {
        let backend = MockNegotiationBackend::accepting().rejecting_offers_containing("bad");
        let source = publisher_session(&backend).await;
        let (connection, _rx) = ConnectionHandle::new("c2", 8);

        let result = Subscription::negotiate(
            Arc::new(backend.clone()),
            connection,
            "cam".to_string(),
            Arc::clone(&source),
            "bad offer".to_string(),
        )
        .await;

        assert!(result.is_err());
        let released = backend.calls().released;
        assert_eq!(released.len(), 1);
        assert_ne!(released.first().map(String::as_str), Some(source.id()));
    }

    #[tokio::test]
    async fn test_connect_failure_releases_subscriber_session() {
        let backend = MockNegotiationBackend::accepting();
        let source = publisher_session(&backend).await;
        source.release().await.unwrap();
        let (connection, _rx) = ConnectionHandle::new("c2", 8);

        let result = Subscription::negotiate(
            Arc::new(backend.clone()),
            connection,
            "cam".to_string(),
            source,
            "offer".to_string(),
        )
        .await;

        assert!(matches!(result, Err(NegotiationError::Connect(_))));
        assert_eq!(backend.released_count(), 2);
    }

    #[test]
    fn test_new_subscription_is_negotiating() {
        let subscription = Subscription::new("cam", "p1", 3);
        assert_eq!(subscription.publisher_id(), "p1");
        assert_eq!(subscription.negotiation_id(), Some(3));
        assert!(!subscription.is_established());
        assert!(subscription.unsubscribe().is_none());
    }
}
