//! In-process negotiation backend.
//!
//! Used by tests and by the standalone binary when no media relay is wired
//! in. Offers are answered locally by mirroring the SDP direction
//! attributes, and every backend call is recorded so tests can assert on
//! creations, releases, connections and ICE candidates.
//!
//! # Example
//!
//! ```rust,ignore
//! use room_service::negotiation::mock::MockNegotiationBackend;
//!
//! let backend = MockNegotiationBackend::accepting()
//!     .rejecting_offers_containing("broken");
//! let (backend, gate) = backend.gated();
//! // ... publish, then let negotiations finish:
//! gate.open();
//! ```

use super::{IceCandidate, MediaSession, NegotiationBackend, NegotiationError, SessionRole};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

/// Record of every call made against the mock backend.
#[derive(Debug, Default, Clone)]
pub struct MockCallLog {
    /// Created sessions in creation order.
    pub created: Vec<(String, SessionRole)>,
    /// Released session ids in release order.
    pub released: Vec<String>,
    /// `(source, sink)` session connections.
    pub connections: Vec<(String, String)>,
    /// `(session, offer)` pairs processed.
    pub offers: Vec<(String, String)>,
    /// `(session, candidate)` remote candidates applied.
    pub candidates: Vec<(String, IceCandidate)>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: AtomicU64,
    log: Mutex<MockCallLog>,
}

impl MockState {
    fn log(&self) -> MutexGuard<'_, MockCallLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Default)]
struct MockConfig {
    unavailable: bool,
    reject_all_offers: bool,
    reject_marker: Option<String>,
    local_candidates: Vec<IceCandidate>,
    gate: Option<watch::Receiver<bool>>,
}

/// Mock negotiation backend.
///
/// Clones share the same call log.
#[derive(Debug, Clone, Default)]
pub struct MockNegotiationBackend {
    config: MockConfig,
    state: Arc<MockState>,
}

/// Holds offer processing until opened.
#[derive(Debug)]
pub struct OfferGate {
    sender: watch::Sender<bool>,
}

impl OfferGate {
    /// Let every pending and future offer complete.
    pub fn open(&self) {
        let _ = self.sender.send(true);
    }
}

impl MockNegotiationBackend {
    /// Create a mock that answers every offer.
    #[must_use]
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Create a mock that rejects every offer.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            config: MockConfig {
                reject_all_offers: true,
                ..MockConfig::default()
            },
            ..Self::default()
        }
    }

    /// Create a mock that cannot create sessions at all.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            config: MockConfig {
                unavailable: true,
                ..MockConfig::default()
            },
            ..Self::default()
        }
    }

    /// Reject offers whose SDP contains `marker`.
    #[must_use]
    pub fn rejecting_offers_containing(mut self, marker: impl Into<String>) -> Self {
        self.config.reject_marker = Some(marker.into());
        self
    }

    /// Emit these local candidates when gathering starts.
    #[must_use]
    pub fn with_local_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.config.local_candidates = candidates;
        self
    }

    /// Hold offer processing until the returned gate is opened.
    #[must_use]
    pub fn gated(mut self) -> (Self, OfferGate) {
        let (sender, receiver) = watch::channel(false);
        self.config.gate = Some(receiver);
        (self, OfferGate { sender })
    }

    /// Snapshot of all recorded calls.
    #[must_use]
    pub fn calls(&self) -> MockCallLog {
        self.state.log().clone()
    }

    /// Number of sessions created so far.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.state.log().created.len()
    }

    /// Number of sessions released so far.
    #[must_use]
    pub fn released_count(&self) -> usize {
        self.state.log().released.len()
    }

    /// Number of sessions created but not yet released.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        let log = self.state.log();
        log.created.len().saturating_sub(log.released.len())
    }
}

#[async_trait::async_trait]
impl NegotiationBackend for MockNegotiationBackend {
    async fn create_session(
        &self,
        role: SessionRole,
        candidates: mpsc::Sender<IceCandidate>,
    ) -> Result<Arc<dyn MediaSession>, NegotiationError> {
        if self.config.unavailable {
            return Err(NegotiationError::Unavailable);
        }

        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{n}", role.as_str());
        self.state.log().created.push((id.clone(), role));

        Ok(Arc::new(MockSession {
            id,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            candidates: Mutex::new(Some(candidates)),
            released: AtomicBool::new(false),
        }))
    }
}

/// Session created by [`MockNegotiationBackend`].
#[derive(Debug)]
pub struct MockSession {
    id: String,
    config: MockConfig,
    state: Arc<MockState>,
    candidates: Mutex<Option<mpsc::Sender<IceCandidate>>>,
    released: AtomicBool,
}

#[async_trait::async_trait]
impl MediaSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self, sink: &dyn MediaSession) -> Result<(), NegotiationError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(NegotiationError::Connect("source released".to_string()));
        }
        self.state
            .log()
            .connections
            .push((self.id.clone(), sink.id().to_string()));
        Ok(())
    }

    async fn process_offer(&self, sdp_offer: &str) -> Result<String, NegotiationError> {
        self.state
            .log()
            .offers
            .push((self.id.clone(), sdp_offer.to_string()));

        if let Some(gate) = &self.config.gate {
            let mut gate = gate.clone();
            gate.wait_for(|open| *open)
                .await
                .map_err(|_| NegotiationError::Unavailable)?;
        }

        if self.config.reject_all_offers {
            return Err(NegotiationError::OfferRejected(
                "offer refused by backend".to_string(),
            ));
        }
        if let Some(marker) = &self.config.reject_marker {
            if sdp_offer.contains(marker.as_str()) {
                return Err(NegotiationError::OfferRejected(format!(
                    "offer contains {marker}"
                )));
            }
        }

        Ok(loopback_answer(sdp_offer))
    }

    async fn gather_candidates(&self) -> Result<(), NegotiationError> {
        let sender = self
            .candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sender) = sender {
            for candidate in &self.config.local_candidates {
                let _ = sender.try_send(candidate.clone());
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(NegotiationError::IceCandidate(
                "session released".to_string(),
            ));
        }
        self.state
            .log()
            .candidates
            .push((self.id.clone(), candidate));
        Ok(())
    }

    async fn release(&self) -> Result<(), NegotiationError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(NegotiationError::Release("already released".to_string()));
        }
        // Dropping the sender ends the candidate forwarder.
        self.candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.state.log().released.push(self.id.clone());
        Ok(())
    }
}

/// Answer an offer by mirroring its direction attributes.
#[must_use]
pub fn loopback_answer(sdp_offer: &str) -> String {
    sdp_offer
        .lines()
        .map(|line| match line.trim_end() {
            "a=sendonly" => "a=recvonly",
            "a=recvonly" => "a=sendonly",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}
