//! `RoomActor` - one actor per room.
//!
//! The actor owns the room's connections and participants, and through them
//! every publication and subscription. All mutation happens inside
//! `handle_message`, one message at a time.
//!
//! # Negotiation
//!
//! `publish` and `subscribe` insert the entry in a negotiating state tagged
//! with a fresh negotiation id, then drive the backend from a spawned task.
//! The task reports back through the mailbox. The completion handler only
//! applies the result if the same participant still holds the same entry
//! with the same negotiation id; anything else is stale and the new backend
//! session is released.
//!
//! # Releases
//!
//! Backend sessions are released from a spawned task, sequentially, with
//! dependent subscriptions always ahead of the publication they read from.

use super::connection::ConnectionHandle;
use super::messages::{DisconnectReason, RoomMessage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use crate::errors::RoomError;
use crate::negotiation::{
    spawn_gather_candidates, spawn_release, NegotiatedSession, NegotiationBackend,
    NegotiationError,
};
use crate::observability::metrics as prom;
use crate::protocol::{
    self, ClientMessage, PeopleEntry, PeopleRef, PublisherEntry, ServerMessage,
};
use crate::report::RoomReport;
use crate::state::{Participant, Publication, Subscription};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
///
/// Every method fails with [`RoomError::RoomClosed`] once the actor is gone.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    room_id: String,
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Hand a new connection to the room. The room greets it; the participant
    /// is created later by the client's `join` message.
    pub async fn join(
        &self,
        participant_id: String,
        connection: ConnectionHandle,
    ) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                participant_id,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| RoomError::RoomClosed)?;

        rx.await.map_err(|_| RoomError::RoomClosed)?
    }

    /// Deliver one inbound text frame.
    pub async fn inbound(&self, participant_id: String, text: String) -> Result<(), RoomError> {
        self.sender
            .send(RoomMessage::Inbound {
                participant_id,
                text,
            })
            .await
            .map_err(|_| RoomError::RoomClosed)
    }

    /// Report that a connection closed or failed.
    pub async fn disconnected(
        &self,
        participant_id: String,
        reason: DisconnectReason,
    ) -> Result<(), RoomError> {
        self.sender
            .send(RoomMessage::Disconnected {
                participant_id,
                reason,
            })
            .await
            .map_err(|_| RoomError::RoomClosed)
    }

    pub async fn report(&self) -> Result<RoomReport, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetReport { respond_to: tx })
            .await
            .map_err(|_| RoomError::RoomClosed)?;

        rx.await.map_err(|_| RoomError::RoomClosed)
    }

    /// Participant id of the established publisher of `channel`.
    pub async fn find_publisher(&self, channel: String) -> Result<Option<String>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::FindPublisher {
                channel,
                respond_to: tx,
            })
            .await
            .map_err(|_| RoomError::RoomClosed)?;

        rx.await.map_err(|_| RoomError::RoomClosed)
    }

    /// Shut the room down if idle for at least `idle_timeout`.
    pub async fn expire_if_idle(&self, idle_timeout: Duration) -> Result<bool, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ExpireIfIdle {
                idle_timeout,
                respond_to: tx,
            })
            .await
            .map_err(|_| RoomError::RoomClosed)?;

        rx.await.map_err(|_| RoomError::RoomClosed)
    }

    /// Detach every participant and stop the actor.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|_| RoomError::RoomClosed)?;

        rx.await.map_err(|_| RoomError::RoomClosed)
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the actor has stopped reading its mailbox.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether both handles address the same actor.
    #[must_use]
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }

    /// Handle whose mailbox nobody reads until the receiver is dropped.
    #[cfg(test)]
    pub(crate) fn unattended(
        room_id: &str,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::Receiver<RoomMessage>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let handle = Self {
            room_id: room_id.to_string(),
            sender,
            cancel_token,
        };
        (handle, receiver)
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Used by negotiation tasks to report back without keeping the room alive.
    mailbox_sender: mpsc::WeakSender<RoomMessage>,
    cancel_token: CancellationToken,
    backend: Arc<dyn NegotiationBackend>,
    /// Every connection in the room, joined or not.
    connections: HashMap<String, ConnectionHandle>,
    /// Joined participants by id.
    participants: HashMap<String, Participant>,
    next_join_seq: u64,
    next_negotiation_id: u64,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    is_shutting_down: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        cancel_token: CancellationToken,
        backend: Arc<dyn NegotiationBackend>,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            mailbox_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            backend,
            connections: HashMap::new(),
            participants: HashMap::new(),
            next_join_seq: 0,
            next_negotiation_id: 0,
            last_activity: Instant::now(),
            last_activity_at: Utc::now(),
            is_shutting_down: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomHandle {
            room_id,
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rs.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rs.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if self.is_shutting_down {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "rs.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.shutdown();
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                participant_id,
                connection,
                respond_to,
            } => {
                let result = self.handle_connect(participant_id, connection);
                let _ = respond_to.send(result);
            }

            RoomMessage::Inbound {
                participant_id,
                text,
            } => {
                self.handle_inbound(&participant_id, &text);
            }

            RoomMessage::Disconnected {
                participant_id,
                reason,
            } => {
                self.handle_disconnect(&participant_id, &reason);
            }

            RoomMessage::PublishNegotiated {
                participant_id,
                channel,
                negotiation_id,
                result,
            } => {
                self.complete_publish(&participant_id, channel, negotiation_id, result);
            }

            RoomMessage::SubscribeNegotiated {
                participant_id,
                channel,
                negotiation_id,
                result,
            } => {
                self.complete_subscribe(&participant_id, channel, negotiation_id, result);
            }

            RoomMessage::GetReport { respond_to } => {
                let _ = respond_to.send(self.report());
            }

            RoomMessage::FindPublisher {
                channel,
                respond_to,
            } => {
                let publisher = self.find_publisher(&channel).map(str::to_string);
                let _ = respond_to.send(publisher);
            }

            RoomMessage::ExpireIfIdle {
                idle_timeout,
                respond_to,
            } => {
                let expired = self.expire_if_idle(idle_timeout);
                let _ = respond_to.send(expired);
            }

            RoomMessage::Shutdown { respond_to } => {
                self.shutdown();
                let _ = respond_to.send(());
            }
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    /// A transport connection arrived. Greets it; no participant yet.
    fn handle_connect(
        &mut self,
        participant_id: String,
        connection: ConnectionHandle,
    ) -> Result<(), RoomError> {
        if self.is_shutting_down {
            return Err(RoomError::RoomClosed);
        }
        if self.connections.contains_key(&participant_id) {
            return Err(RoomError::AlreadyJoined(participant_id));
        }

        self.touch();
        connection.send_text(protocol::greeting(&self.room_id, &participant_id));

        debug!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            connection_id = %connection.connection_id(),
            "Connection attached"
        );

        self.connections.insert(participant_id, connection);
        Ok(())
    }

    fn handle_inbound(&mut self, participant_id: &str, text: &str) {
        if !self.connections.contains_key(participant_id) {
            warn!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Message from unknown connection ignored"
            );
            return;
        }
        self.touch();

        let message = match protocol::parse_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                prom::record_message("invalid");
                debug!(
                    target: "rs.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    error = ?e,
                    "Unrecognized message"
                );
                self.reply(
                    participant_id,
                    &ServerMessage::error(&RoomError::WrongMessage, None),
                );
                return;
            }
        };

        prom::record_message(message.kind());
        let channel = message.channel().map(str::to_string);

        let result = match message {
            ClientMessage::Join { name } => self.handle_join(participant_id, name),
            ClientMessage::Publish { channel, sdp_offer } => {
                self.handle_publish(participant_id, channel, sdp_offer)
            }
            ClientMessage::OnIceCandidateFromPublisher { channel, candidate } => {
                if let Some(publication) = self
                    .participants
                    .get_mut(participant_id)
                    .and_then(|p| p.publication_mut(&channel))
                {
                    publication.add_ice_candidate(candidate);
                }
                Ok(())
            }
            ClientMessage::Unpublish { channel } => self.handle_unpublish(participant_id, &channel),
            ClientMessage::Subscribe { channel, sdp_offer } => {
                self.handle_subscribe(participant_id, channel, sdp_offer)
            }
            ClientMessage::OnIceCandidateFromSubscriber { channel, candidate } => {
                if let Some(subscription) = self
                    .participants
                    .get_mut(participant_id)
                    .and_then(|p| p.subscription_mut(&channel))
                {
                    subscription.add_ice_candidate(candidate);
                }
                Ok(())
            }
            ClientMessage::Unsubscribe { channel } => {
                self.handle_unsubscribe(participant_id, &channel);
                Ok(())
            }
            ClientMessage::StartedSpeaking | ClientMessage::StoppedSpeaking => {
                self.relay(participant_id, text)
            }
            ClientMessage::Ping => {
                self.reply(participant_id, &ServerMessage::Pong);
                Ok(())
            }
            ClientMessage::Pong => {
                self.reply(participant_id, &ServerMessage::Ping);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                error = %e,
                error_kind = e.kind(),
                "Protocol error"
            );
            self.reply(participant_id, &ServerMessage::error(&e, channel.as_deref()));
        }
    }

    fn handle_join(&mut self, participant_id: &str, name: String) -> Result<(), RoomError> {
        if self.participants.contains_key(participant_id) {
            return Err(RoomError::AlreadyJoined(participant_id.to_string()));
        }
        let connection = self
            .connections
            .get(participant_id)
            .cloned()
            .ok_or_else(|| RoomError::ParticipantNotFound(participant_id.to_string()))?;

        let peoples = self.people_roster();
        let join_seq = self.next_join_seq;
        self.next_join_seq += 1;

        let participant = Participant::new(participant_id, name.clone(), join_seq, connection);
        participant.send(&ServerMessage::Welcome {
            participant_id: participant_id.to_string(),
        });
        participant.send(&ServerMessage::Peoples { data: peoples });
        self.participants
            .insert(participant_id.to_string(), participant);
        self.metrics.participant_joined();

        info!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            participants = self.participants.len(),
            "Participant joined"
        );

        self.broadcast(
            &ServerMessage::NewPeople {
                data: PeopleRef {
                    session_id: participant_id.to_string(),
                    name: Some(name),
                },
            },
            Some(participant_id),
        );
        self.broadcast_roster();
        Ok(())
    }

    fn handle_publish(
        &mut self,
        participant_id: &str,
        channel: String,
        sdp_offer: String,
    ) -> Result<(), RoomError> {
        if !self.participants.contains_key(participant_id) {
            return Err(RoomError::ParticipantNotFound(participant_id.to_string()));
        }
        if self.channel_owner(&channel).is_some() {
            return Err(RoomError::ChannelInUse(channel));
        }

        let negotiation_id = self.next_negotiation_id();
        let participant = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| RoomError::ParticipantNotFound(participant_id.to_string()))?;
        participant.insert_publication(Publication::new(channel.clone(), negotiation_id));
        let connection = participant.connection().clone();

        debug!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            channel = %channel,
            negotiation_id,
            "Publish negotiation started"
        );

        let negotiation = Publication::negotiate(
            Arc::clone(&self.backend),
            connection,
            channel.clone(),
            sdp_offer,
        );
        let participant_id = participant_id.to_string();
        self.spawn_negotiation("publish", negotiation, move |result| {
            RoomMessage::PublishNegotiated {
                participant_id,
                channel,
                negotiation_id,
                result,
            }
        });
        Ok(())
    }

    fn complete_publish(
        &mut self,
        participant_id: &str,
        channel: String,
        negotiation_id: u64,
        result: Result<NegotiatedSession, NegotiationError>,
    ) {
        let current = self
            .participants
            .get(participant_id)
            .and_then(|p| p.publication(&channel))
            .and_then(Publication::negotiation_id);
        if current != Some(negotiation_id) {
            debug!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                channel = %channel,
                negotiation_id,
                "Discarding stale publish negotiation"
            );
            if let Ok(negotiated) = result {
                spawn_release(&self.room_id, vec![negotiated.session]);
            }
            return;
        }

        let Some(participant) = self.participants.get_mut(participant_id) else {
            return;
        };

        match result {
            Ok(NegotiatedSession {
                session,
                sdp_answer,
            }) => {
                if let Some(publication) = participant.publication_mut(&channel) {
                    publication.establish(Arc::clone(&session));
                }
                participant.send(&ServerMessage::StartResponseForPublisher {
                    channel: channel.clone(),
                    sdp_answer,
                });
                spawn_gather_candidates(session);

                info!(
                    target: "rs.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    channel = %channel,
                    "Channel published"
                );

                self.broadcast(&ServerMessage::StartPublishing { channel }, None);
                self.broadcast_roster();
            }
            Err(e) => {
                participant.remove_publication(&channel);
                participant.send(&ServerMessage::error(
                    &RoomError::Negotiation(e.clone()),
                    Some(&channel),
                ));
                prom::record_negotiation_failure("publish");

                warn!(
                    target: "rs.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    channel = %channel,
                    error = %e,
                    "Publish negotiation failed"
                );
            }
        }
    }

    fn handle_unpublish(&mut self, participant_id: &str, channel: &str) -> Result<(), RoomError> {
        if !self.participants.contains_key(participant_id) {
            return Err(RoomError::ParticipantNotFound(participant_id.to_string()));
        }
        let publisher_id = self
            .channel_owner(channel)
            .map(str::to_string)
            .ok_or_else(|| RoomError::WrongChannel(channel.to_string()))?;

        if self.remove_publication(&publisher_id, channel) {
            self.broadcast(
                &ServerMessage::StopPublishing {
                    channel: channel.to_string(),
                },
                None,
            );
        }
        self.broadcast_roster();
        Ok(())
    }

    fn handle_subscribe(
        &mut self,
        participant_id: &str,
        channel: String,
        sdp_offer: String,
    ) -> Result<(), RoomError> {
        if !self.participants.contains_key(participant_id) {
            return Err(RoomError::ParticipantNotFound(participant_id.to_string()));
        }

        let (publisher_id, source) = self
            .participants
            .values()
            .find_map(|p| {
                p.publication(&channel)
                    .and_then(Publication::session)
                    .map(|session| (p.id().to_string(), Arc::clone(session)))
            })
            .ok_or_else(|| RoomError::WrongChannel(channel.clone()))?;

        let negotiation_id = self.next_negotiation_id();
        let participant = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| RoomError::ParticipantNotFound(participant_id.to_string()))?;

        if let Some(previous) = participant.remove_subscription(&channel) {
            debug!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                channel = %channel,
                "Replacing existing subscription"
            );
            spawn_release(&self.room_id, previous.unsubscribe().into_iter().collect());
        }

        participant.insert_subscription(Subscription::new(
            channel.clone(),
            publisher_id,
            negotiation_id,
        ));
        let connection = participant.connection().clone();

        let negotiation = Subscription::negotiate(
            Arc::clone(&self.backend),
            connection,
            channel.clone(),
            source,
            sdp_offer,
        );
        let participant_id = participant_id.to_string();
        self.spawn_negotiation("subscribe", negotiation, move |result| {
            RoomMessage::SubscribeNegotiated {
                participant_id,
                channel,
                negotiation_id,
                result,
            }
        });
        Ok(())
    }

    fn complete_subscribe(
        &mut self,
        participant_id: &str,
        channel: String,
        negotiation_id: u64,
        result: Result<NegotiatedSession, NegotiationError>,
    ) {
        let current = self
            .participants
            .get(participant_id)
            .and_then(|p| p.subscription(&channel))
            .and_then(Subscription::negotiation_id);
        if current != Some(negotiation_id) {
            debug!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                channel = %channel,
                negotiation_id,
                "Discarding stale subscribe negotiation"
            );
            if let Ok(negotiated) = result {
                spawn_release(&self.room_id, vec![negotiated.session]);
            }
            return;
        }

        let Some(participant) = self.participants.get_mut(participant_id) else {
            return;
        };

        match result {
            Ok(NegotiatedSession {
                session,
                sdp_answer,
            }) => {
                if let Some(subscription) = participant.subscription_mut(&channel) {
                    subscription.establish(Arc::clone(&session));
                }
                participant.send(&ServerMessage::StartResponseForSubscriber {
                    channel: channel.clone(),
                    sdp_answer,
                });
                spawn_gather_candidates(session);

                info!(
                    target: "rs.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    channel = %channel,
                    "Subscribed"
                );
            }
            Err(e) => {
                participant.remove_subscription(&channel);
                participant.send(&ServerMessage::error(
                    &RoomError::Negotiation(e.clone()),
                    Some(&channel),
                ));
                prom::record_negotiation_failure("subscribe");

                warn!(
                    target: "rs.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    channel = %channel,
                    error = %e,
                    "Subscribe negotiation failed"
                );
            }
        }
    }

    fn handle_unsubscribe(&mut self, participant_id: &str, channel: &str) {
        let removed = self
            .participants
            .get_mut(participant_id)
            .and_then(|p| p.remove_subscription(channel));

        if let Some(subscription) = removed {
            debug!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                channel = %channel,
                "Unsubscribed"
            );
            spawn_release(
                &self.room_id,
                subscription.unsubscribe().into_iter().collect(),
            );
        }
    }

    /// Relay a speaking notification verbatim to every participant.
    fn relay(&self, participant_id: &str, text: &str) -> Result<(), RoomError> {
        if !self.participants.contains_key(participant_id) {
            return Err(RoomError::ParticipantNotFound(participant_id.to_string()));
        }
        for participant in self.participants.values() {
            participant.connection().send_text(text);
        }
        Ok(())
    }

    fn handle_disconnect(&mut self, participant_id: &str, reason: &DisconnectReason) {
        if self.connections.remove(participant_id).is_none() {
            debug!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Disconnect for unknown connection ignored"
            );
            return;
        }
        self.touch();

        if !self.participants.contains_key(participant_id) {
            debug!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Connection closed before joining"
            );
            return;
        }

        info!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            reason = %reason.as_str(),
            "Participant left"
        );

        self.broadcast(
            &ServerMessage::ExitPeople {
                data: PeopleRef {
                    session_id: participant_id.to_string(),
                    name: None,
                },
            },
            Some(participant_id),
        );
        self.detach(participant_id);
        self.broadcast_roster();
    }

    /// Remove a participant and release everything it owns.
    ///
    /// Subscriptions of other participants to its publications are cascaded
    /// first. If the client is still reachable it gets a farewell and is
    /// closed.
    fn detach(&mut self, participant_id: &str) {
        let Some(mut participant) = self.participants.remove(participant_id) else {
            warn!(
                target: "rs.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Detach for absent participant"
            );
            return;
        };
        self.metrics.participant_left();

        let (publications, subscriptions) = participant.take_streams();
        let mut sessions = Vec::new();
        let mut stopped = Vec::new();

        for publication in publications {
            let channel = publication.channel().to_string();
            for other in self.participants.values_mut() {
                if let Some(dependent) = other.remove_subscription_to(participant_id, &channel) {
                    sessions.extend(dependent.unsubscribe());
                }
            }
            if publication.is_established() {
                stopped.push(channel);
            }
            sessions.extend(publication.unpublish());
        }
        for subscription in subscriptions {
            sessions.extend(subscription.unsubscribe());
        }

        debug!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            sessions = sessions.len(),
            "Participant detached"
        );
        spawn_release(&self.room_id, sessions);

        let connection = participant.connection();
        if connection.is_open() {
            connection.send_text(protocol::FAREWELL);
            connection.close("detached from room");
        }

        if !self.is_shutting_down {
            stopped.sort();
            for channel in stopped {
                self.broadcast(&ServerMessage::StopPublishing { channel }, None);
            }
        }
    }

    /// Remove a publication and every subscription bound to it.
    ///
    /// Returns whether the publication was established.
    fn remove_publication(&mut self, publisher_id: &str, channel: &str) -> bool {
        let mut sessions = Vec::new();
        let mut cascaded = 0usize;

        for participant in self.participants.values_mut() {
            if let Some(subscription) = participant.remove_subscription_to(publisher_id, channel) {
                cascaded += 1;
                sessions.extend(subscription.unsubscribe());
            }
        }

        let Some(publication) = self
            .participants
            .get_mut(publisher_id)
            .and_then(|p| p.remove_publication(channel))
        else {
            spawn_release(&self.room_id, sessions);
            return false;
        };

        let was_established = publication.is_established();
        sessions.extend(publication.unpublish());

        info!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            participant_id = %publisher_id,
            channel = %channel,
            subscriptions = cascaded,
            "Channel unpublished"
        );
        spawn_release(&self.room_id, sessions);
        was_established
    }

    fn expire_if_idle(&mut self, idle_timeout: Duration) -> bool {
        let idle_for = self.last_activity.elapsed();
        if idle_for < idle_timeout {
            return false;
        }

        info!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            idle_secs = idle_for.as_secs(),
            participants = self.participants.len(),
            "Room idle, shutting down"
        );
        self.shutdown();
        true
    }

    /// Detach every participant and close every connection.
    fn shutdown(&mut self) {
        if self.is_shutting_down {
            return;
        }
        self.is_shutting_down = true;

        info!(
            target: "rs.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            connections = self.connections.len(),
            "Shutting down room"
        );

        let ids: Vec<String> = self
            .participants_in_join_order()
            .into_iter()
            .map(|p| p.id().to_string())
            .collect();
        for id in ids {
            self.connections.remove(&id);
            self.detach(&id);
        }

        // Connections that never joined.
        for (_, connection) in self.connections.drain() {
            connection.close("room closed");
        }

        self.cancel_token.cancel();
    }

    fn report(&self) -> RoomReport {
        let participants = self
            .participants_in_join_order()
            .into_iter()
            .map(Participant::report)
            .collect();
        RoomReport::new(
            self.room_id.as_str(),
            participants,
            self.last_activity_at,
            Utc::now(),
        )
    }

    /// Established publisher of `channel`.
    fn find_publisher(&self, channel: &str) -> Option<&str> {
        self.participants
            .values()
            .find(|p| p.publication(channel).is_some_and(Publication::is_established))
            .map(Participant::id)
    }

    /// Participant holding `channel` in any negotiation state.
    fn channel_owner(&self, channel: &str) -> Option<&str> {
        self.participants
            .values()
            .find(|p| p.publication(channel).is_some())
            .map(Participant::id)
    }

    fn next_negotiation_id(&mut self) -> u64 {
        self.next_negotiation_id += 1;
        self.next_negotiation_id
    }

    fn participants_in_join_order(&self) -> Vec<&Participant> {
        let mut participants: Vec<&Participant> = self.participants.values().collect();
        participants.sort_by_key(|p| p.join_seq());
        participants
    }

    fn people_roster(&self) -> Vec<PeopleEntry> {
        self.participants_in_join_order()
            .into_iter()
            .map(Participant::people_entry)
            .collect()
    }

    fn publications_roster(&self) -> Vec<PublisherEntry> {
        self.participants_in_join_order()
            .into_iter()
            .filter_map(Participant::publisher_entry)
            .collect()
    }

    fn reply(&self, participant_id: &str, message: &ServerMessage) {
        match self.connections.get(participant_id) {
            Some(connection) => {
                connection.send(message);
            }
            None => {
                warn!(
                    target: "rs.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    "Reply to absent connection skipped"
                );
            }
        }
    }

    fn broadcast(&self, message: &ServerMessage, except: Option<&str>) {
        for participant in self.participants.values() {
            if Some(participant.id()) != except {
                participant.send(message);
            }
        }
    }

    fn broadcast_roster(&self) {
        let roster = ServerMessage::Publications {
            data: self.publications_roster(),
        };
        self.broadcast(&roster, None);
    }

    /// Drive a negotiation off the actor and report the outcome through the
    /// mailbox. If the room is gone by then, the new session is released.
    fn spawn_negotiation<F, M>(&self, kind: &'static str, negotiation: F, into_message: M)
    where
        F: Future<Output = Result<NegotiatedSession, NegotiationError>> + Send + 'static,
        M: FnOnce(Result<NegotiatedSession, NegotiationError>) -> RoomMessage + Send + 'static,
    {
        let mailbox = self.mailbox_sender.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = negotiation.await;
            prom::record_negotiation_duration(kind, started.elapsed());

            let message = into_message(result);
            let undelivered = match mailbox.upgrade() {
                Some(sender) => sender.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };
            if let Some(message) = undelivered {
                release_undelivered(message).await;
            }
        });
    }
}

/// Release the session carried by a completion the room never received.
async fn release_undelivered(message: RoomMessage) {
    if let RoomMessage::PublishNegotiated {
        result: Ok(negotiated),
        ..
    }
    | RoomMessage::SubscribeNegotiated {
        result: Ok(negotiated),
        ..
    } = message
    {
        if let Err(e) = negotiated.session.release().await {
            warn!(
                target: "rs.negotiation",
                session_id = %negotiated.session.id(),
                error = %e,
                "Failed to release session for closed room"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::ConnectionMessage;
    use crate::negotiation::mock::MockNegotiationBackend;
    use serde_json::{json, Value};

    fn spawn_room(backend: MockNegotiationBackend) -> (RoomHandle, JoinHandle<()>) {
        RoomActor::spawn(
            "chatroom".to_string(),
            CancellationToken::new(),
            Arc::new(backend),
            ActorMetrics::new(),
        )
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ConnectionMessage>) -> ConnectionMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection queue closed")
    }

    async fn next_json(rx: &mut mpsc::Receiver<ConnectionMessage>) -> Value {
        match next_frame(rx).await {
            ConnectionMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            ConnectionMessage::Close { reason } => Value::String(format!("closed: {reason}")),
        }
    }

    #[tokio::test]
    async fn test_connect_sends_greeting() {
        let (room, _task) = spawn_room(MockNegotiationBackend::accepting());
        let (connection, mut rx) = ConnectionHandle::new("c1", 16);

        room.join("p1".to_string(), connection).await.unwrap();

        assert_eq!(
            next_json(&mut rx).await,
            json!("Hello, new participant in room 'chatroom'. Your id is 'p1'")
        );
        room.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_connection_id_rejected() {
        let (room, _task) = spawn_room(MockNegotiationBackend::accepting());
        let (first, _rx1) = ConnectionHandle::new("c1", 16);
        let (second, _rx2) = ConnectionHandle::new("c2", 16);

        room.join("p1".to_string(), first).await.unwrap();
        let result = room.join("p1".to_string(), second).await;

        assert!(matches!(result, Err(RoomError::AlreadyJoined(_))));
        room.cancel();
    }

    #[tokio::test]
    async fn test_ping_before_join_gets_pong() {
        let (room, _task) = spawn_room(MockNegotiationBackend::accepting());
        let (connection, mut rx) = ConnectionHandle::new("c1", 16);
        room.join("p1".to_string(), connection).await.unwrap();
        let _greeting = next_frame(&mut rx).await;

        room.inbound("p1".to_string(), r#"{"id":"ping"}"#.to_string())
            .await
            .unwrap();

        assert_eq!(next_json(&mut rx).await, json!({"id": "pong"}));
        room.cancel();
    }

    #[tokio::test]
    async fn test_publish_before_join_is_rejected() {
        let backend = MockNegotiationBackend::accepting();
        let (room, _task) = spawn_room(backend.clone());
        let (connection, mut rx) = ConnectionHandle::new("c1", 16);
        room.join("p1".to_string(), connection).await.unwrap();
        let _greeting = next_frame(&mut rx).await;

        room.inbound(
            "p1".to_string(),
            r#"{"id":"publish","channel":"cam","sdpOffer":"o"}"#.to_string(),
        )
        .await
        .unwrap();

        assert_eq!(
            next_json(&mut rx).await,
            json!({"id": "error", "data": "Participant not found", "channel": "cam"})
        );
        assert_eq!(backend.created_count(), 0);
        room.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_says_bye_and_stops() {
        let (room, task) = spawn_room(MockNegotiationBackend::accepting());
        let (connection, mut rx) = ConnectionHandle::new("c1", 16);
        room.join("p1".to_string(), connection).await.unwrap();
        room.inbound("p1".to_string(), r#"{"id":"join","name":"Alice"}"#.to_string())
            .await
            .unwrap();

        room.shutdown().await.unwrap();
        task.await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert!(frames.contains(&ConnectionMessage::Text("bye".to_string())));
        assert!(matches!(
            frames.last(),
            Some(ConnectionMessage::Close { .. })
        ));
        assert!(room.is_cancelled());
        assert!(matches!(room.report().await, Err(RoomError::RoomClosed)));
    }

    #[tokio::test]
    async fn test_report_is_read_only_snapshot() {
        let (room, _task) = spawn_room(MockNegotiationBackend::accepting());
        let (connection, _rx) = ConnectionHandle::new("c1", 16);
        room.join("p1".to_string(), connection).await.unwrap();
        room.inbound("p1".to_string(), r#"{"id":"join","name":"Alice"}"#.to_string())
            .await
            .unwrap();

        let first = room.report().await.unwrap();
        let second = room.report().await.unwrap();

        assert_eq!(first.id, "chatroom");
        assert_eq!(first.participants.len(), 1);
        assert_eq!(first.participants, second.participants);
        assert_eq!(first.from_now, "a few seconds ago");
        room.cancel();
    }
}
