//! A joined participant and the streams it owns.

use super::{Publication, Subscription};

use crate::actors::ConnectionHandle;
use crate::protocol::{PeopleEntry, PublisherEntry, ServerMessage};
use crate::report::ParticipantReport;

use std::collections::HashMap;

/// Participant role. Every participant is a plain participant today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Participant,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Participant => "participant",
        }
    }
}

#[derive(Debug)]
pub struct Participant {
    id: String,
    name: String,
    role: Role,
    /// Order of arrival in the room, used for stable roster ordering.
    join_seq: u64,
    connection: ConnectionHandle,
    publications: HashMap<String, Publication>,
    subscriptions: HashMap<String, Subscription>,
}

impl Participant {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        join_seq: u64,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: Role::default(),
            join_seq,
            connection,
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn join_seq(&self) -> u64 {
        self.join_seq
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Queue a message for this participant's client.
    pub fn send(&self, message: &ServerMessage) -> bool {
        self.connection.send(message)
    }

    #[must_use]
    pub fn publication(&self, channel: &str) -> Option<&Publication> {
        self.publications.get(channel)
    }

    pub fn publication_mut(&mut self, channel: &str) -> Option<&mut Publication> {
        self.publications.get_mut(channel)
    }

    pub fn insert_publication(&mut self, publication: Publication) {
        self.publications
            .insert(publication.channel().to_string(), publication);
    }

    pub fn remove_publication(&mut self, channel: &str) -> Option<Publication> {
        self.publications.remove(channel)
    }

    #[must_use]
    pub fn subscription(&self, channel: &str) -> Option<&Subscription> {
        self.subscriptions.get(channel)
    }

    pub fn subscription_mut(&mut self, channel: &str) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(channel)
    }

    pub fn insert_subscription(&mut self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.channel().to_string(), subscription);
    }

    pub fn remove_subscription(&mut self, channel: &str) -> Option<Subscription> {
        self.subscriptions.remove(channel)
    }

    /// Remove the subscription to `channel` only if it reads from `publisher_id`.
    pub fn remove_subscription_to(
        &mut self,
        publisher_id: &str,
        channel: &str,
    ) -> Option<Subscription> {
        let bound = self
            .subscriptions
            .get(channel)
            .is_some_and(|s| s.publisher_id() == publisher_id);
        if bound {
            self.subscriptions.remove(channel)
        } else {
            None
        }
    }

    /// Channels with a live publication, sorted.
    #[must_use]
    pub fn established_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .publications
            .values()
            .filter(|p| p.is_established())
            .map(|p| p.channel().to_string())
            .collect();
        channels.sort();
        channels
    }

    /// All publication channels, negotiating ones included, sorted.
    #[must_use]
    pub fn publication_channels(&self) -> Vec<String> {
        sorted_keys(&self.publications)
    }

    /// All subscription channels, sorted.
    #[must_use]
    pub fn subscription_channels(&self) -> Vec<String> {
        sorted_keys(&self.subscriptions)
    }

    /// Remove and return every publication and subscription.
    pub fn take_streams(&mut self) -> (Vec<Publication>, Vec<Subscription>) {
        (
            self.publications.drain().map(|(_, p)| p).collect(),
            self.subscriptions.drain().map(|(_, s)| s).collect(),
        )
    }

    #[must_use]
    pub fn people_entry(&self) -> PeopleEntry {
        PeopleEntry {
            name: self.name.clone(),
            online: true,
            session_id: self.id.clone(),
        }
    }

    /// Roster entry, present only while at least one publication is live.
    #[must_use]
    pub fn publisher_entry(&self) -> Option<PublisherEntry> {
        let channels = self.established_channels();
        if channels.is_empty() {
            return None;
        }
        Some(PublisherEntry {
            name: self.name.clone(),
            id: self.id.clone(),
            role: self.role.as_str().to_string(),
            channels,
        })
    }

    #[must_use]
    pub fn report(&self) -> ParticipantReport {
        ParticipantReport {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role.as_str().to_string(),
            publications: self.publication_channels(),
            subscriptions: self.subscription_channels(),
        }
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}
