//! Client/server signaling protocol.
//!
//! Every frame is a JSON object tagged by `id`; field names are camelCase.
//! Inbound frames are parsed into [`ClientMessage`], outbound frames are
//! built from [`ServerMessage`].

use crate::errors::RoomError;
use crate::negotiation::IceCandidate;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound protocol message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    Join {
        #[serde(default)]
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    Publish { channel: String, sdp_offer: String },
    OnIceCandidateFromPublisher {
        channel: String,
        candidate: IceCandidate,
    },
    Unpublish { channel: String },
    #[serde(rename_all = "camelCase")]
    Subscribe { channel: String, sdp_offer: String },
    OnIceCandidateFromSubscriber {
        channel: String,
        candidate: IceCandidate,
    },
    Unsubscribe { channel: String },
    StartedSpeaking,
    StoppedSpeaking,
    Ping,
    Pong,
}

/// Every `id` accepted by [`ClientMessage`].
const CLIENT_MESSAGE_IDS: [&str; 11] = [
    "join",
    "publish",
    "onIceCandidateFromPublisher",
    "unpublish",
    "subscribe",
    "onIceCandidateFromSubscriber",
    "unsubscribe",
    "startedSpeaking",
    "stoppedSpeaking",
    "ping",
    "pong",
];

impl ClientMessage {
    /// Bounded label for logs and the `rs_messages_total` metric.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Publish { .. } => "publish",
            ClientMessage::OnIceCandidateFromPublisher { .. } => "onIceCandidateFromPublisher",
            ClientMessage::Unpublish { .. } => "unpublish",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::OnIceCandidateFromSubscriber { .. } => "onIceCandidateFromSubscriber",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::StartedSpeaking => "startedSpeaking",
            ClientMessage::StoppedSpeaking => "stoppedSpeaking",
            ClientMessage::Ping => "ping",
            ClientMessage::Pong => "pong",
        }
    }

    /// Channel the message operates on, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            ClientMessage::Publish { channel, .. }
            | ClientMessage::OnIceCandidateFromPublisher { channel, .. }
            | ClientMessage::Unpublish { channel }
            | ClientMessage::Subscribe { channel, .. }
            | ClientMessage::OnIceCandidateFromSubscriber { channel, .. }
            | ClientMessage::Unsubscribe { channel } => Some(channel),
            ClientMessage::Join { .. }
            | ClientMessage::StartedSpeaking
            | ClientMessage::StoppedSpeaking
            | ClientMessage::Ping
            | ClientMessage::Pong => None,
        }
    }
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not JSON, or JSON without a string `id`.
    Opaque,
    /// Well-formed frame with an `id` nobody handles.
    UnknownId(String),
    /// Known `id` with missing or mistyped fields.
    Malformed { id: String, reason: String },
}

impl From<ParseError> for RoomError {
    fn from(_: ParseError) -> Self {
        RoomError::WrongMessage
    }
}

/// Parse one inbound text frame.
///
/// # Errors
///
/// Returns [`ParseError`] for anything that is not a known, well-formed
/// message. Callers answer every variant with "Wrong message".
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ParseError::Opaque)?;

    let id = match value.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => return Err(ParseError::Opaque),
    };

    if !CLIENT_MESSAGE_IDS.contains(&id.as_str()) {
        return Err(ParseError::UnknownId(id));
    }

    ClientMessage::deserialize(value).map_err(|e| ParseError::Malformed {
        id,
        reason: e.to_string(),
    })
}

/// One entry of the `peoples` roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeopleEntry {
    pub name: String,
    pub online: bool,
    pub session_id: String,
}

/// Participant reference carried by `newPeople` and `exitPeople`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeopleRef {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One entry of the `publications` roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublisherEntry {
    pub name: String,
    pub id: String,
    pub role: String,
    pub channels: Vec<String>,
}

/// Outbound protocol message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { participant_id: String },
    Peoples { data: Vec<PeopleEntry> },
    NewPeople { data: PeopleRef },
    ExitPeople { data: PeopleRef },
    Publications { data: Vec<PublisherEntry> },
    StartPublishing { channel: String },
    StopPublishing { channel: String },
    #[serde(rename_all = "camelCase")]
    StartResponseForPublisher { channel: String, sdp_answer: String },
    #[serde(rename_all = "camelCase")]
    StartResponseForSubscriber { channel: String, sdp_answer: String },
    IceCandidateForPublisher {
        channel: String,
        candidate: IceCandidate,
    },
    IceCandidateForSubscriber {
        channel: String,
        candidate: IceCandidate,
    },
    Error {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Ping,
    Pong,
}

impl ServerMessage {
    /// Build the `error` frame for `err`, optionally naming the channel.
    #[must_use]
    pub fn error(err: &RoomError, channel: Option<&str>) -> Self {
        ServerMessage::Error {
            data: err.client_message(),
            channel: channel.map(str::to_string),
        }
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; not expected for these types.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Greeting sent as a JSON string as soon as a connection reaches its room.
#[must_use]
pub fn greeting(room_id: &str, participant_id: &str) -> String {
    Value::String(format!(
        "Hello, new participant in room '{room_id}'. Your id is '{participant_id}'"
    ))
    .to_string()
}

/// Raw farewell frame sent before the server closes a connection.
pub const FAREWELL: &str = "bye";
