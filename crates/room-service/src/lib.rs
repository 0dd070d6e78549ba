//! Room Service Library
//!
//! Signaling coordinator for multi-party media rooms. Clients connect over
//! WebSocket, join a room, publish named media channels and subscribe to
//! channels published by others. Media sessions themselves live in an
//! external negotiation backend reached through [`negotiation::NegotiationBackend`].
//!
//! # Architecture
//!
//! ```text
//! RoomPoolActor (singleton)
//! └── RoomActor (one per active room)
//!     └── Participant
//!         ├── Publication (outbound stream per channel)
//!         └── Subscription (inbound view of another participant's publication)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Pool and room actors, connection handles
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-safe messages
//! - [`negotiation`] - Backend traits and the in-process mock backend
//! - [`observability`] - Prometheus metrics and health endpoints
//! - [`protocol`] - Signaling message types
//! - [`report`] - Inspection snapshots
//! - [`state`] - Participant, publication and subscription state
//! - [`transport`] - WebSocket and inspection routes

pub mod actors;
pub mod config;
pub mod errors;
pub mod negotiation;
pub mod observability;
pub mod protocol;
pub mod report;
pub mod state;
pub mod transport;
