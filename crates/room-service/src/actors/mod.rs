//! Actor model implementation for the room service.
//!
//! ```text
//! RoomPoolActor (singleton per process)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room)
//!         ├── owns participants, publications, subscriptions
//!         └── writes to N ConnectionHandles (one per client connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One serialized context per room**: every room mutation runs inside the
//!   room actor's message loop
//! - **Negotiation off the loop**: backend calls run in spawned tasks and
//!   report back through the room mailbox
//! - **CancellationToken propagation**: the pool hands each room a child token
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500,
//!   Connection: 50/200)
//!
//! # Modules
//!
//! - [`pool`] - `RoomPoolActor` registry with idle eviction
//! - [`room`] - `RoomActor` per active room
//! - [`connection`] - `ConnectionHandle` outbound queue per client
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod pool;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionHandle, CONNECTION_CHANNEL_BUFFER};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use pool::{PoolConfig, RoomPoolActor, RoomPoolHandle};
pub use room::{RoomActor, RoomHandle};
