//! Observability for the room service.
//!
//! Actor run loops are instrumented with `#[instrument(skip_all)]` and only
//! room, participant and channel identifiers are recorded as fields. SDP
//! bodies and ICE candidates are never logged.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `rs_rooms_active` | Gauge | none |
//! | `rs_participants_active` | Gauge | none |
//! | `rs_messages_total` | Counter | `message_type` |
//! | `rs_negotiation_failures_total` | Counter | `kind` |
//! | `rs_negotiation_duration_seconds` | Histogram | `kind` |
//! | `rs_messages_dropped_total` | Counter | none |
//! | `rs_rooms_evicted_total` | Counter | none |
//! | `rs_actor_panics_total` | Counter | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
