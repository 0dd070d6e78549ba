//! Prometheus metrics for the room service.
//!
//! All metrics use the `rs_` prefix and follow Prometheus naming conventions
//! (`_total` suffix for counters).
//!
//! # Cardinality
//!
//! - `message_type`: bounded by the inbound protocol (~12 values)
//! - `kind`: `publish` or `subscribe`
//! - `actor_type`: pool, room, connection

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("rs_negotiation".to_string()),
            &[
                0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set negotiation buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `rs_rooms_active`
pub fn set_rooms_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rs_rooms_active").set(count as f64);
}

/// Metric: `rs_participants_active`
pub fn set_participants_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rs_participants_active").set(count as f64);
}

/// Record one inbound protocol message.
///
/// Metric: `rs_messages_total`
/// Labels: `message_type` (protocol id, or `invalid`)
pub fn record_message(message_type: &'static str) {
    counter!("rs_messages_total", "message_type" => message_type).increment(1);
}

/// Record a failed offer/answer exchange.
///
/// Metric: `rs_negotiation_failures_total`
/// Labels: `kind` (publish, subscribe)
pub fn record_negotiation_failure(kind: &'static str) {
    counter!("rs_negotiation_failures_total", "kind" => kind).increment(1);
}

/// Record how long an offer/answer exchange took, successful or not.
///
/// Metric: `rs_negotiation_duration_seconds`
/// Labels: `kind`
pub fn record_negotiation_duration(kind: &'static str, duration: Duration) {
    histogram!("rs_negotiation_duration_seconds", "kind" => kind)
        .record(duration.as_secs_f64());
}

/// Record an outbound frame dropped because the client queue was full.
///
/// Metric: `rs_messages_dropped_total`
pub fn record_message_dropped() {
    counter!("rs_messages_dropped_total").increment(1);
}

/// Record a room evicted for inactivity.
///
/// Metric: `rs_rooms_evicted_total`
pub fn record_room_evicted() {
    counter!("rs_rooms_evicted_total").increment(1);
}

/// Record an actor panic.
///
/// Metric: `rs_actor_panics_total`
/// Labels: `actor_type`
///
/// Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("rs_actor_panics_total", "actor_type" => actor_type).increment(1);
}
