//! Inspection snapshots served at `/inspect`.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot of one room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomReport {
    pub id: String,
    pub participants: Vec<ParticipantReport>,
    /// `YYYY-MM-DD HH:MM:SS.mmm`, UTC.
    pub last_activity: String,
    /// Relative age of `last_activity`, e.g. `5 minutes ago`.
    pub from_now: String,
}

impl RoomReport {
    /// Build a report, rendering `last_activity` relative to `now`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        participants: Vec<ParticipantReport>,
        last_activity: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            participants,
            last_activity: format_timestamp(last_activity),
            from_now: from_now(last_activity, now),
        }
    }
}

/// Snapshot of one participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantReport {
    pub id: String,
    pub name: String,
    pub role: String,
    /// Channels this participant publishes (negotiating or established).
    pub publications: Vec<String>,
    /// Channels this participant subscribes to.
    pub subscriptions: Vec<String>,
}

#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Human relative time between `then` and `now`.
///
/// Buckets: under 45 seconds, about a minute, minutes up to 45, about an
/// hour, hours up to 22, about a day, days up to 26, about a month, months
/// up to 11, about a year, then years. Timestamps in the future count as
/// "a few seconds ago".
#[must_use]
pub fn from_now(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    #[allow(clippy::cast_precision_loss)]
    let elapsed = (now - then).num_milliseconds().max(0) as f64 / 1000.0;

    let seconds = elapsed.round();
    let minutes = (elapsed / 60.0).round();
    let hours = (elapsed / 3_600.0).round();
    let days = (elapsed / 86_400.0).round();
    // 400 years hold 146097 days and 4800 months.
    let months = (elapsed / 86_400.0 * 4_800.0 / 146_097.0).round();
    let years = (elapsed / 86_400.0 * 400.0 / 146_097.0).round();

    let phrase = if seconds < 45.0 {
        "a few seconds".to_string()
    } else if minutes <= 1.0 {
        "a minute".to_string()
    } else if minutes < 45.0 {
        format!("{minutes} minutes")
    } else if hours <= 1.0 {
        "an hour".to_string()
    } else if hours < 22.0 {
        format!("{hours} hours")
    } else if days <= 1.0 {
        "a day".to_string()
    } else if days < 26.0 {
        format!("{days} days")
    } else if months <= 1.0 {
        "a month".to_string()
    } else if months < 11.0 {
        format!("{months} months")
    } else if years <= 1.0 {
        "a year".to_string()
    } else {
        format!("{years} years")
    };

    format!("{phrase} ago")
}
