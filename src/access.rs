//! Per-(subscriber, topic) cursor rows used to resume delivery.

use chrono::{DateTime, Utc};

/// The high-water mark for a subscriber on a topic: every message with
/// `time <= access.time` has already been delivered.
#[derive(Clone, Debug, PartialEq)]
pub struct Access {
    pub subscriber: String,
    pub topic: String,
    pub time: DateTime<Utc>,
}

/// How a brand-new `(subscriber, topic)` cursor is initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorPolicy {
    /// Start at the `time` of the earliest existing message on the topic,
    /// or now if no message exists yet. Matches the upstream implementation;
    /// most production deployments actually want `Now` (no replay).
    #[default]
    Earliest,
    /// Start at the current time — new subscribers never replay history.
    Now,
}
