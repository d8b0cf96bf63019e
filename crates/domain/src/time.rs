//! Time and timestamp helpers.

use chrono::{DateTime, Utc};

/// UTC timestamp carried by every event.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Whole seconds since the Unix epoch, floored, as carried in broker
/// message properties. Instants before the epoch clamp to zero.
#[must_use]
pub fn epoch_seconds(ts: Timestamp) -> u64 {
    u64::try_from(ts.timestamp()).unwrap_or(0)
}
