//! Wall-clock source for expiry checks.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of "now" for expiry comparisons.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Converts an instant to fractional Unix seconds, the persisted expiry format.
#[allow(clippy::cast_precision_loss)]
pub fn to_epoch_secs(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_millis() as f64 / 1000.0
}

/// Converts fractional Unix seconds back to an instant.
#[allow(clippy::cast_possible_truncation)]
pub fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

/// The instant `secs` (possibly fractional, possibly negative) after `now`.
///
/// Returns `None` when the result is not representable.
#[allow(clippy::cast_possible_truncation)]
pub fn expiry_after(now: DateTime<Utc>, secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round();
    if millis.abs() >= 9.0e15 {
        return None;
    }
    now.checked_add_signed(Duration::milliseconds(millis as i64))
}
