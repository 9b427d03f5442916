//! Monotonic-ish wall-clock timestamps used for event receipt and timer expiry.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch, with a distinguished invalid value.
///
/// `Timestamp` is totally ordered and cheap to copy; it is passed by value
/// through the read-callback path (`Channel::handle_event`) and stored in
/// the timer queue's ordered sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

const MICROSECONDS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    /// The distinguished sentinel meaning "no timestamp".
    pub const fn invalid() -> Self {
        Timestamp(0)
    }

    /// Constructs a timestamp directly from microseconds since the epoch.
    pub const fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    /// Reads the current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_micros() as i64;
        Timestamp(micros)
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    pub fn microseconds_since_epoch(&self) -> i64 {
        self.0
    }

    /// Returns a new timestamp `seconds` further in the future (fractional
    /// seconds allowed; negative values move it into the past).
    pub fn add_seconds(&self, seconds: f64) -> Self {
        let delta = (seconds * MICROSECONDS_PER_SECOND as f64) as i64;
        Timestamp(self.0 + delta)
    }

    /// Difference between two timestamps, in seconds.
    pub fn diff_seconds(&self, other: Timestamp) -> f64 {
        (self.0 - other.0) as f64 / MICROSECONDS_PER_SECOND as f64
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::invalid()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.0 / MICROSECONDS_PER_SECOND;
        let micros = self.0 % MICROSECONDS_PER_SECOND;
        write!(f, "{seconds}.{micros:06}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Timestamp::invalid().is_valid());
    }

    #[test]
    fn now_is_valid_and_monotone_ish() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn add_seconds_moves_forward() {
        let t = Timestamp::from_micros(1_000_000);
        let later = t.add_seconds(1.5);
        assert_eq!(later.microseconds_since_epoch(), 2_500_000);
        assert!(later > t);
    }

    #[test]
    fn total_order() {
        let a = Timestamp::from_micros(10);
        let b = Timestamp::from_micros(20);
        assert!(a < b);
        assert_eq!(a, Timestamp::from_micros(10));
    }

    #[test]
    fn diff_seconds_roundtrip() {
        let a = Timestamp::from_micros(5_000_000);
        let b = Timestamp::from_micros(2_000_000);
        assert_eq!(a.diff_seconds(b), 3.0);
    }
}
