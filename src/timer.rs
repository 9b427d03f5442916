//! A single scheduled callback, owned by exactly one [`crate::timer_queue::TimerQueue`].

use std::sync::atomic::{AtomicI64, Ordering};

use crate::timestamp::Timestamp;

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

pub type TimerCallback = Box<dyn FnMut()>;

pub struct Timer {
    pub callback: TimerCallback,
    pub expiration: Timestamp,
    pub interval: f64,
    pub repeat: bool,
    pub sequence: i64,
}

/// Reserves the next globally-unique sequence number. Exposed so a
/// `TimerId` can be handed back to a caller on a different thread than the
/// one that will eventually construct the `Timer` itself (see
/// `EventLoop::run_at`).
pub(crate) fn next_sequence() -> i64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

impl Timer {
    pub fn new(sequence: i64, callback: TimerCallback, expiration: Timestamp, interval: f64) -> Self {
        Timer {
            callback,
            expiration,
            interval,
            repeat: interval > 0.0,
            sequence,
        }
    }

    /// Drift policy: `now + interval`, not `previous_expiry + interval`
    /// -- simple periodic, intentional.
    pub fn restart(&mut self, now: Timestamp) {
        debug_assert!(self.repeat);
        self.expiration = now.add_seconds(self.interval);
    }
}

/// A stable handle safe to hold across expirations. `sequence` comes from a
/// process-wide atomic counter, so even though the queue's backing storage
/// is a generational arena keyed by slot, `TimerId` equality never depends
/// on a slot being reused for a different timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) sequence: i64,
}

impl TimerId {
    pub(crate) fn new(sequence: i64) -> Self {
        TimerId { sequence }
    }
}
