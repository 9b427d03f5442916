//! A single kernel `timerfd`, driving an ordered set of user timers.
//! Lives inside an [`crate::event_loop::EventLoop`]; every mutating method
//! here runs on the loop's own thread -- `EventLoop` is responsible for
//! getting cross-thread `add_timer`/`cancel` requests onto that thread
//! before calling in.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::timer::{Timer, TimerId};
use crate::timestamp::Timestamp;

/// Kernel timers can't be armed for less than this; prevents a
/// zero-or-negative delay from livelocking the loop.
const MIN_ARM_MICROS: i64 = 100;

pub struct TimerQueue {
    timerfd: RawFd,
    channel: Rc<Channel>,
    timers: HashMap<i64, Timer>,
    by_expiry: BTreeSet<(Timestamp, i64)>,
    calling_expired_timers: bool,
    cancelling: HashSet<i64>,
}

impl TimerQueue {
    /// Must be called with a `Weak<EventLoop>` pointing at the loop under
    /// construction (see `EventLoop::new`'s use of `Arc::new_cyclic`).
    pub(crate) fn new(loop_: Weak<EventLoop>) -> std::io::Result<Self> {
        let timerfd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timerfd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let channel = Channel::new(loop_, timerfd);
        Ok(TimerQueue {
            timerfd,
            channel,
            timers: HashMap::new(),
            by_expiry: BTreeSet::new(),
            calling_expired_timers: false,
            cancelling: HashSet::new(),
        })
    }

    pub(crate) fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.timers.len(), self.by_expiry.len());
        self.timers.len()
    }

    /// Inserts a new timer, arming (or re-arming) the kernel timer if this
    /// timer is now the earliest. Must run on the loop thread.
    pub(crate) fn add_timer_in_loop(
        &mut self,
        sequence: i64,
        callback: crate::timer::TimerCallback,
        when: Timestamp,
        interval: f64,
    ) -> TimerId {
        let timer = Timer::new(sequence, callback, when, interval);
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            self.rearm();
        }
        TimerId::new(sequence)
    }

    /// Cancels a timer. Must run on the loop thread.
    pub(crate) fn cancel_in_loop(&mut self, id: TimerId) {
        if self.timers.remove(&id.sequence).is_some() {
            self.by_expiry.retain(|(_, seq)| *seq != id.sequence);
            return;
        }
        if self.calling_expired_timers {
            self.cancelling.insert(id.sequence);
        }
        // Otherwise: already fully expired and removed -- silent no-op.
    }

    fn insert(&mut self, timer: Timer) -> bool {
        let earliest_changed = self
            .by_expiry
            .iter()
            .next()
            .map(|(exp, _)| timer.expiration < *exp)
            .unwrap_or(true);
        self.by_expiry.insert((timer.expiration, timer.sequence));
        self.timers.insert(timer.sequence, timer);
        earliest_changed
    }

    fn rearm(&self) {
        let Some((expiration, _)) = self.by_expiry.iter().next().copied() else {
            return;
        };
        let now = Timestamp::now();
        let micros = (expiration.microseconds_since_epoch() - now.microseconds_since_epoch())
            .max(MIN_ARM_MICROS);

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: micros / 1_000_000,
                tv_nsec: (micros % 1_000_000) * 1_000,
            },
        };
        let res = unsafe {
            libc::timerfd_settime(self.timerfd, 0, &spec, std::ptr::null_mut())
        };
        if res < 0 {
            error!(
                "TimerQueue::rearm() timerfd_settime failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    fn drain_timerfd(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.timerfd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    fn pop_expired(&mut self, now: Timestamp) -> Vec<Timer> {
        let mut expired = Vec::new();
        loop {
            let Some(&(exp, seq)) = self.by_expiry.iter().next() else {
                break;
            };
            if exp > now {
                break;
            }
            self.by_expiry.remove(&(exp, seq));
            if let Some(timer) = self.timers.remove(&seq) {
                expired.push(timer);
            }
        }
        expired
    }

    /// The kernel timer's read callback: drains the fd, fires every
    /// expired timer in non-decreasing expiration order, and restarts
    /// repeating ones not cancelled mid-dispatch.
    pub(crate) fn handle_expired(&mut self) {
        self.drain_timerfd();
        let now = Timestamp::now();

        let mut expired = self.pop_expired(now);
        self.calling_expired_timers = true;
        self.cancelling.clear();

        for timer in expired.iter_mut() {
            (timer.callback)();
        }

        for mut timer in expired {
            if timer.repeat && !self.cancelling.contains(&timer.sequence) {
                timer.restart(now);
                self.by_expiry.insert((timer.expiration, timer.sequence));
                self.timers.insert(timer.sequence, timer);
            }
            // else: destroyed by falling out of scope here.
        }

        self.calling_expired_timers = false;
        self.rearm();
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timerfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_queue() -> TimerQueue {
        TimerQueue::new(Weak::new()).expect("timerfd_create")
    }

    #[test]
    fn invariant_parallel_sets_equal_len_after_insert() {
        let mut q = make_queue();
        q.add_timer_in_loop(1, Box::new(|| {}), Timestamp::now().add_seconds(10.0), 0.0);
        q.add_timer_in_loop(2, Box::new(|| {}), Timestamp::now().add_seconds(5.0), 0.0);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn cancel_before_expiry_removes_from_both_sets() {
        let mut q = make_queue();
        let id = q.add_timer_in_loop(1, Box::new(|| {}), Timestamp::now().add_seconds(10.0), 0.0);
        q.cancel_in_loop(id);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn cancel_after_expiry_is_noop() {
        let mut q = make_queue();
        let id = q.add_timer_in_loop(1, Box::new(|| {}), Timestamp::now(), 0.0);
        // Simulate having already fully expired and removed it.
        q.pop_expired(Timestamp::now().add_seconds(1.0));
        assert_eq!(q.len(), 0);
        q.cancel_in_loop(id); // must not panic or resurrect anything
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn cancel_mid_dispatch_suppresses_restart() {
        let mut q = make_queue();
        let fire_count = Rc::new(std::cell::Cell::new(0));
        let fire_count_cb = fire_count.clone();

        let id = q.add_timer_in_loop(
            1,
            Box::new(move || fire_count_cb.set(fire_count_cb.get() + 1)),
            Timestamp::now(),
            1.0, // repeating
        );

        // Pretend we're mid-dispatch: cancel while calling_expired_timers
        // would be true inside handle_expired. We emulate that directly
        // since handle_expired itself calls the user callback, which is
        // exactly where a self-cancelling timer would call cancel().
        q.calling_expired_timers = true;
        q.cancelling.clear();
        let mut expired = q.pop_expired(Timestamp::now().add_seconds(1.0));
        for t in expired.iter_mut() {
            (t.callback)();
            q.cancel_in_loop(id);
        }
        for mut t in expired {
            if t.repeat && !q.cancelling.contains(&t.sequence) {
                t.restart(Timestamp::now());
                q.by_expiry.insert((t.expiration, t.sequence));
                q.timers.insert(t.sequence, t);
            }
        }
        q.calling_expired_timers = false;

        assert_eq!(fire_count.get(), 1);
        assert_eq!(q.len(), 0, "cancelled mid-dispatch timer must not restart");
    }

    #[test]
    fn non_repeating_timer_is_destroyed_after_firing() {
        let mut q = make_queue();
        q.add_timer_in_loop(1, Box::new(|| {}), Timestamp::now(), 0.0);
        q.handle_expired();
        assert_eq!(q.len(), 0);
    }
}
