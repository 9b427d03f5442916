//! The demultiplexer abstraction: a small trait with three operations,
//! implemented by two back-ends selected once at `EventLoop` construction
//! time and never switched at runtime.

mod epoll_poller;
mod poll_poller;

pub use epoll_poller::EpollPoller;
pub use poll_poller::PollPoller;

use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::channel::Channel;
use crate::error::Result;
use crate::timestamp::Timestamp;

/// Capability abstraction over the OS multiplex primitive. All operations
/// are loop-thread-only; callers (the `EventLoop`) enforce that.
pub trait Poller {
    /// Waits up to `timeout_ms` for readiness, appending every channel that
    /// became active to `active_channels`. Returns the timestamp at which
    /// the wait returned.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Result<Timestamp>;

    /// Makes the registration consistent with `channel`'s current interest
    /// mask (add/modify/delete as needed).
    fn update(&mut self, channel: &Rc<Channel>) -> Result<()>;

    /// De-registers `channel` entirely.
    fn remove(&mut self, channel: &Rc<Channel>) -> Result<()>;

    /// True if `channel`'s fd is currently known to this poller.
    fn has(&self, fd: RawFd) -> bool;

    fn name(&self) -> &'static str;
}

/// Selects a back-end by honoring an environment variable, checked once.
pub fn new_default_poller() -> Box<dyn Poller> {
    match std::env::var("REACTOR_USE_POLL") {
        Ok(val) if !val.is_empty() => Box::new(PollPoller::new()),
        _ => match EpollPoller::new() {
            Ok(epoll) => Box::new(epoll),
            Err(e) => {
                log::error!("epoll_create1 failed ({e}), falling back to poll(2)");
                Box::new(PollPoller::new())
            }
        },
    }
}
