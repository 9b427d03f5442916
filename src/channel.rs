//! `Channel`: binds one fd, an interest mask and a set of callbacks, and
//! mediates registration state with the owning loop's demultiplexer.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::warn;

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

// Readiness/interest bits, bundling the back-end's readable-plus-priority
// flags under READ_EVENT.
pub const NONE_EVENT: i16 = 0;
pub const READ_EVENT: i16 = libc::POLLIN as i16 | libc::POLLPRI as i16;
pub const WRITE_EVENT: i16 = libc::POLLOUT as i16;

/// `index` states shared by both poller back-ends. The array poller uses
/// only `New`/`non-negative`; the set poller uses all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerTag {
    /// Never registered with the demultiplexer.
    New,
    /// Currently present in the kernel's interest set (or, for the array
    /// poller, at this index in the dense array).
    Added(i32),
    /// Known to the poller's bookkeeping but not in the kernel set.
    Deleted,
}

impl Default for PollerTag {
    fn default() -> Self {
        PollerTag::New
    }
}

type ReadCallback = Box<dyn FnMut(Timestamp)>;
type EventCallback = Box<dyn FnMut()>;

pub struct Channel {
    loop_: Weak<EventLoop>,
    fd: RawFd,
    events: Cell<i16>,
    revents: Cell<i16>,
    tag: Cell<PollerTag>,

    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,

    tie: RefCell<Option<Box<dyn Fn() -> bool>>>,
    tied: Cell<bool>,

    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    log_hup: Cell<bool>,
}

impl Channel {
    pub fn new(loop_: Weak<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new(Channel {
            loop_,
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            tag: Cell::new(PollerTag::New),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
            tie: RefCell::new(None),
            tied: Cell::new(false),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            log_hup: Cell::new(true),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> i16 {
        self.events.get()
    }

    pub fn set_revents(&self, revents: i16) {
        self.revents.set(revents);
    }

    pub fn tag(&self) -> PollerTag {
        self.tag.get()
    }

    pub fn set_tag(&self, tag: PollerTag) {
        self.tag.set(tag);
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Ties this channel's dispatch to the lifetime of `owner`: at the
    /// start of `handle_event` the weak reference is upgraded, and the
    /// dispatch is skipped entirely if the owner has already been dropped.
    pub fn tie<T: 'static>(&self, owner: &Rc<T>) {
        let weak = Rc::downgrade(owner);
        *self.tie.borrow_mut() = Some(Box::new(move || weak.upgrade().is_some()));
        self.tied.set(true);
    }

    /// Same as [`Channel::tie`] but for an `Arc`-owned object (e.g.
    /// `TcpConnection`, which must be `Send`/`Sync` to be handed to other
    /// loops' task queues).
    pub fn tie_arc<T: 'static + Send + Sync>(&self, owner: &std::sync::Arc<T>) {
        let weak = std::sync::Arc::downgrade(owner);
        *self.tie.borrow_mut() = Some(Box::new(move || weak.upgrade().is_some()));
        self.tied.set(true);
    }

    pub fn enable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    pub fn disable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    pub fn enable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    pub fn disable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub fn disable_all(self: &Rc<Self>) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    fn update(self: &Rc<Self>) {
        self.added_to_loop.set(true);
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.update_channel(self);
        }
    }

    /// Detaches the channel from its loop's demultiplexer. The interest
    /// mask must already be none.
    pub fn remove(self: &Rc<Self>) {
        debug_assert!(self.is_none_event());
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.remove_channel(self);
        }
        self.added_to_loop.set(false);
    }

    pub fn set_log_hup(&self, on: bool) {
        self.log_hup.set(on);
    }

    pub fn event_handling(&self) -> bool {
        self.event_handling.get()
    }

    /// Dispatches readiness recorded in `revents` for this poll cycle.
    /// Order is fixed and tested: tie-upgrade, HUP, NVAL/ERR, read, write.
    pub fn handle_event(self: &Rc<Self>, now: Timestamp) {
        if self.tied.get() {
            let alive = self.tie.borrow().as_ref().map(|is_alive| is_alive()).unwrap_or(false);
            if !alive {
                return;
            }
        }
        self.handle_event_guarded(now);
    }

    fn handle_event_guarded(&self, now: Timestamp) {
        self.event_handling.set(true);
        let revents = self.revents.get();

        if (revents & libc::POLLHUP as i16 != 0) && (revents & libc::POLLIN as i16 == 0) {
            if self.log_hup.get() {
                warn!("Channel::handle_event() POLLHUP on fd {}", self.fd);
            }
            if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if revents & libc::POLLNVAL as i16 != 0 {
            warn!("Channel::handle_event() POLLNVAL on fd {}", self.fd);
        }

        if revents & (libc::POLLERR as i16 | libc::POLLNVAL as i16) != 0 {
            if let Some(cb) = self.error_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if revents & (libc::POLLIN as i16 | libc::POLLPRI as i16 | libc::POLLRDHUP as i16) != 0 {
            if let Some(cb) = self.read_callback.borrow_mut().as_mut() {
                cb(now);
            }
        }

        if revents & libc::POLLOUT as i16 != 0 {
            if let Some(cb) = self.write_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        self.event_handling.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.get());
    }
}
