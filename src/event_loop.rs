//! The reactor's owner of one demultiplexer, one wakeup channel, one timer
//! queue and the cross-thread task-injection queue.
//!
//! An `EventLoop` belongs to the thread that created it: every method that
//! touches loop-thread-only state asserts that and aborts the process
//! otherwise. To let an
//! `Arc<EventLoop>` be handed to other threads at all (for `run_in_loop`,
//! `queue_in_loop`, `run_at`/`cancel`, and `quit`), `EventLoop` carries a
//! manual `Send`/`Sync` impl: the non-`Sync` fields (`RefCell`s, `Cell`s)
//! are loop-thread-confined by the assertions below, and the one field
//! that is genuinely touched from other threads (`pending_functors`) is
//! `Mutex`-protected.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use log::{error, info, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::poller::{self, Poller};
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;
use crate::timestamp::Timestamp;

/// A unit of cross-thread deferred work. Cross-thread submission requires
/// `Send` -- see the module doc comment for why that keeps the manual
/// `Send`/`Sync` impl on `EventLoop` sound.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(std::ptr::null()) };
}

static IGNORE_SIGPIPE_ONCE: Once = Once::new();

fn ignore_sigpipe() {
    IGNORE_SIGPIPE_ONCE.call_once(|| {
        #[cfg(unix)]
        unsafe {
            use nix::sys::signal::{signal, SigHandler, Signal};
            let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
    });
}

pub struct EventLoop {
    thread_id: ThreadId,
    poller: RefCell<Box<dyn Poller>>,
    channels: RefCell<HashMap<RawFd, Rc<Channel>>>,
    timer_queue: RefCell<TimerQueue>,

    wakeup_fd: RawFd,
    wakeup_channel: RefCell<Option<Rc<Channel>>>,

    pending_functors: Mutex<Vec<Task>>,
    calling_pending_functors: AtomicBool,

    looping: Cell<bool>,
    quit: AtomicBool,
    event_handling: Cell<bool>,
    current_active_channel: Cell<Option<RawFd>>,
    iteration: Cell<u64>,
    poll_return_time: Cell<Timestamp>,
}

// SAFETY: every field that isn't itself Sync is only ever mutated from the
// thread identified by `thread_id`, and every public method that touches
// such a field asserts `assert_on_loop_thread()` (or routes through the
// Mutex-protected `pending_functors` queue when called off-thread). The
// assertions abort rather than silently racing.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Creates a new loop, bound to the calling thread. Aborts the process
    /// if the calling thread already owns a loop.
    pub fn new() -> Arc<EventLoop> {
        ignore_sigpipe();

        let existing = CURRENT_LOOP.with(|c| c.get());
        if !existing.is_null() {
            error!("Another EventLoop {existing:p} exists in this thread {:?}", std::thread::current().id());
            std::process::abort();
        }

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            error!("EventLoop::new() eventfd() failed: {}", std::io::Error::last_os_error());
            std::process::abort();
        }

        let loop_ = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let timer_queue = TimerQueue::new(weak.clone()).unwrap_or_else(|e| {
                error!("EventLoop::new() timerfd_create() failed: {e}");
                std::process::abort();
            });
            EventLoop {
                thread_id: std::thread::current().id(),
                poller: RefCell::new(poller::new_default_poller()),
                channels: RefCell::new(HashMap::new()),
                timer_queue: RefCell::new(timer_queue),
                wakeup_fd,
                wakeup_channel: RefCell::new(None),
                pending_functors: Mutex::new(Vec::new()),
                calling_pending_functors: AtomicBool::new(false),
                looping: Cell::new(false),
                quit: AtomicBool::new(false),
                event_handling: Cell::new(false),
                current_active_channel: Cell::new(None),
                iteration: Cell::new(0),
                poll_return_time: Cell::new(Timestamp::invalid()),
            }
        });

        CURRENT_LOOP.with(|c| c.set(Arc::as_ptr(&loop_)));

        let wakeup_channel = Channel::new(Arc::downgrade(&loop_), wakeup_fd);
        {
            let loop_weak = Arc::downgrade(&loop_);
            wakeup_channel.set_read_callback(move |_now| {
                if let Some(loop_) = loop_weak.upgrade() {
                    loop_.handle_wakeup_read();
                }
            });
        }
        wakeup_channel.enable_reading();
        *loop_.wakeup_channel.borrow_mut() = Some(wakeup_channel);

        let timer_channel = loop_.timer_queue.borrow().channel().clone();
        {
            let loop_weak = Arc::downgrade(&loop_);
            timer_channel.set_read_callback(move |_now| {
                if let Some(loop_) = loop_weak.upgrade() {
                    loop_.timer_queue.borrow_mut().handle_expired();
                }
            });
        }
        timer_channel.enable_reading();

        loop_
    }

    pub(crate) fn assert_on_loop_thread(&self) {
        if std::thread::current().id() != self.thread_id {
            error!(
                "EventLoop accessed from wrong thread: owner={:?} caller={:?}",
                self.thread_id,
                std::thread::current().id()
            );
            std::process::abort();
        }
    }

    pub fn is_on_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    fn handle_wakeup_read(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.wakeup_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    /// Runs the loop on the calling thread. Must be the thread that
    /// created this loop.
    pub fn run(self: &Arc<Self>) {
        self.assert_on_loop_thread();
        assert!(!self.looping.get(), "EventLoop::run() called twice");
        self.looping.set(true);
        self.quit.store(false, Ordering::SeqCst);
        info!("EventLoop {:p} start running", Arc::as_ptr(self));

        let mut active_channels: Vec<Rc<Channel>> = Vec::new();

        while !self.quit.load(Ordering::SeqCst) {
            active_channels.clear();

            let now = match self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active_channels) {
                Ok(now) => now,
                Err(e) => {
                    error!("EventLoop::run() poll failed: {e}");
                    Timestamp::now()
                }
            };
            self.poll_return_time.set(now);
            self.iteration.set(self.iteration.get() + 1);

            self.event_handling.set(true);
            for channel in &active_channels {
                self.current_active_channel.set(Some(channel.fd()));
                channel.handle_event(now);
            }
            self.current_active_channel.set(None);
            self.event_handling.set(false);

            self.do_pending_functors();
        }

        info!("EventLoop {:p} stop looping", Arc::as_ptr(self));
        self.looping.set(false);
    }

    /// Requests the loop to stop. Safe from any thread; wakes the loop if
    /// called from elsewhere so the 10s poll bound doesn't delay the quit.
    pub fn quit(self: &Arc<Self>) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_on_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.looping.get()
    }

    /// Runs `task` on this loop: inline if already on the loop thread,
    /// otherwise deferred via [`EventLoop::queue_in_loop`].
    pub fn run_in_loop(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        if self.is_on_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue, waking the loop iff the
    /// submission is cross-thread or the loop is itself mid-drain (so a
    /// task that enqueues more tasks can't stall until the next readiness
    /// event).
    pub fn queue_in_loop(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.pending_functors.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_on_loop_thread() || self.calling_pending_functors.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    /// Swaps the pending queue into a local vector and runs it, bounding
    /// the critical section and letting a running task enqueue further
    /// work without self-deadlocking.
    fn do_pending_functors(self: &Arc<Self>) {
        let mut functors = {
            let mut pending = self.pending_functors.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        self.calling_pending_functors.store(true, Ordering::SeqCst);
        for f in functors.drain(..) {
            f();
        }
        self.calling_pending_functors.store(false, Ordering::SeqCst);
    }

    // -- channel registration, loop-thread-only --

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_on_loop_thread();
        self.channels.borrow_mut().insert(channel.fd(), channel.clone());
        if let Err(e) = self.poller.borrow_mut().update(channel) {
            warn!("EventLoop::update_channel() {e}");
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_on_loop_thread();
        if self.event_handling.get() {
            let dispatching = self.current_active_channel.get();
            debug_assert!(dispatching.is_none() || dispatching == Some(channel.fd()) || !self.poller.borrow().has(channel.fd()));
        }
        self.channels.borrow_mut().remove(&channel.fd());
        if let Err(e) = self.poller.borrow_mut().remove(channel) {
            warn!("EventLoop::remove_channel() {e}");
        }
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.assert_on_loop_thread();
        self.channels.borrow().contains_key(&fd)
    }

    // -- timers --

    pub fn run_at(self: &Arc<Self>, when: Timestamp, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule_timer(cb, when, 0.0)
    }

    pub fn run_after(self: &Arc<Self>, delay_seconds: f64, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule_timer(cb, Timestamp::now().add_seconds(delay_seconds), 0.0)
    }

    pub fn run_every(self: &Arc<Self>, interval_seconds: f64, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule_timer(cb, Timestamp::now().add_seconds(interval_seconds), interval_seconds)
    }

    fn schedule_timer(
        self: &Arc<Self>,
        cb: impl FnMut() + Send + 'static,
        when: Timestamp,
        interval: f64,
    ) -> TimerId {
        let sequence = crate::timer::next_sequence();
        let id = TimerId::new(sequence);
        let cb: crate::timer::TimerCallback = Box::new(cb);
        let this = self.clone();
        self.run_in_loop(move || {
            this.timer_queue
                .borrow_mut()
                .add_timer_in_loop(sequence, cb, when, interval);
        });
        id
    }

    pub fn cancel(self: &Arc<Self>, id: TimerId) {
        let this = self.clone();
        self.run_in_loop(move || {
            this.timer_queue.borrow_mut().cancel_in_loop(id);
        });
    }

    pub fn poller_name(&self) -> &'static str {
        self.poller.borrow().name()
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|c| {
            if c.get() == self as *const EventLoop {
                c.set(std::ptr::null());
            }
        });
        crate::socket::close(self.wakeup_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn run_in_loop_executes_inline_on_owning_thread() {
        let loop_ = EventLoop::new();
        let hit = Rc::new(Cell::new(false));
        let hit2 = hit.clone();
        loop_.run_in_loop(move || hit2.set(true));
        // run_in_loop on the creating thread (== loop thread, loop not
        // running yet) executes inline immediately.
        assert!(hit.get());
    }

    /// Spawns a worker thread that constructs its own `EventLoop` (so the
    /// loop's owning thread is the worker, not the caller) and immediately
    /// calls `run()` on it, handing the `Arc` back once it's ready.
    fn spawn_running_loop() -> (Arc<EventLoop>, std::thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<Arc<EventLoop>>();
        let handle = std::thread::spawn(move || {
            let loop_ = EventLoop::new();
            tx.send(loop_.clone()).unwrap();
            loop_.run();
        });
        let loop_ = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        (loop_, handle)
    }

    #[test]
    fn cross_thread_run_in_loop_executes_on_loop_thread_exactly_once() {
        let (loop_, handle) = spawn_running_loop();
        let loop_thread_id = loop_.thread_id;
        let (tx, rx) = mpsc::channel::<ThreadId>();

        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let loop_for_task = loop_.clone();
        std::thread::spawn(move || {
            loop_for_task.run_in_loop(move || {
                tx.send(std::thread::current().id()).unwrap();
            });
            ready_tx.send(()).unwrap();
        });

        ready_rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        let observed = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        assert_eq!(observed, loop_thread_id);

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn quit_from_other_thread_returns_promptly() {
        let start = std::time::Instant::now();
        let (loop_, handle) = spawn_running_loop();

        std::thread::sleep(StdDuration::from_millis(50));
        loop_.quit();
        handle.join().unwrap();

        assert!(start.elapsed() < StdDuration::from_secs(2));
    }

    #[test]
    fn tasks_enqueued_during_drain_run_next_iteration() {
        let (loop_, handle) = spawn_running_loop();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        loop_.run_in_loop(move || {
            o1.lock().unwrap().push(1);
        });

        std::thread::sleep(StdDuration::from_millis(30));
        loop_.quit();
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1]);
    }
}
