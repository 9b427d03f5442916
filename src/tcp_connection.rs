//! One connected socket, owned by whichever sub-loop it was assigned to.
//! Follows `EventLoop`'s thread-confinement pattern: state
//! that can only be touched from the owning loop's thread lives behind
//! `RefCell`/`Cell`, public methods that may be called from any thread
//! either run inline (already on the right thread) or `run_in_loop` over to
//! it, and a manual `Send`/`Sync` impl lets an `Arc<TcpConnection>` be
//! stored in `TcpServer`'s connection map (held on the server's own loop)
//! while its channel dispatch runs on a different thread entirely.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{error, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket;
use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnectionCallback = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;
pub type MessageCallback = Box<dyn FnMut(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send>;
pub type WriteCompleteCallback = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;
pub type HighWaterMarkCallback = Box<dyn FnMut(&Arc<TcpConnection>, usize) + Send>;
pub type CloseCallback = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;

/// Default write high-water mark.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub struct TcpConnection {
    loop_: Arc<EventLoop>,
    name: String,
    state: std::cell::Cell<ConnState>,
    fd: RawFd,
    channel: std::cell::RefCell<Option<std::rc::Rc<Channel>>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    input_buffer: std::cell::RefCell<Buffer>,
    output_buffer: std::cell::RefCell<Buffer>,
    high_water_mark: usize,

    connection_callback: std::cell::RefCell<Option<ConnectionCallback>>,
    message_callback: std::cell::RefCell<Option<MessageCallback>>,
    write_complete_callback: std::cell::RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_callback: std::cell::RefCell<Option<HighWaterMarkCallback>>,
    close_callback: std::cell::RefCell<Option<CloseCallback>>,
}

// SAFETY: every field besides `loop_`/`name`/`fd`/addrs/`high_water_mark`
// (all immutable after construction, or themselves Send+Sync) is only ever
// touched on `loop_`'s owning thread. Public methods that may be called
// off-thread (`send`, `shutdown`, `force_close`) route through
// `EventLoop::run_in_loop`, which requires the task closure (and therefore
// anything it captures, including `Arc<TcpConnection>` itself) to be
// `Send` -- see `event_loop::Task`'s doc comment for why that bound matters.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    /// Constructs a connection object already bound to `loop_`'s thread.
    /// Must be called on `loop_`'s owning thread (normally from inside the
    /// `run_in_loop` closure `TcpServer` uses to hand the fd to its chosen
    /// sub-loop).
    ///
    /// Unlike most of this module's methods, `new` itself does not require
    /// being called on `loop_`'s thread: it only builds a fresh, not-yet-
    /// shared `Channel` and stores plain data. `TcpServer::new_connection`
    /// relies on this to construct + register the connection on its own
    /// (acceptor) thread while `loop_` is a sub-loop running elsewhere, and
    /// defers the actual channel registration to [`TcpConnection::establish`]
    /// via `run_in_loop`.
    pub fn new(
        loop_: Arc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let _ = socket::set_tcp_nodelay(fd, true);

        let conn = Arc::new_cyclic(|weak: &std::sync::Weak<TcpConnection>| {
            let channel = Channel::new(Arc::downgrade(&loop_), fd);
            {
                let weak = weak.clone();
                channel.set_read_callback(move |now| {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_read(now);
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_write_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_write();
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_close_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_close();
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_error_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_error();
                    }
                });
            }

            TcpConnection {
                loop_,
                name,
                state: std::cell::Cell::new(ConnState::Connecting),
                fd,
                channel: std::cell::RefCell::new(Some(channel)),
                local_addr,
                peer_addr,
                input_buffer: std::cell::RefCell::new(Buffer::new()),
                output_buffer: std::cell::RefCell::new(Buffer::new()),
                high_water_mark: DEFAULT_HIGH_WATER_MARK,
                connection_callback: std::cell::RefCell::new(None),
                message_callback: std::cell::RefCell::new(None),
                write_complete_callback: std::cell::RefCell::new(None),
                high_water_mark_callback: std::cell::RefCell::new(None),
                close_callback: std::cell::RefCell::new(None),
            }
        });

        if let Some(channel) = conn.channel.borrow().as_ref() {
            channel.tie_arc(&conn);
        }

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.get() == ConnState::Connected
    }

    pub fn loop_(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + 'static,
    ) {
        *self.message_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.write_complete_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, usize) + Send + 'static,
    ) {
        *self.high_water_mark_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Registers the channel for reading and fires the connection-up
    /// callback. Must run on the owning loop's thread; called once by
    /// `TcpServer` right after the connection is assigned to a sub-loop.
    pub(crate) fn establish(self: &Arc<Self>) {
        self.loop_.assert_on_loop_thread();
        debug_assert_eq!(self.state.get(), ConnState::Connecting);
        self.state.set(ConnState::Connected);
        if let Some(channel) = self.channel.borrow().as_ref() {
            channel.enable_reading();
        }
        if let Some(cb) = self.connection_callback.borrow_mut().as_mut() {
            cb(self);
        }
    }

    /// Queues the data for write, sending immediately if the channel isn't
    /// already backed up. Safe to call from any thread.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.loop_.is_on_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.clone();
            let data = data.to_vec();
            self.loop_.run_in_loop(move || this.send_in_loop(&data));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_on_loop_thread();
        if self.state.get() != ConnState::Connected {
            warn!("TcpConnection::send_in_loop() giving up, connection {} is not connected", self.name);
            return;
        }

        let channel_writing = self
            .channel
            .borrow()
            .as_ref()
            .map(|c| c.is_writing())
            .unwrap_or(false);

        let mut remaining = data;
        if !channel_writing && self.output_buffer.borrow().readable_len() == 0 {
            let n = unsafe {
                libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len())
            };
            if n >= 0 {
                let n = n as usize;
                remaining = &data[n..];
            } else {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EAGAIN) && err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                    if err.raw_os_error() == Some(libc::EPIPE) || err.raw_os_error() == Some(libc::ECONNRESET) {
                        error!("TcpConnection::send_in_loop() peer reset, fd {}", self.fd);
                    } else {
                        error!("TcpConnection::send_in_loop() write failed: {err}");
                    }
                }
            }
        }

        if !remaining.is_empty() {
            let old_len = self.output_buffer.borrow().readable_len();
            let new_len = old_len + remaining.len();
            if old_len < self.high_water_mark
                && new_len >= self.high_water_mark
            {
                if let Some(cb) = self.high_water_mark_callback.borrow_mut().as_mut() {
                    cb(self, new_len);
                }
            }
            self.output_buffer.borrow_mut().append(remaining);
            if let Some(channel) = self.channel.borrow().as_ref() {
                if !channel.is_writing() {
                    channel.enable_writing();
                }
            }
        } else if !data.is_empty() {
            if let Some(cb) = self.write_complete_callback.borrow_mut().as_mut() {
                cb(self);
            }
        }
    }

    /// Half-closes the write side once any queued output has drained.
    /// Safe to call from any thread.
    pub fn shutdown(self: &Arc<Self>) {
        if self.loop_.is_on_loop_thread() {
            self.shutdown_in_loop();
        } else {
            let this = self.clone();
            self.loop_.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.loop_.assert_on_loop_thread();
        if self.state.get() != ConnState::Connected {
            return;
        }
        self.state.set(ConnState::Disconnecting);
        let channel_writing = self
            .channel
            .borrow()
            .as_ref()
            .map(|c| c.is_writing())
            .unwrap_or(false);
        if !channel_writing {
            let _ = socket::shutdown_write(self.fd);
        }
    }

    /// Forcibly closes regardless of queued output. Safe to call from any
    /// thread.
    pub fn force_close(self: &Arc<Self>) {
        if self.loop_.is_on_loop_thread() {
            self.force_close_in_loop();
        } else {
            let this = self.clone();
            self.loop_.run_in_loop(move || this.force_close_in_loop());
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_on_loop_thread();
        if self.state.get() == ConnState::Connected || self.state.get() == ConnState::Disconnecting {
            self.state.set(ConnState::Disconnecting);
            self.handle_close();
        }
    }

    fn handle_read(self: &Arc<Self>, now: Timestamp) {
        let n = self.input_buffer.borrow_mut().read_fd(self.fd);
        match n {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(cb) = self.message_callback.borrow_mut().as_mut() {
                    let mut buf = self.input_buffer.borrow_mut();
                    cb(self, &mut buf, now);
                }
            }
            Err(e) => {
                if e.raw_os_error() != Some(libc::EAGAIN) && e.raw_os_error() != Some(libc::EWOULDBLOCK) {
                    error!("TcpConnection::handle_read() fd {} failed: {e}", self.fd);
                    self.handle_error();
                }
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        let channel_writing = self
            .channel
            .borrow()
            .as_ref()
            .map(|c| c.is_writing())
            .unwrap_or(false);
        if !channel_writing {
            return;
        }

        let n = {
            let buf = self.output_buffer.borrow();
            let readable = buf.readable();
            if readable.is_empty() {
                0
            } else {
                unsafe { libc::write(self.fd, readable.as_ptr() as *const libc::c_void, readable.len()) }
            }
        };

        if n > 0 {
            self.output_buffer.borrow_mut().retrieve(n as usize);
            if self.output_buffer.borrow().readable_len() == 0 {
                if let Some(channel) = self.channel.borrow().as_ref() {
                    channel.disable_writing();
                }
                if let Some(cb) = self.write_complete_callback.borrow_mut().as_mut() {
                    cb(self);
                }
                if self.state.get() == ConnState::Disconnecting {
                    self.shutdown_in_loop();
                }
            }
        } else if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) && err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                error!("TcpConnection::handle_write() fd {} failed: {err}", self.fd);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        debug_assert!(matches!(self.state.get(), ConnState::Connected | ConnState::Disconnecting));
        self.state.set(ConnState::Disconnected);
        if let Some(channel) = self.channel.borrow().as_ref() {
            channel.disable_all();
        }

        if let Some(cb) = self.connection_callback.borrow_mut().as_mut() {
            cb(self);
        }
        if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = socket::socket_error(self.fd);
        warn!("TcpConnection::handle_error() fd {} SO_ERROR {}", self.fd, err);
    }

    /// Called once the channel has been fully detached, from
    /// `TcpServer::remove_connection_in_loop` after `handle_close` has run.
    pub(crate) fn connection_destroyed(&self) {
        self.loop_.assert_on_loop_thread();
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.remove();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug_assert_eq!(self.state.get(), ConnState::Disconnected);
        socket::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::{Arc as StdArc, Mutex};

    fn connect_pair() -> (RawFd, RawFd) {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        let server_addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(server_addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        use std::os::unix::io::IntoRawFd;
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        (server.into_raw_fd(), client.into_raw_fd())
    }

    #[test]
    fn establish_fires_connection_callback_and_enables_reading() {
        let loop_ = EventLoop::new();
        let (server_fd, client_fd) = connect_pair();

        let conn = TcpConnection::new(
            loop_.clone(),
            "conn-1".into(),
            server_fd,
            socket::local_addr(server_fd).unwrap(),
            socket::peer_addr(server_fd).unwrap(),
        );

        let up = StdArc::new(Mutex::new(false));
        {
            let up = up.clone();
            conn.set_connection_callback(move |c| {
                *up.lock().unwrap() = c.connected();
            });
        }
        conn.establish();
        assert!(*up.lock().unwrap());
        assert!(conn.connected());

        socket::close(client_fd);
    }

    #[test]
    fn message_callback_sees_bytes_written_by_peer() {
        let loop_ = EventLoop::new();
        let (server_fd, client_fd) = connect_pair();

        let conn = TcpConnection::new(
            loop_.clone(),
            "conn-2".into(),
            server_fd,
            socket::local_addr(server_fd).unwrap(),
            socket::peer_addr(server_fd).unwrap(),
        );
        let received = StdArc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            conn.set_message_callback(move |_conn, buf, _now| {
                received.lock().unwrap().extend_from_slice(buf.readable());
                let len = buf.readable_len();
                buf.retrieve(len);
            });
        }
        conn.establish();

        unsafe {
            libc::write(client_fd, b"hello".as_ptr() as *const libc::c_void, 5);
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.handle_read(Timestamp::now());

        assert_eq!(*received.lock().unwrap(), b"hello");
        socket::close(client_fd);
    }

    #[test]
    fn peer_close_triggers_handle_close_and_disconnects() {
        let loop_ = EventLoop::new();
        let (server_fd, client_fd) = connect_pair();

        let conn = TcpConnection::new(
            loop_.clone(),
            "conn-3".into(),
            server_fd,
            socket::local_addr(server_fd).unwrap(),
            socket::peer_addr(server_fd).unwrap(),
        );
        let closed = StdArc::new(Mutex::new(false));
        {
            let closed = closed.clone();
            conn.set_close_callback(move |_c| {
                *closed.lock().unwrap() = true;
            });
        }
        conn.establish();

        socket::close(client_fd);
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.handle_read(Timestamp::now());

        assert!(*closed.lock().unwrap());
        assert!(!conn.connected());
        conn.connection_destroyed();
    }
}
