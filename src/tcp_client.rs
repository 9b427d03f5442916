//! The outbound half of the connection story: `Connector` drives a
//! non-blocking `connect()` to completion by watching for writability, and
//! `TcpClient` wraps one `Connector` plus the single [`TcpConnection`] it
//! produces.
//!
//! Reconnection is intentionally simple -- a fixed retry delay, no backoff
//! -- and is off by default (`enable_retry` must be called explicitly).

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket;
use crate::tcp_connection::{ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback};
use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

pub type NewConnectionCallback = Box<dyn FnMut(RawFd) + Send>;

/// Drives one non-blocking `connect()` attempt to completion, retrying on a
/// fixed delay while `connect_` stays set, with no backoff curve.
struct Connector {
    loop_: Arc<EventLoop>,
    server_addr: SocketAddr,
    connect: std::cell::Cell<bool>,
    state: std::cell::Cell<ConnectorState>,
    channel: std::cell::RefCell<Option<std::rc::Rc<Channel>>>,
    new_connection_callback: std::cell::RefCell<Option<NewConnectionCallback>>,
}

// SAFETY: same reasoning as `Acceptor`/`TcpConnection` -- every field is
// only touched on `loop_`'s owning thread (`start`/`stop` dispatch through
// `run_in_loop`/`queue_in_loop`; `connect_impl`/`handle_write`/`handle_error`
// only run as channel callbacks, themselves only invoked on that thread).
unsafe impl Send for Connector {}
unsafe impl Sync for Connector {}

const RETRY_DELAY_SECONDS: f64 = 1.0;

impl Connector {
    fn new(loop_: Arc<EventLoop>, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new(Connector {
            loop_,
            server_addr,
            connect: std::cell::Cell::new(false),
            state: std::cell::Cell::new(ConnectorState::Disconnected),
            channel: std::cell::RefCell::new(None),
            new_connection_callback: std::cell::RefCell::new(None),
        })
    }

    fn set_new_connection_callback(&self, cb: impl FnMut(RawFd) + Send + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    fn start(self: &Arc<Self>) {
        self.connect.set(true);
        let this = self.clone();
        self.loop_.run_in_loop(move || this.start_in_loop());
    }

    /// Re-arms a stopped connector immediately, used after a connection
    /// drops and `TcpClient::enable_retry` is set. Must run on the loop
    /// thread (called directly from `TcpClient::remove_connection`).
    fn restart(self: &Arc<Self>) {
        self.loop_.assert_on_loop_thread();
        self.state.set(ConnectorState::Disconnected);
        self.connect.set(true);
        self.start_in_loop();
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.loop_.assert_on_loop_thread();
        if self.connect.get() {
            self.connect_impl();
        }
    }

    fn stop(self: &Arc<Self>) {
        self.connect.set(false);
        let this = self.clone();
        self.loop_.queue_in_loop(move || this.stop_in_loop());
    }

    fn stop_in_loop(self: &Arc<Self>) {
        self.loop_.assert_on_loop_thread();
        if self.state.get() == ConnectorState::Connecting {
            self.state.set(ConnectorState::Disconnected);
            let fd = self.remove_and_reset_channel();
            socket::close(fd);
        }
    }

    fn connect_impl(self: &Arc<Self>) {
        let fd = match socket::create_nonblocking_socket(&self.server_addr) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("Connector::connect_impl() socket() failed: {e}");
                return;
            }
        };

        let (raw_addr, len) = socket::sockaddr_from(&self.server_addr);
        let ret = unsafe { libc::connect(fd, &raw_addr as *const _ as *const libc::sockaddr, len) };
        let saved_errno = if ret < 0 { std::io::Error::last_os_error().raw_os_error().unwrap_or(0) } else { 0 };

        match ret {
            0 => self.connecting(fd),
            _ => match saved_errno {
                libc::EINPROGRESS => self.connecting(fd),
                libc::EAGAIN | libc::EADDRINUSE | libc::EADDRNOTAVAIL | libc::ECONNREFUSED
                | libc::ENETUNREACH => self.retry(fd),
                libc::EISCONN => self.connecting(fd),
                _ => {
                    warn!("Connector::connect_impl() connect() failed: errno {saved_errno}");
                    socket::close(fd);
                }
            },
        }
    }

    fn connecting(self: &Arc<Self>, fd: RawFd) {
        self.state.set(ConnectorState::Connecting);
        let channel = Channel::new(Arc::downgrade(&self.loop_), fd);
        {
            let this = self.clone();
            channel.set_write_callback(move || this.handle_write());
        }
        {
            let this = self.clone();
            channel.set_error_callback(move || this.handle_error());
        }
        *self.channel.borrow_mut() = Some(channel.clone());
        channel.enable_writing();
    }

    fn handle_write(self: &Arc<Self>) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        let fd = self.remove_and_reset_channel();
        let err = socket::socket_error(fd);
        if err != 0 {
            warn!("Connector::handle_write() SO_ERROR {err}, retrying");
            self.retry(fd);
        } else if self.is_self_connect(fd) {
            warn!("Connector::handle_write() self-connect detected, retrying");
            self.retry(fd);
        } else {
            self.state.set(ConnectorState::Connected);
            if self.connect.get() {
                if let Some(cb) = self.new_connection_callback.borrow_mut().as_mut() {
                    cb(fd);
                } else {
                    socket::close(fd);
                }
            } else {
                socket::close(fd);
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        let fd = self.remove_and_reset_channel();
        let err = socket::socket_error(fd);
        warn!("Connector::handle_error() SO_ERROR {err}, retrying");
        self.retry(fd);
    }

    fn retry(self: &Arc<Self>, fd: RawFd) {
        socket::close(fd);
        self.state.set(ConnectorState::Disconnected);
        if self.connect.get() {
            let this = self.clone();
            info!(
                "Connector::retry() will retry connecting to {} in {RETRY_DELAY_SECONDS}s",
                self.server_addr
            );
            self.loop_.run_after(RETRY_DELAY_SECONDS, move || this.start_in_loop());
        }
    }

    fn is_self_connect(&self, fd: RawFd) -> bool {
        match (socket::local_addr(fd), socket::peer_addr(fd)) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    fn remove_and_reset_channel(&self) -> RawFd {
        let channel = self.channel.borrow_mut().take().expect("channel present while connecting");
        channel.disable_all();
        channel.remove();
        channel.fd()
    }
}

/// A single outbound connection with reconnect-on-failure suppressed by
/// default. One `TcpClient` manages at most one live [`TcpConnection`] at
/// a time.
pub struct TcpClient {
    loop_: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,

    connection_callback: Arc<Mutex<Option<ConnectionCallback>>>,
    message_callback: Arc<Mutex<Option<MessageCallback>>>,
    write_complete_callback: Arc<Mutex<Option<WriteCompleteCallback>>>,

    retry: std::cell::Cell<bool>,
    connect: std::cell::Cell<bool>,
    next_conn_id: std::cell::Cell<i32>,
    connection: std::cell::RefCell<Option<Arc<TcpConnection>>>,
}

// SAFETY: same RefCell-vs-Mutex split as `TcpServer` -- `next_conn_id` and
// `connection` are only touched on `loop_`'s thread (`new_connection`/
// `remove_connection` both assert it), while the three user callbacks are
// read from whatever thread owns the connection, hence `Mutex`.
unsafe impl Send for TcpClient {}
unsafe impl Sync for TcpClient {}

impl TcpClient {
    pub fn new(loop_: Arc<EventLoop>, server_addr: SocketAddr, name: impl Into<String>) -> Arc<TcpClient> {
        loop_.assert_on_loop_thread();
        let connector = Connector::new(loop_.clone(), server_addr);
        let name = name.into();

        let client = Arc::new_cyclic(|weak: &std::sync::Weak<TcpClient>| {
            {
                let weak = weak.clone();
                connector.set_new_connection_callback(move |fd| {
                    if let Some(client) = weak.upgrade() {
                        client.new_connection(fd);
                    } else {
                        socket::close(fd);
                    }
                });
            }
            TcpClient {
                loop_,
                connector,
                name,
                connection_callback: Arc::new(Mutex::new(None)),
                message_callback: Arc::new(Mutex::new(None)),
                write_complete_callback: Arc::new(Mutex::new(None)),
                retry: std::cell::Cell::new(false),
                connect: std::cell::Cell::new(false),
                next_conn_id: std::cell::Cell::new(1),
                connection: std::cell::RefCell::new(None),
            }
        });

        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enables automatic reconnection after the current connection closes.
    /// Off by default: a `TcpClient` that loses its connection just stays
    /// disconnected unless this has been called.
    pub fn enable_retry(&self) {
        self.retry.set(true);
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + 'static,
    ) {
        *self.message_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.write_complete_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn connect(self: &Arc<Self>) {
        self.connect.set(true);
        self.connector.start();
    }

    /// Half-closes the current connection, if any. Does not stop the
    /// connector from retrying if `enable_retry` is set.
    pub fn disconnect(self: &Arc<Self>) {
        self.connect.set(false);
        if let Some(conn) = self.connection.borrow().clone() {
            conn.shutdown();
        }
    }

    pub fn stop(self: &Arc<Self>) {
        self.connect.set(false);
        self.connector.stop();
    }

    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.borrow().clone()
    }

    /// The connector's success callback: always runs on `self.loop_`'s
    /// thread (channel dispatch only happens there).
    fn new_connection(self: &Arc<Self>, fd: RawFd) {
        self.loop_.assert_on_loop_thread();
        let peer_addr = match socket::peer_addr(fd) {
            Ok(a) => a,
            Err(e) => {
                warn!("TcpClient::new_connection() getpeername failed: {e}");
                socket::close(fd);
                return;
            }
        };
        let local_addr = socket::local_addr(fd).unwrap_or(peer_addr);

        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}#{conn_id}", self.name);

        info!("TcpClient::new_connection() [{}] connected to {peer_addr}", self.name);

        let conn = TcpConnection::new(self.loop_.clone(), conn_name, fd, local_addr, peer_addr);
        *self.connection.borrow_mut() = Some(conn.clone());

        let conn_cb = self.connection_callback.clone();
        conn.set_connection_callback(move |c| {
            if let Some(cb) = conn_cb.lock().unwrap().as_mut() {
                cb(c);
            }
        });
        let msg_cb = self.message_callback.clone();
        conn.set_message_callback(move |c, buf, now| {
            if let Some(cb) = msg_cb.lock().unwrap().as_mut() {
                cb(c, buf, now);
            }
        });
        let wc_cb = self.write_complete_callback.clone();
        conn.set_write_complete_callback(move |c| {
            if let Some(cb) = wc_cb.lock().unwrap().as_mut() {
                cb(c);
            }
        });

        let client_weak = Arc::downgrade(self);
        conn.set_close_callback(move |c| {
            if let Some(client) = client_weak.upgrade() {
                client.remove_connection(c);
            }
        });

        conn.establish();
    }

    /// Runs on `self.loop_`'s thread (it's invoked from the connection's
    /// own close callback, and the connection always lives on this same
    /// loop for a `TcpClient` -- there is no sub-loop pool here).
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        self.loop_.assert_on_loop_thread();
        self.connection.borrow_mut().take();
        let conn = conn.clone();
        self.loop_.queue_in_loop(move || conn.connection_destroyed());

        if self.retry.get() && self.connect.get() {
            self.connector.restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn connects_to_listener_and_exchanges_data() {
        let loop_ = EventLoop::new();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        let server_addr = listener.local_addr().unwrap();

        let accept_thread = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            use std::io::{Read, Write};
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let client = TcpClient::new(loop_.clone(), server_addr, "client-test");
        let received = Arc::new(StdMutex::new(Vec::new()));
        {
            let received = received.clone();
            let loop_for_cb = loop_.clone();
            client.set_message_callback(move |_c, buf, _now| {
                received.lock().unwrap().extend_from_slice(&buf.retrieve_all());
                loop_for_cb.quit();
            });
        }
        client.set_connection_callback(move |c| {
            if c.connected() {
                c.send(b"ping");
            }
        });
        client.connect();

        let loop_for_timeout = loop_.clone();
        loop_.run_after(2.0, move || loop_for_timeout.quit());

        loop_.run();
        accept_thread.join().unwrap();

        assert_eq!(*received.lock().unwrap(), b"ping");
    }

    #[test]
    fn disabled_retry_leaves_client_disconnected_after_close() {
        let loop_ = EventLoop::new();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let client = TcpClient::new(loop_.clone(), addr, "no-retry");
        assert!(!client.retry.get());
        assert!(client.connection().is_none());
    }
}
