//! Ties the acceptor, the sub-loop thread pool and the live connection map
//! together: accepted fds are handed to sub-loops round-robin, and every
//! user callback set here is forwarded to each connection the server
//! creates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::info;

use crate::acceptor::Acceptor;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThreadPool;
use crate::socket;
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};

/// `TcpServer` construction options: sub-loop count and whether the listen
/// socket sets `SO_REUSEPORT`.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub thread_num: usize,
    pub reuse_port: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            thread_num: 0,
            reuse_port: false,
        }
    }
}

pub struct TcpServer {
    loop_: Arc<EventLoop>,
    name: String,
    listen_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    thread_pool: EventLoopThreadPool,

    connection_callback: Arc<Mutex<Option<ConnectionCallback>>>,
    message_callback: Arc<Mutex<Option<MessageCallback>>>,
    write_complete_callback: Arc<Mutex<Option<WriteCompleteCallback>>>,

    next_conn_id: std::cell::Cell<i32>,
    connections: std::cell::RefCell<HashMap<String, Arc<TcpConnection>>>,
    started: std::cell::Cell<bool>,
}

// SAFETY: `next_conn_id`/`connections`/`started` are only ever touched on
// `loop_`'s thread: `new_connection` runs there (it's the acceptor's read
// callback), and `remove_connection_in_loop` always reaches the map via
// `self.loop_.run_in_loop`, never directly from a sub-loop thread. The
// genuinely cross-thread-shared state (the three user callbacks) is
// `Mutex`-protected rather than `RefCell`-protected precisely because every
// connection's forwarding thunk may lock it from whatever sub-loop thread
// owns that connection.
unsafe impl Send for TcpServer {}
unsafe impl Sync for TcpServer {}

impl TcpServer {
    pub fn new(
        loop_: Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> Result<Arc<TcpServer>> {
        loop_.assert_on_loop_thread();
        let name = name.into();
        let acceptor = Acceptor::new(loop_.clone(), listen_addr, options.reuse_port)?;
        let thread_pool = EventLoopThreadPool::new(loop_.clone(), options.thread_num);

        let server = Arc::new_cyclic(|weak: &std::sync::Weak<TcpServer>| {
            {
                let weak = weak.clone();
                acceptor.set_new_connection_callback(move |fd, peer_addr| {
                    if let Some(server) = weak.upgrade() {
                        server.new_connection(fd, peer_addr);
                    } else {
                        socket::close(fd);
                    }
                });
            }
            TcpServer {
                loop_,
                name,
                listen_addr,
                acceptor,
                thread_pool,
                connection_callback: Arc::new(Mutex::new(None)),
                message_callback: Arc::new(Mutex::new(None)),
                write_complete_callback: Arc::new(Mutex::new(None)),
                next_conn_id: std::cell::Cell::new(1),
                connections: std::cell::RefCell::new(HashMap::new()),
                started: std::cell::Cell::new(false),
            }
        });

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Must be called before [`TcpServer::start`]; changing the thread
    /// count afterward has no effect.
    pub fn num_threads(&self) -> usize {
        self.thread_pool.num_threads()
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, &mut crate::buffer::Buffer, crate::timestamp::Timestamp)
            + Send
            + 'static,
    ) {
        *self.message_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.write_complete_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// Starts the sub-loop pool (first call only) and puts the listening
    /// socket into the kernel's listen state on the server's own loop.
    pub fn start(self: &Arc<Self>) {
        if !self.started.replace(true) {
            self.thread_pool.start();
            let acceptor = self.acceptor.clone();
            let name = self.name.clone();
            self.loop_.run_in_loop(move || {
                if let Err(e) = acceptor.listen() {
                    log::error!("TcpServer::start() [{name}] acceptor.listen() failed: {e}");
                }
            });
        }
    }

    pub fn connection_count(&self) -> usize {
        self.loop_.assert_on_loop_thread();
        self.connections.borrow().len()
    }

    /// The acceptor's new-connection callback: always runs on `self.loop_`'s
    /// thread. Assigns the fd to the next sub-loop round-robin, constructs
    /// the connection and wires its callbacks here (on this thread), then
    /// defers only the channel registration to the sub-loop via
    /// `establish()`.
    fn new_connection(self: &Arc<Self>, fd: RawFd, peer_addr: SocketAddr) {
        self.loop_.assert_on_loop_thread();
        let io_loop = self.thread_pool.next_loop();

        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.listen_addr, conn_id);
        let local_addr = socket::local_addr(fd).unwrap_or(self.listen_addr);

        info!(
            "TcpServer::new_connection() [{}] new connection [{conn_name}] from {peer_addr}",
            self.name
        );

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), fd, local_addr, peer_addr);
        self.connections.borrow_mut().insert(conn_name, conn.clone());

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

        let server_weak = Arc::downgrade(self);
        conn.set_close_callback(move |c| {
            if let Some(server) = server_weak.upgrade() {
                let name = c.name().to_string();
                server.loop_.run_in_loop(move || server.remove_connection_in_loop(&name));
            }
        });

        io_loop.run_in_loop(move || conn.establish());
    }

    /// Removes `name` from the connection map, then hands the connection's
    /// final teardown back to its own sub-loop via `queue_in_loop` so it
    /// runs only after the dispatch that triggered the close returns.
    fn remove_connection_in_loop(self: &Arc<Self>, name: &str) {
        self.loop_.assert_on_loop_thread();
        if let Some(conn) = self.connections.borrow_mut().remove(name) {
            info!("TcpServer::remove_connection_in_loop() [{}] - {name}", self.name);
            let io_loop = conn.loop_().clone();
            io_loop.queue_in_loop(move || conn.connection_destroyed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn accepted_connection_gets_connection_and_message_callbacks() {
        let loop_ = EventLoop::new();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let server = TcpServer::new(loop_.clone(), addr, "echo-test", ServerOptions::default()).unwrap();
        let bound = server.listen_addr();

        let up = Arc::new(StdMutex::new(false));
        {
            let up = up.clone();
            server.set_connection_callback(move |c| {
                if c.connected() {
                    *up.lock().unwrap() = true;
                }
            });
        }

        let echoed = Arc::new(StdMutex::new(Vec::new()));
        {
            let echoed = echoed.clone();
            server.set_message_callback(move |conn, buf, _now| {
                let bytes = buf.retrieve_all();
                echoed.lock().unwrap().extend_from_slice(&bytes);
                conn.send(&bytes);
                conn.loop_().quit();
            });
        }

        // The test thread is the loop's owning thread and the loop isn't
        // running yet, so `start()`'s `run_in_loop` call executes
        // `acceptor.listen()` inline here.
        server.start();

        let loop_for_timeout = loop_.clone();
        loop_.run_after(2.0, move || loop_for_timeout.quit());

        let client_thread = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            use std::io::{Read, Write};
            let mut stream = std::net::TcpStream::connect(bound).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        loop_.run();
        let echoed_back = client_thread.join().unwrap();

        assert!(*up.lock().unwrap());
        assert_eq!(*echoed.lock().unwrap(), b"ping");
        assert_eq!(&echoed_back, b"ping");
    }

    #[test]
    fn empty_pool_server_runs_connections_on_base_loop() {
        let loop_ = EventLoop::new();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let server = TcpServer::new(loop_.clone(), addr, "single-thread", ServerOptions::default()).unwrap();
        assert_eq!(server.num_threads(), 0);
    }
}
