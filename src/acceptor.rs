//! Listening-socket channel plus the EMFILE reserve-fd dance.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{error, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::socket;

pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr)>;

pub struct Acceptor {
    loop_: Arc<EventLoop>,
    accept_fd: RawFd,
    channel: std::cell::RefCell<Option<std::rc::Rc<Channel>>>,
    new_connection_callback: std::cell::RefCell<Option<NewConnectionCallback>>,
    reserve_fd: std::cell::Cell<RawFd>,
    listening: std::cell::Cell<bool>,
}

// SAFETY: every field here is only ever touched from `loop_`'s owning
// thread (`listen()` asserts it; `handle_read`/`handle_emfile` only run via
// the channel's read callback, which only dispatches on that thread). This
// manual impl exists so `Arc<Acceptor>` can be captured in the `Send`
// closure `TcpServer::start` hands to `EventLoop::run_in_loop`.
unsafe impl Send for Acceptor {}
unsafe impl Sync for Acceptor {}

impl Acceptor {
    pub fn new(loop_: Arc<EventLoop>, addr: SocketAddr, reuse_port: bool) -> Result<Arc<Acceptor>> {
        let accept_fd = socket::create_nonblocking_socket(&addr)?;
        socket::set_reuse_addr(accept_fd, true)?;
        if reuse_port {
            socket::set_reuse_port(accept_fd, true)?;
        }
        socket::bind(accept_fd, &addr)?;

        let reserve_fd = socket::open_reserve_fd().map_err(crate::error::Error::Io)?;

        let acceptor = Arc::new(Acceptor {
            loop_: loop_.clone(),
            accept_fd,
            channel: std::cell::RefCell::new(None),
            new_connection_callback: std::cell::RefCell::new(None),
            reserve_fd: std::cell::Cell::new(reserve_fd),
            listening: std::cell::Cell::new(false),
        });

        let channel = Channel::new(Arc::downgrade(&loop_), accept_fd);
        {
            let acceptor_weak = Arc::downgrade(&acceptor);
            channel.set_read_callback(move |_now| {
                if let Some(acceptor) = acceptor_weak.upgrade() {
                    acceptor.handle_read();
                }
            });
        }
        *acceptor.channel.borrow_mut() = Some(channel);

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(RawFd, SocketAddr) + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Starts listening and enables the read interest. Must be called on
    /// the acceptor's loop thread (normally via `EventLoop::run_in_loop`).
    pub fn listen(&self) -> Result<()> {
        self.loop_.assert_on_loop_thread();
        self.listening.set(true);
        socket::listen(self.accept_fd, 128)?;
        if let Some(channel) = self.channel.borrow().as_ref() {
            channel.enable_reading();
        }
        Ok(())
    }

    fn handle_read(&self) {
        loop {
            match socket::accept(self.accept_fd) {
                Ok(Some((conn_fd, peer_addr))) => {
                    if let Some(cb) = self.new_connection_callback.borrow_mut().as_mut() {
                        cb(conn_fd, peer_addr);
                    } else {
                        socket::close(conn_fd);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EMFILE) {
                        self.handle_emfile();
                    } else {
                        warn!("Acceptor::handle_read() accept() failed: {e}");
                    }
                    break;
                }
            }
        }
    }

    /// Closes the reserve fd to free one slot, accepts (and immediately
    /// drops) the pending connection so level-triggered readiness doesn't
    /// livelock the loop, then reopens the reserve.
    fn handle_emfile(&self) {
        error!("Acceptor::handle_read() EMFILE, dropping one pending connection");
        socket::close(self.reserve_fd.get());
        if let Ok(Some((fd, _))) = socket::accept(self.accept_fd) {
            socket::close(fd);
        }
        match socket::open_reserve_fd() {
            Ok(fd) => self.reserve_fd.set(fd),
            Err(e) => error!("Acceptor::handle_emfile() failed to reopen reserve fd: {e}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
        socket::close(self.reserve_fd.get());
        socket::close(self.accept_fd);
    }
}
