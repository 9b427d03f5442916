//! A small reactor-pattern TCP networking core: one event loop per thread,
//! channels binding fds to callbacks, a timer queue, an acceptor/connector
//! pair and the connection/server/client types built on top of them.
//!
//! Split between the reactor core (`EventLoop`, `Channel`, `Poller`,
//! `TimerQueue`) and the networking layer built on it (`Acceptor`,
//! `Connector`, `TcpConnection`, `TcpServer`, `TcpClient`). See each
//! module for the piece of the reactor it implements.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod poller;
pub mod socket;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timer;
pub mod timer_queue;
pub mod timestamp;

pub use buffer::Buffer;
pub use channel::Channel;
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use tcp_client::TcpClient;
pub use tcp_connection::TcpConnection;
pub use tcp_server::{ServerOptions, TcpServer};
pub use timer::TimerId;
pub use timestamp::Timestamp;
