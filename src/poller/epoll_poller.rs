//! Back-end B: a kernel `epoll` set plus an `fd -> Channel` map. The
//! channel's tag distinguishes three states -- new / added / deleted.
//! The output event buffer doubles whenever a `poll` fills it completely
//! so later polls aren't capped; it is never shrunk back down.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::error;

use crate::channel::{Channel, PollerTag};
use crate::error::{Error, Result};
use crate::timestamp::Timestamp;

use super::Poller;

const INITIAL_EVENT_LIST_SIZE: usize = 16;

pub struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::syscall("epoll_create1"));
        }
        Ok(EpollPoller {
            epoll_fd,
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Rc<Channel>) -> Result<()> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = channel.events() as u32;
        ev.u64 = channel.fd() as u64;

        let res = unsafe { libc::epoll_ctl(self.epoll_fd, op, channel.fd(), &mut ev) };
        if res < 0 {
            return Err(Error::syscall("epoll_ctl"));
        }
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Result<Timestamp> {
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        let now = Timestamp::now();

        if num_events < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("EpollPoller::poll() {err}");
            }
            return Ok(now);
        }

        let num_events = num_events as usize;
        for ev in &self.events[..num_events] {
            let fd = ev.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(ev.events as i16);
                active_channels.push(channel.clone());
            }
        }

        if num_events == self.events.len() {
            self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
        }

        Ok(now)
    }

    fn update(&mut self, channel: &Rc<Channel>) -> Result<()> {
        match channel.tag() {
            PollerTag::New | PollerTag::Deleted => {
                self.ctl(libc::EPOLL_CTL_ADD, channel)?;
                self.channels.insert(channel.fd(), channel.clone());
                channel.set_tag(PollerTag::Added(0));
            }
            PollerTag::Added(_) => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel)?;
                    channel.set_tag(PollerTag::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel)?;
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, channel: &Rc<Channel>) -> Result<()> {
        let fd = channel.fd();
        if matches!(channel.tag(), PollerTag::Added(_)) {
            self.ctl(libc::EPOLL_CTL_DEL, channel)?;
        }
        self.channels.remove(&fd);
        channel.set_tag(PollerTag::New);
        Ok(())
    }

    fn has(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;
    use std::rc::Weak;

    fn loopback_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        let server_addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(server_addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn tag_transitions_new_added_deleted() {
        let mut poller = EpollPoller::new().unwrap();
        let (client, _server) = loopback_pair();
        let fd = client.as_raw_fd();
        let channel = Channel::new(Weak::new(), fd);

        channel.enable_reading();
        poller.update(&channel).unwrap();
        assert!(matches!(channel.tag(), PollerTag::Added(_)));
        assert!(poller.has(fd));

        channel.disable_all();
        poller.update(&channel).unwrap();
        assert_eq!(channel.tag(), PollerTag::Deleted);
        assert!(poller.has(fd), "deleted from kernel set but still in map");

        poller.remove(&channel).unwrap();
        assert_eq!(channel.tag(), PollerTag::New);
        assert!(!poller.has(fd));
    }

    #[test]
    fn readable_fd_is_reported() {
        let mut poller = EpollPoller::new().unwrap();
        let (mut client, server) = loopback_pair();
        let fd = server.as_raw_fd();
        let channel = Channel::new(Weak::new(), fd);
        channel.enable_reading();
        poller.update(&channel).unwrap();

        use std::io::Write;
        client.write_all(b"hi").unwrap();

        let mut active = Vec::new();
        poller.poll(1000, &mut active).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].fd(), fd);
    }

    #[test]
    fn event_buffer_grows_on_full_fill() {
        let mut poller = EpollPoller::new().unwrap();
        assert_eq!(poller.events.len(), INITIAL_EVENT_LIST_SIZE);

        let mut conns = Vec::new();
        for _ in 0..INITIAL_EVENT_LIST_SIZE + 1 {
            let (mut client, server) = loopback_pair();
            use std::io::Write;
            client.write_all(b"x").unwrap();
            let fd = server.as_raw_fd();
            let channel = Channel::new(Weak::new(), fd);
            channel.enable_reading();
            poller.update(&channel).unwrap();
            conns.push((client, server, channel));
        }

        let mut active = Vec::new();
        poller.poll(1000, &mut active).unwrap();
        assert!(poller.events.len() > INITIAL_EVENT_LIST_SIZE);
    }
}
