//! Back-end A: a dense array of `pollfd`s polled with `libc::poll`,
//! level-triggered. Temporary disinterest (interest mask set to none while
//! still registered) is encoded by storing the bitwise-complement of the
//! real fd in the array slot; the real fd stays on the channel itself.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::error;

use crate::channel::{Channel, PollerTag};
use crate::error::{Error, Result};
use crate::timestamp::Timestamp;

use super::Poller;

pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl PollPoller {
    pub fn new() -> Self {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, num_events: usize, active_channels: &mut Vec<Rc<Channel>>) {
        let mut found = 0;
        for pfd in &self.pollfds {
            if found >= num_events {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            found += 1;
            let real_fd = if pfd.fd >= 0 { pfd.fd } else { !pfd.fd };
            if let Some(channel) = self.channels.get(&real_fd) {
                channel.set_revents(pfd.revents);
                active_channels.push(channel.clone());
            }
        }
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Result<Timestamp> {
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Timestamp::now();

        if num_events < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("PollPoller::poll() {err}");
            }
            return Ok(now);
        }

        if num_events > 0 {
            self.fill_active_channels(num_events as usize, active_channels);
        }
        Ok(now)
    }

    fn update(&mut self, channel: &Rc<Channel>) -> Result<()> {
        let fd = channel.fd();
        match channel.tag() {
            PollerTag::New => {
                let index = self.pollfds.len() as i32;
                self.pollfds.push(libc::pollfd {
                    fd,
                    events: channel.events(),
                    revents: 0,
                });
                self.channels.insert(fd, channel.clone());
                channel.set_tag(PollerTag::Added(index));
            }
            PollerTag::Added(index) => {
                let pfd = &mut self.pollfds[index as usize];
                debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
                pfd.fd = fd;
                pfd.events = channel.events();
                pfd.revents = 0;
                if channel.is_none_event() {
                    // Temporary disinterest: keep the slot but make poll(2)
                    // ignore it, without forgetting the real fd.
                    pfd.fd = -fd - 1;
                }
            }
            PollerTag::Deleted => unreachable!("poll poller never tags Deleted"),
        }
        Ok(())
    }

    fn remove(&mut self, channel: &Rc<Channel>) -> Result<()> {
        let fd = channel.fd();
        let index = match channel.tag() {
            PollerTag::Added(index) => index as usize,
            _ => return Ok(()),
        };

        debug_assert_eq!(self.channels.get(&fd).map(|c| c.fd()), Some(fd));

        let last_index = self.pollfds.len() - 1;
        if index != last_index {
            // Swap-with-last before popping; fix up the swapped channel's
            // recorded index.
            self.pollfds.swap(index, last_index);
            let moved_fd = {
                let moved = self.pollfds[index];
                if moved.fd >= 0 {
                    moved.fd
                } else {
                    !moved.fd
                }
            };
            if let Some(moved_channel) = self.channels.get(&moved_fd) {
                moved_channel.set_tag(PollerTag::Added(index as i32));
            }
        }
        self.pollfds.pop();
        self.channels.remove(&fd);
        channel.set_tag(PollerTag::New);
        Ok(())
    }

    fn has(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
