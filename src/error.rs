//! Error kinds recognized by the reactor core (see spec §7).
//!
//! Misuse (wrong-thread access, double loop per thread, double
//! registration) is a programmer error and aborts the process rather than
//! returning a `Result` — see [`crate::event_loop::EventLoop`]'s
//! thread-assertion helpers. Everything here is the remaining class:
//! failures that can legitimately happen at runtime because of the
//! environment (syscalls failing, fds exhausted).

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to create {0}: {1}")]
    Syscall(&'static str, io::Error),

    #[error("file descriptor limit reached")]
    Exhausted,
}

impl Error {
    pub fn syscall(what: &'static str) -> Self {
        Error::Syscall(what, io::Error::last_os_error())
    }
}
