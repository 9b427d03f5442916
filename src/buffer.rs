//! Append-only byte buffer with scatter-read support. `read_fd` combines
//! the buffer's own writable tail with a stack-allocated overflow region
//! in a single two-iovec `readv`, so one socket readiness event can drain
//! an arbitrarily large kernel receive queue without pre-sizing the
//! buffer.

use std::io;
use std::os::unix::io::RawFd;

const INITIAL_SIZE: usize = 1024;
const OVERFLOW_SIZE: usize = 65536;

/// A growable byte buffer that is only ever appended to and consumed from
/// the front; callers own draining consumed bytes via [`Buffer::retrieve`].
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            data: vec![0u8; INITIAL_SIZE],
            read_index: 0,
        }
    }

    pub fn readable_len(&self) -> usize {
        self.data.len() - self.read_index
    }

    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_index..]
    }

    /// Appends raw bytes (used by tests and by callers that already have
    /// the data, e.g. write-side queueing).
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drops the first `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        let len = len.min(self.readable_len());
        self.read_index += len;
        if self.read_index == self.data.len() {
            self.data.clear();
            self.read_index = 0;
        }
    }

    pub fn retrieve_all(&mut self) -> Vec<u8> {
        let out = self.data[self.read_index..].to_vec();
        self.data.clear();
        self.read_index = 0;
        out
    }

    /// Reads once from `fd` into this buffer, using a stack-allocated
    /// overflow region when the buffer's own writable tail isn't enough to
    /// drain the socket in one `readv`: a small buffer plus a 64KiB
    /// overflow avoids growing the buffer needlessly on a single small
    /// message, while a large burst still drains in one syscall.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_SIZE];
        let writable_start = self.data.len();

        // Ensure there is some writable room in the primary buffer so the
        // first iovec is never empty.
        if self.data.capacity() == self.data.len() {
            self.data.reserve(INITIAL_SIZE);
        }
        let spare = self.data.spare_capacity_mut();
        let spare_len = spare.len().max(1);

        let mut iov = [
            libc::iovec {
                iov_base: spare.as_mut_ptr() as *mut libc::c_void,
                iov_len: spare_len,
            },
            libc::iovec {
                iov_base: overflow.as_mut_ptr() as *mut libc::c_void,
                iov_len: overflow.len(),
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;

        if n <= spare_len {
            unsafe { self.data.set_len(writable_start + n) };
        } else {
            unsafe { self.data.set_len(writable_start + spare_len) };
            self.data.extend_from_slice(&overflow[..n - spare_len]);
        }

        Ok(n)
    }
}
