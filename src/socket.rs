//! Non-blocking socket primitives, built on raw `libc` calls since no
//! crate in the stack gives us non-blocking create/bind/listen/accept with
//! exactly the close-on-exec semantics the channel layer assumes.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Runs a libc call, turning a `-1` return into an `io::Error` tagged with
/// the call site (mirrors the `syscall!` macro pattern used throughout the
/// raw-epoll examples in this corpus).
macro_rules! syscall {
    ($name:ident ( $($arg:expr),* $(,)* )) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$name($($arg),*) };
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Creates a non-blocking, close-on-exec TCP socket for the address family
/// implied by `addr`.
pub fn create_nonblocking_socket(addr: &SocketAddr) -> Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))
    .map_err(|_| Error::syscall("socket"))?;
    Ok(fd)
}

pub fn set_reuse_addr(fd: RawFd, on: bool) -> Result<()> {
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_reuse_port(fd: RawFd, on: bool) -> Result<()> {
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> Result<()> {
    set_int_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub fn set_keep_alive(fd: RawFd, on: bool) -> Result<()> {
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

fn set_int_option(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> Result<()> {
    let value: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map_err(|_| Error::syscall("setsockopt"))?;
    Ok(())
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (raw_addr, len) = sockaddr_from(addr);
    syscall!(bind(fd, &raw_addr as *const _ as *const libc::sockaddr, len))
        .map_err(|_| Error::syscall("bind"))?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    syscall!(listen(fd, backlog)).map_err(|_| Error::syscall("listen"))?;
    Ok(())
}

/// Accepts one pending connection. Returns `Ok(None)` for `EAGAIN`/
/// `EWOULDBLOCK` (no pending connection); any other error, including
/// `EMFILE`/`ENFILE`, is returned so the acceptor can apply its reserve-fd
/// dance.
pub fn accept(fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let conn_fd = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if conn_fd == -1 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(None),
            _ => Err(err),
        };
    }

    let peer = sockaddr_to_std(&storage)?;
    Ok(Some((conn_fd, peer)))
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_std(&storage)
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_std(&storage)
}

/// Half-closes the write side. Lets the peer see EOF while we keep reading.
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOTCONN) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Reads and clears the socket's pending `SO_ERROR`, the standard way to
/// learn whether a non-blocking `connect()` that reported writable
/// readiness actually succeeded.
pub fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        );
    }
    err
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Opens a throwaway fd to `/dev/null`, used by the acceptor as a reserve
/// it can close to free one fd slot when `accept` hits `EMFILE`.
pub fn open_reserve_fd() -> io::Result<RawFd> {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn create_bind_listen_loopback() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let fd = create_nonblocking_socket(&addr).expect("socket");
        set_reuse_addr(fd, true).expect("reuseaddr");
        bind(fd, &addr).expect("bind");
        listen(fd, 16).expect("listen");

        let bound = local_addr(fd).expect("local_addr");
        assert_eq!(bound.ip(), std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(bound.port(), 0);

        close(fd);
    }

    #[test]
    fn accept_on_empty_listener_is_would_block() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let fd = create_nonblocking_socket(&addr).expect("socket");
        bind(fd, &addr).expect("bind");
        listen(fd, 16).expect("listen");

        let result = accept(fd).expect("accept should not error");
        assert!(result.is_none());

        close(fd);
    }
}
