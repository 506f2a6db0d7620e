//! Raw socket helpers: address conversion, listener setup, socket options.
//!
//! Everything here is a thin libc wrapper. Fds come back as `OwnedFd` so
//! they close on drop.

use iocring_core::error::{Error, Result, SocketError};

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// Write `addr` into `storage`, returning the length to pass to the kernel.
pub(crate) fn to_sockaddr(addr: &SocketAddr, storage: &mut libc::sockaddr_storage) -> libc::socklen_t {
    *storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write(storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Read a socket address back out of `storage`. `None` for other families.
pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn family(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// A fresh blocking TCP socket for `addr`'s family.
pub(crate) fn new_stream_socket(addr: &SocketAddr) -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(family(addr), libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(SocketError::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(SocketError::last_os_error().into());
    }
    Ok(())
}

/// Create, bind and listen. The listener stays in blocking mode.
pub(crate) fn bind_listener(addr: &SocketAddr, backlog: i32) -> Result<OwnedFd> {
    let fd = new_stream_socket(addr)?;
    let raw = std::os::unix::io::AsRawFd::as_raw_fd(&fd);
    set_int_opt(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = to_sockaddr(addr, &mut storage);
    let rc = unsafe { libc::bind(raw, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        return Err(SocketError::last_os_error().into());
    }
    if unsafe { libc::listen(raw, backlog) } < 0 {
        return Err(SocketError::last_os_error().into());
    }
    Ok(fd)
}

pub(crate) fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(SocketError::last_os_error().into());
    }
    from_sockaddr(&storage, len).ok_or(Error::InvalidArgument("not an inet socket"))
}

pub(crate) fn peer_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(SocketError::last_os_error().into());
    }
    from_sockaddr(&storage, len).ok_or(Error::InvalidArgument("not an inet socket"))
}

/// Set or clear `O_NONBLOCK`, returning the previous flags.
pub(crate) fn set_nonblocking(fd: RawFd, on: bool) -> std::result::Result<libc::c_int, SocketError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(SocketError::last_os_error());
    }
    let new = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    if new != flags && unsafe { libc::fcntl(fd, libc::F_SETFL, new) } < 0 {
        return Err(SocketError::last_os_error());
    }
    Ok(flags)
}

/// Restore flags saved by `set_nonblocking`.
pub(crate) fn restore_flags(fd: RawFd, flags: libc::c_int) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFL, flags);
    }
}

/// Fetch and clear the pending `SO_ERROR`.
pub(crate) fn take_socket_error(fd: RawFd) -> std::result::Result<(), SocketError> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(SocketError::last_os_error());
    }
    match err {
        0 => Ok(()),
        code => Err(SocketError::new(code)),
    }
}

pub(crate) fn shutdown(fd: RawFd, how: Shutdown) -> Result<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    if unsafe { libc::shutdown(fd, how) } < 0 {
        return Err(SocketError::last_os_error().into());
    }
    Ok(())
}
