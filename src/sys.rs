//! Thin wrappers over the POSIX calls the wardens drive.
//!
//! All raw syscall use for the readiness path lives here. Each wrapper
//! returns `io::Result`, leaving errno classification (would-block,
//! in-progress, hard error) to the reactor that issued the call.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr;

/// Creates a socket that is non-blocking and close-on-exec from birth.
pub(crate) fn socket(domain: i32, socket_type: i32, protocol: i32) -> io::Result<RawFd> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: plain syscall, no pointers involved.
        let fd = unsafe {
            libc::socket(
                domain,
                socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
    #[cfg(not(target_os = "linux"))]
    {
        // SAFETY: plain syscall, no pointers involved.
        let fd = unsafe { libc::socket(domain, socket_type, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Err(err) = set_nonblocking(fd).and_then(|()| set_cloexec(fd)) {
            close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the pointer and length describe a live, exclusively borrowed
    // buffer for the duration of the call.
    let bytes = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    if bytes < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(bytes as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: the pointer and length describe a live borrowed buffer for
    // the duration of the call.
    let bytes = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
    if bytes < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(bytes as usize)
}

/// Accepts one connection; the returned descriptor is non-blocking and
/// close-on-exec.
pub(crate) fn accept(fd: RawFd) -> io::Result<RawFd> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: null address out-parameters are permitted by accept4.
        let conn = unsafe {
            libc::accept4(
                fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(conn)
    }
    #[cfg(not(target_os = "linux"))]
    {
        // SAFETY: null address out-parameters are permitted by accept.
        let conn = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Err(err) = set_nonblocking(conn).and_then(|()| set_cloexec(conn)) {
            close(conn);
            return Err(err);
        }
        Ok(conn)
    }
}

pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    // SAFETY: storage is a fully initialized sockaddr of the advertised
    // length, alive for the duration of the call.
    let rc = unsafe {
        libc::connect(
            fd,
            ptr::addr_of!(storage).cast::<libc::sockaddr>(),
            len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads and clears the pending socket error after an asynchronous connect.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: the out-parameters point at locals of the advertised size.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            ptr::addr_of_mut!(err).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Closes a descriptor, ignoring the result; there is no useful recovery
/// from a failed close.
pub(crate) fn close(fd: RawFd) {
    // SAFETY: plain syscall; the caller guarantees exclusive ownership.
    let _ = unsafe { libc::close(fd) };
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl with integer arguments only.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl with integer arguments only.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Converts a socket address into raw sockaddr storage plus its length.
pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is valid when zeroed; the relevant prefix
    // is overwritten below.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: all-zero sockaddr_in is a valid starting value.
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            // octets() is already network order.
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                ptr::copy_nonoverlapping(
                    ptr::addr_of!(sin).cast::<u8>(),
                    ptr::addr_of_mut!(storage).cast::<u8>(),
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: all-zero sockaddr_in6 is a valid starting value.
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                ptr::copy_nonoverlapping(
                    ptr::addr_of!(sin6).cast::<u8>(),
                    ptr::addr_of_mut!(storage).cast::<u8>(),
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
