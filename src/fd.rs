//! Owning handle for a kernel file descriptor.

#![allow(unsafe_code)]

use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::panic::Location;

use crate::error::{Error, Result};
use crate::sys;

/// Owning handle for a file descriptor; the descriptor is closed on drop.
///
/// At most one `FdHandle` refers to a given live descriptor: the type is
/// move-only and [`into_raw`](Self::into_raw) is the only way to give the
/// descriptor up without closing it.
pub struct FdHandle {
    fd: RawFd,
}

impl FdHandle {
    pub(crate) fn new(fd: RawFd) -> Self {
        debug_assert!(fd >= 0, "descriptor must be valid");
        Self { fd }
    }

    /// Returns the raw descriptor without giving up ownership.
    #[must_use]
    pub const fn raw(&self) -> RawFd {
        self.fd
    }

    /// Releases ownership of the descriptor without closing it.
    #[must_use]
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }

    /// Switches the descriptor into non-blocking mode.
    #[track_caller]
    pub fn set_nonblocking(&self) -> Result<()> {
        sys::set_nonblocking(self.fd)
            .map_err(|err| Error::system("fcntl", &err, Location::caller()))
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        sys::close(self.fd);
    }
}

impl AsRawFd for FdHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for FdHandle {
    /// # Safety
    ///
    /// The descriptor must be open and owned by no other handle.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::new(fd)
    }
}

impl IntoRawFd for FdHandle {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw()
    }
}

impl fmt::Debug for FdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FdHandle").field(&self.fd).finish()
    }
}
