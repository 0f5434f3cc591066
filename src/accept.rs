//! Lazy stream of accepted connections.

use std::os::fd::{AsRawFd, RawFd};
use std::panic::Location;

use crate::error::{ErrorKind, Result};
use crate::fd::FdHandle;
use crate::warden::Warden;

struct RawSource(RawFd);

impl AsRawFd for RawSource {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Lazy sequence of connections accepted on a listening descriptor.
///
/// Each [`next`](Self::next) call awaits one connection. The stream ends
/// (`Ok(None)`) once the listening descriptor is gone: accept reporting
/// `EBADF` or `EINVAL` means the listener was closed, which is the
/// normal way to stop serving, not an error. Any other hard error is
/// surfaced.
pub struct AcceptStream<'w, W: Warden> {
    ward: &'w W,
    fd: RawFd,
    location: &'static Location<'static>,
}

impl<'w, W: Warden> AcceptStream<'w, W> {
    /// Creates a stream over connections arriving on `listener`.
    ///
    /// The listener is not owned; the caller keeps it alive (or closes it
    /// to end the stream).
    #[track_caller]
    pub fn new(ward: &'w W, listener: &impl AsRawFd) -> Self {
        Self {
            ward,
            fd: listener.as_raw_fd(),
            location: Location::caller(),
        }
    }

    /// Awaits the next inbound connection.
    ///
    /// Accepted descriptors are non-blocking and owned by the returned
    /// handle.
    pub async fn next(&mut self) -> Result<Option<FdHandle>> {
        match self
            .ward
            .accept(&RawSource(self.fd))
            .located(self.location)
            .await
        {
            Ok(fd) => Ok(Some(FdHandle::new(fd))),
            Err(err) if listener_gone(err.kind(), err.os_error()) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn listener_gone(kind: ErrorKind, code: Option<i32>) -> bool {
    kind == ErrorKind::System && matches!(code, Some(libc::EBADF | libc::EINVAL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_listener_codes_end_the_stream() {
        assert!(listener_gone(ErrorKind::System, Some(libc::EBADF)));
        assert!(listener_gone(ErrorKind::System, Some(libc::EINVAL)));
        assert!(!listener_gone(ErrorKind::System, Some(libc::EMFILE)));
        assert!(!listener_gone(ErrorKind::TimedOut, Some(libc::EBADF)));
    }
}
