//! Scoped handles for in-flight operations.
//!
//! Every warden operation returns an [`Iop`]: a future that resolves with
//! the operation's result. The handle owns the operation for its whole
//! life. Awaiting it suspends the task; dropping it before completion
//! cancels the operation and unregisters every trace of it from the
//! owning warden, so no readiness event or kernel completion can reach a
//! dead waiter.
//!
//! Deadlines attach to the handle before the first poll:
//!
//! ```ignore
//! let n = ward.write_some(&fd, &buf).timeout(Duration::from_millis(10)).await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::panic::Location;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::completion::CompletionId;
use crate::error::Result;
use crate::warden::reactor::Reactor;

/// Description of one operation, including any buffers it borrows.
pub(crate) enum OpState<'a> {
    Sleep { duration: Duration },
    Read { fd: RawFd, buf: &'a mut [u8] },
    Write { fd: RawFd, buf: &'a [u8] },
    Accept { fd: RawFd },
    Connect { fd: RawFd, addr: SocketAddr },
    ReadReady { fd: RawFd },
    WriteReady { fd: RawFd },
}

impl OpState<'_> {
    /// Operation name used in errors and diagnostics.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Sleep { .. } => "sleep",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Accept { .. } => "accept",
            Self::Connect { .. } => "connect",
            Self::ReadReady { .. } => "read_ready",
            Self::WriteReady { .. } => "write_ready",
        }
    }

    /// The descriptor the operation acts on, if any.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        match self {
            Self::Sleep { .. } => None,
            Self::Read { fd, .. }
            | Self::Write { fd, .. }
            | Self::Accept { fd }
            | Self::Connect { fd, .. }
            | Self::ReadReady { fd }
            | Self::WriteReady { fd } => Some(*fd),
        }
    }
}

mod sealed {
    use crate::completion::OpValue;

    pub trait Sealed: Sized {
        fn from_value(value: OpValue) -> Self;
    }

    impl Sealed for () {
        fn from_value(_value: OpValue) {}
    }

    impl Sealed for usize {
        fn from_value(value: OpValue) -> Self {
            match value {
                OpValue::Size(n) => n,
                other => panic!("byte-count operation resolved with {other:?}"),
            }
        }
    }

    impl Sealed for i32 {
        fn from_value(value: OpValue) -> Self {
            match value {
                OpValue::Fd(fd) => fd,
                other => panic!("descriptor operation resolved with {other:?}"),
            }
        }
    }
}

/// Result types an [`Iop`] can resolve with: `()`, `usize`, or a raw fd.
pub trait OpOutput: sealed::Sealed {}

impl OpOutput for () {}
impl OpOutput for usize {}
impl OpOutput for i32 {}

/// A scoped, awaitable in-flight operation.
///
/// Returned by every [`Warden`](crate::Warden) operation. Resolves with
/// `Ok(R)` or an [`Error`](crate::Error) carrying the failure kind and
/// the call site the operation was started from.
#[must_use = "operations do nothing unless awaited; dropping cancels"]
pub struct Iop<'a, R: OpOutput> {
    reactor: &'a (dyn Reactor + 'a),
    op: OpState<'a>,
    lease: Option<CompletionId>,
    deadline: Option<Instant>,
    location: &'static Location<'static>,
    done: bool,
    _result: PhantomData<R>,
}

impl<'a, R: OpOutput> Iop<'a, R> {
    pub(crate) fn new(
        reactor: &'a (dyn Reactor + 'a),
        op: OpState<'a>,
        location: &'static Location<'static>,
    ) -> Self {
        Self {
            reactor,
            op,
            lease: None,
            deadline: None,
            location,
            done: false,
            _result: PhantomData,
        }
    }

    /// Fails the operation with a timeout if it has not completed within
    /// `duration` of this call.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.deadline = Some(Instant::now() + duration);
        self
    }

    /// Fails the operation with a timeout if it has not completed by the
    /// absolute (monotonic) instant `at`.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    /// Overrides the recorded call site, for wrappers that issue
    /// operations on behalf of user code.
    pub(crate) fn located(mut self, location: &'static Location<'static>) -> Self {
        self.location = location;
        self
    }
}

impl<R: OpOutput + Unpin> Future for Iop<'_, R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "operation polled after completion");
        match this.reactor.poll_op(
            &mut this.op,
            &mut this.lease,
            this.deadline,
            cx.waker(),
            this.location,
        ) {
            Poll::Ready(result) => {
                this.done = true;
                debug_assert!(this.lease.is_none(), "completed op still holds its slot");
                this.lease = None;
                Poll::Ready(result.map(R::from_value))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R: OpOutput> Drop for Iop<'_, R> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.reactor.cancel_op(lease);
        }
    }
}
