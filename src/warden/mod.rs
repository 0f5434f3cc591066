//! The warden contract and its two reactor implementations.
//!
//! A warden owns an event loop and hands out awaitable operation handles
//! ([`Iop`]). Two interchangeable implementations exist behind the single
//! [`Warden`] trait:
//!
//! | Reactor | Strategy | Module |
//! |---------|----------|--------|
//! | [`PollWarden`] | readiness: eager syscall, retry when the fd is ready | `poll.rs` |
//! | [`UringWarden`] | completion: submit to the kernel, harvest results | `uring.rs` |
//!
//! The contract is identical from a task's point of view: same handle
//! types, same errors, same FIFO-per-descriptor/direction and
//! timer-tie-break ordering.
//!
//! # Usage
//!
//! ```ignore
//! let ward = Rc::new(PollWarden::new()?);
//! let fd = ward.create_socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
//! ward.run(async {
//!     ward.connect(&fd, addr).await?;
//!     let n = ward.read_some(&fd, &mut buf).timeout(Duration::from_secs(1)).await?;
//!     Ok::<_, Error>(n)
//! })
//! ```
//!
//! Detached tasks capture an `Rc` of their warden and are owned by a
//! [`Starter`](crate::Starter).

pub(crate) mod reactor;

mod poll;
mod uring;

pub use poll::PollWarden;
pub use uring::UringWarden;

use std::future::Future;
use std::os::fd::AsRawFd;
use std::panic::Location;
use std::pin::pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exec::{TaskHandle, ROOT_TASK};
use crate::fd::FdHandle;
use crate::iop::{Iop, OpState};
use crate::sys;

/// The reactor contract: time, I/O, and socket operations plus the
/// top-level driver.
///
/// Implemented by [`PollWarden`] and [`UringWarden`]; not implementable
/// outside this crate. All operations capture their call site for error
/// diagnostics and return an [`Iop`] that registers nothing until first
/// polled and cancels itself when dropped.
pub trait Warden: reactor::Reactor {
    /// Suspends the calling task for at least `duration`.
    ///
    /// `sleep(Duration::ZERO)` still suspends and resumes on the next
    /// driver iteration.
    #[track_caller]
    fn sleep(&self, duration: Duration) -> Iop<'_, ()>
    where
        Self: Sized,
    {
        Iop::new(self, OpState::Sleep { duration }, Location::caller())
    }

    /// Reads into `buf`, resolving with the byte count once at least one
    /// byte is available. Zero means the peer closed cleanly.
    #[track_caller]
    fn read_some<'a>(&'a self, fd: &impl AsRawFd, buf: &'a mut [u8]) -> Iop<'a, usize>
    where
        Self: Sized,
    {
        Iop::new(
            self,
            OpState::Read {
                fd: fd.as_raw_fd(),
                buf,
            },
            Location::caller(),
        )
    }

    /// Writes from `buf`, resolving with the number of bytes the kernel
    /// took. Partial writes are normal; callers loop.
    #[track_caller]
    fn write_some<'a>(&'a self, fd: &impl AsRawFd, buf: &'a [u8]) -> Iop<'a, usize>
    where
        Self: Sized,
    {
        Iop::new(
            self,
            OpState::Write {
                fd: fd.as_raw_fd(),
                buf,
            },
            Location::caller(),
        )
    }

    /// Accepts one connection on a listening descriptor, resolving with
    /// the raw accepted fd (non-blocking, close-on-exec). Most callers
    /// want [`AcceptStream`](crate::AcceptStream), which owns the result.
    #[track_caller]
    fn accept(&self, fd: &impl AsRawFd) -> Iop<'_, std::os::fd::RawFd>
    where
        Self: Sized,
    {
        Iop::new(
            self,
            OpState::Accept {
                fd: fd.as_raw_fd(),
            },
            Location::caller(),
        )
    }

    /// Connects a socket to `addr`, resolving once the connection is
    /// established.
    #[track_caller]
    fn connect(&self, fd: &impl AsRawFd, addr: std::net::SocketAddr) -> Iop<'_, ()>
    where
        Self: Sized,
    {
        Iop::new(
            self,
            OpState::Connect {
                fd: fd.as_raw_fd(),
                addr,
            },
            Location::caller(),
        )
    }

    /// Resolves once the descriptor is ready for reading.
    #[track_caller]
    fn read_ready(&self, fd: &impl AsRawFd) -> Iop<'_, ()>
    where
        Self: Sized,
    {
        Iop::new(
            self,
            OpState::ReadReady {
                fd: fd.as_raw_fd(),
            },
            Location::caller(),
        )
    }

    /// Resolves once the descriptor is ready for writing.
    #[track_caller]
    fn write_ready(&self, fd: &impl AsRawFd) -> Iop<'_, ()>
    where
        Self: Sized,
    {
        Iop::new(
            self,
            OpState::WriteReady {
                fd: fd.as_raw_fd(),
            },
            Location::caller(),
        )
    }

    /// Creates a socket. The descriptor comes back non-blocking and
    /// close-on-exec, ready for the readiness reactor's eager-syscall
    /// discipline.
    #[track_caller]
    fn create_socket(&self, domain: i32, socket_type: i32, protocol: i32) -> Result<FdHandle>
    where
        Self: Sized,
    {
        let location = Location::caller();
        sys::socket(domain, socket_type, protocol)
            .map(FdHandle::new)
            .map_err(|err| Error::system("socket", &err, location))
    }

    /// Launches a detached task, polling it to its first suspension
    /// point. Used by [`Starter`](crate::Starter); dropping the returned
    /// handle aborts the task.
    fn spawn(&self, future: std::pin::Pin<Box<dyn Future<Output = ()> + 'static>>) -> TaskHandle
    where
        Self: Sized,
    {
        self.executor().spawn(future)
    }

    /// Drives the event loop until `root` completes, returning its value.
    ///
    /// Detached tasks are polled as they wake; within one descriptor and
    /// direction, operations resume in submission order. When the root
    /// completes, `run` returns immediately; tasks still running remain
    /// owned by their handles.
    fn run<T>(&self, root: impl Future<Output = T>) -> T
    where
        Self: Sized,
    {
        let executor = self.executor().clone();
        let mut root = pin!(root);
        let waker = executor.waker(ROOT_TASK);
        let mut cx = Context::from_waker(&waker);
        executor.schedule(ROOT_TASK);
        loop {
            while let Some(id) = executor.dequeue() {
                if id == ROOT_TASK {
                    if let Poll::Ready(value) = root.as_mut().poll(&mut cx) {
                        return value;
                    }
                } else {
                    executor.poll_task(id);
                }
            }
            self.turn();
        }
    }
}
