//! Completion-based reactor over io_uring (Linux only, feature-gated).
//!
//! Each operation becomes one submission queue entry carrying the packed
//! completion id as its user token. The driver waits on the ring with a
//! timeout derived from the earliest pending deadline, harvests
//! completions, and wakes the owning tasks. Deadlines and `sleep` share
//! the timer queue: an expired I/O deadline submits `AsyncCancel` by
//! token and the operation resolves as timed out once the kernel
//! confirms with its CQE, so buffers are never released while the kernel
//! may still touch them.
//!
//! NOTE: this module uses unsafe to push SQEs. The safety invariants are
//! documented inline.

#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod imp {
    #![allow(unsafe_code)]

    use std::cell::RefCell;
    use std::io;
    use std::panic::Location;
    use std::ptr;
    use std::rc::Rc;
    use std::task::{Poll, Waker};
    use std::time::Instant;

    use io_uring::{opcode, squeue, types, IoUring};

    use crate::completion::{Completion, CompletionId, CompletionTable, OpValue, Signal};
    use crate::error::{Error, Result};
    use crate::exec::Executor;
    use crate::iop::OpState;
    use crate::sys;
    use crate::timer::TimerQueue;
    use crate::warden::reactor::Reactor;
    use crate::warden::Warden;

    const DEFAULT_ENTRIES: u32 = 256;
    /// Token for AsyncCancel entries; their own CQEs carry no operation.
    const CANCEL_TOKEN: u64 = u64::MAX;

    /// How a CQE result code maps onto an operation value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum OpClass {
        /// read/write: non-negative result is a byte count.
        Bytes,
        /// accept: non-negative result is a descriptor.
        NewFd,
        /// connect, readiness waits: non-negative result is unit.
        Unit,
        /// sleep: no submission at all, resolved by the timer queue.
        TimerOnly,
    }

    /// Per-operation bookkeeping for the submission lifecycle.
    struct Submission {
        class: OpClass,
        /// Stable storage for the peer address of a connect; the kernel
        /// holds a pointer into this box until the CQE arrives.
        addr: Option<Box<(libc::sockaddr_storage, libc::socklen_t)>>,
        /// True while the kernel owns an SQE for this operation.
        inflight: bool,
        /// Deadline fired; resolve as timed out when the CQE lands.
        cancel_requested: bool,
    }

    struct UringState {
        completions: CompletionTable<Submission>,
        timers: TimerQueue,
    }

    /// Completion-based warden.
    ///
    /// Single-threaded: one driver thread owns the warden and every
    /// completion created through it. Tasks share it via `Rc`.
    pub struct UringWarden {
        ring: RefCell<IoUring>,
        state: RefCell<UringState>,
        executor: Rc<Executor>,
    }

    impl UringWarden {
        /// Creates a warden with the default submission queue size.
        #[track_caller]
        pub fn new() -> Result<Self> {
            Self::with_entries(DEFAULT_ENTRIES)
        }

        /// Creates a warden with a custom submission queue size.
        #[track_caller]
        pub fn with_entries(entries: u32) -> Result<Self> {
            let location = Location::caller();
            let ring =
                IoUring::new(entries).map_err(|err| Error::system("io_uring", &err, location))?;
            Ok(Self {
                ring: RefCell::new(ring),
                state: RefCell::new(UringState {
                    completions: CompletionTable::new(),
                    timers: TimerQueue::new(),
                }),
                executor: Executor::new(),
            })
        }

        /// Number of operations currently suspended on this warden.
        #[must_use]
        pub fn pending_operations(&self) -> usize {
            self.state.borrow().completions.len()
        }

        fn push_sqe(&self, entry: squeue::Entry) -> io::Result<()> {
            let mut ring = self.ring.borrow_mut();
            // SAFETY: every buffer or address an entry points into stays
            // alive until the entry's CQE is harvested; the owning
            // handle's drop path drains the ring before releasing them.
            unsafe {
                if ring.submission().push(&entry).is_err() {
                    ring.submit()?;
                    ring.submission().push(&entry).map_err(|_| {
                        io::Error::new(io::ErrorKind::WouldBlock, "submission queue full")
                    })?;
                }
            }
            ring.submit()?;
            Ok(())
        }

        /// Drains available CQEs, delivering signals and wakes. Returns
        /// true if a CQE for `target` was seen.
        fn harvest(&self, target: Option<CompletionId>) -> bool {
            let completed: Vec<(u64, i32)> = {
                let mut ring = self.ring.borrow_mut();
                ring.completion().map(|cqe| (cqe.user_data(), cqe.result())).collect()
            };
            let mut seen_target = false;
            let state = &mut *self.state.borrow_mut();
            for (user_data, result) in completed {
                if user_data == CANCEL_TOKEN {
                    continue;
                }
                let id = CompletionId::from_u64(user_data);
                if target == Some(id) {
                    seen_target = true;
                }
                let Some(completion) = state.completions.get_mut(id) else {
                    tracing::trace!(user_data, "unattributed completion discarded");
                    continue;
                };
                completion.extra.inflight = false;
                if target == Some(id) {
                    // Being dropped; nobody is left to signal.
                    continue;
                }
                let signal = if completion.extra.cancel_requested {
                    Signal::Expired
                } else if result < 0 {
                    Signal::Os(-result)
                } else {
                    Signal::Value(match completion.extra.class {
                        OpClass::Bytes => OpValue::Size(result as usize),
                        OpClass::NewFd => OpValue::Fd(result),
                        OpClass::Unit | OpClass::TimerOnly => OpValue::Unit,
                    })
                };
                completion.signal = Some(signal);
                completion.waker.wake_by_ref();
            }
            seen_target
        }

        fn release(state: &mut UringState, id: CompletionId) {
            if let Some(completion) = state.completions.remove(id) {
                if let Some(key) = completion.timer {
                    state.timers.cancel(&key);
                }
            }
        }

        fn start(
            &self,
            op: &mut OpState<'_>,
            lease: &mut Option<CompletionId>,
            deadline: Option<Instant>,
            waker: &Waker,
            location: &'static Location<'static>,
        ) -> Poll<Result<OpValue>> {
            if let OpState::Sleep { duration } = op {
                let state = &mut *self.state.borrow_mut();
                let mut completion = Completion::new(
                    waker.clone(),
                    Submission {
                        class: OpClass::TimerOnly,
                        addr: None,
                        inflight: false,
                        cancel_requested: false,
                    },
                );
                completion.expiry_completes = true;
                let id = state.completions.insert(completion);
                let key = state.timers.insert(Instant::now() + *duration, id);
                if let Some(completion) = state.completions.get_mut(id) {
                    completion.timer = Some(key);
                }
                *lease = Some(id);
                return Poll::Pending;
            }

            let state = &mut *self.state.borrow_mut();
            let class = match op {
                OpState::Read { .. } | OpState::Write { .. } => OpClass::Bytes,
                OpState::Accept { .. } => OpClass::NewFd,
                _ => OpClass::Unit,
            };
            // The connect address must outlive the submission; box it and
            // let the completion slot own it.
            let mut addr_ptr = ptr::null::<libc::sockaddr>();
            let mut addr_len: libc::socklen_t = 0;
            let addr = if let OpState::Connect { addr, .. } = op {
                let boxed = Box::new(sys::to_sockaddr(addr));
                addr_ptr = ptr::addr_of!(boxed.0).cast::<libc::sockaddr>();
                addr_len = boxed.1;
                Some(boxed)
            } else {
                None
            };
            let id = state.completions.insert(Completion::new(
                waker.clone(),
                Submission {
                    class,
                    addr,
                    inflight: true,
                    cancel_requested: false,
                },
            ));
            let entry = match op {
                OpState::Read { fd, buf } => {
                    opcode::Read::new(types::Fd(*fd), buf.as_mut_ptr(), buf.len() as u32).build()
                }
                OpState::Write { fd, buf } => {
                    opcode::Write::new(types::Fd(*fd), buf.as_ptr(), buf.len() as u32).build()
                }
                OpState::Accept { fd } => {
                    opcode::Accept::new(types::Fd(*fd), ptr::null_mut(), ptr::null_mut())
                        .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
                        .build()
                }
                OpState::Connect { fd, .. } => {
                    opcode::Connect::new(types::Fd(*fd), addr_ptr, addr_len).build()
                }
                OpState::ReadReady { fd } => {
                    opcode::PollAdd::new(types::Fd(*fd), libc::POLLIN as u32).build()
                }
                OpState::WriteReady { fd } => {
                    opcode::PollAdd::new(types::Fd(*fd), libc::POLLOUT as u32).build()
                }
                OpState::Sleep { .. } => unreachable!("handled above"),
            }
            .user_data(id.as_u64());

            if let Err(err) = self.push_sqe(entry) {
                state.completions.remove(id);
                return Poll::Ready(Err(Error::system(op.name(), &err, location)));
            }
            if let Some(at) = deadline {
                let key = state.timers.insert(at, id);
                if let Some(completion) = state.completions.get_mut(id) {
                    completion.timer = Some(key);
                }
            }
            tracing::trace!(op = op.name(), "submitted");
            *lease = Some(id);
            Poll::Pending
        }

        fn resume(
            &self,
            id: CompletionId,
            op: &mut OpState<'_>,
            lease: &mut Option<CompletionId>,
            waker: &Waker,
            location: &'static Location<'static>,
        ) -> Poll<Result<OpValue>> {
            let signal = {
                let state = &mut *self.state.borrow_mut();
                let Some(completion) = state.completions.get_mut(id) else {
                    *lease = None;
                    return Poll::Ready(Err(Error::logic(op.name(), location)));
                };
                match completion.signal.take() {
                    None => {
                        if !completion.waker.will_wake(waker) {
                            completion.waker = waker.clone();
                        }
                        return Poll::Pending;
                    }
                    Some(signal) => signal,
                }
            };
            let state = &mut *self.state.borrow_mut();
            Self::release(state, id);
            *lease = None;
            match signal {
                Signal::Value(value) => Poll::Ready(Ok(value)),
                Signal::Os(code) => {
                    Poll::Ready(Err(Error::system_code(op.name(), code, location)))
                }
                Signal::Expired => Poll::Ready(Err(Error::timed_out(op.name(), location))),
                Signal::Retry => unreachable!("completion reactor never signals a retry"),
            }
        }
    }

    impl Reactor for UringWarden {
        fn poll_op(
            &self,
            op: &mut OpState<'_>,
            lease: &mut Option<CompletionId>,
            deadline: Option<Instant>,
            waker: &Waker,
            location: &'static Location<'static>,
        ) -> Poll<Result<OpValue>> {
            match *lease {
                None => self.start(op, lease, deadline, waker, location),
                Some(id) => self.resume(id, op, lease, waker, location),
            }
        }

        fn cancel_op(&self, lease: CompletionId) {
            let inflight = {
                let state = &mut *self.state.borrow_mut();
                let Some(completion) = state.completions.get_mut(lease) else {
                    return;
                };
                let key = completion.timer.take();
                let inflight = completion.extra.inflight;
                if let Some(key) = key {
                    state.timers.cancel(&key);
                }
                inflight
            };
            if !inflight {
                self.state.borrow_mut().completions.remove(lease);
                return;
            }
            // The kernel may still reference buffers owned by the handle
            // being dropped. Ask it to abandon the operation, then drain
            // until the operation's own CQE arrives; only after that is
            // it sound to free the slot and let the buffers go.
            let cancel = opcode::AsyncCancel::new(lease.as_u64())
                .build()
                .user_data(CANCEL_TOKEN);
            if let Err(err) = self.push_sqe(cancel) {
                tracing::warn!(error = %err, "cancel submission failed; awaiting natural completion");
            }
            loop {
                if self.harvest(Some(lease)) {
                    break;
                }
                let wait = {
                    let ring = self.ring.borrow_mut();
                    ring.submitter().submit_and_wait(1).map(|_| ())
                };
                match wait {
                    Ok(()) => {}
                    Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "wait for cancelled operation failed");
                        break;
                    }
                }
            }
            self.state.borrow_mut().completions.remove(lease);
            tracing::trace!("operation cancelled");
        }

        fn executor(&self) -> &Rc<Executor> {
            &self.executor
        }

        fn turn(&self) {
            let timeout = {
                let state = self.state.borrow();
                state
                    .timers
                    .next_deadline()
                    .map(|at| at.saturating_duration_since(Instant::now()))
            };
            let wait = {
                let ring = self.ring.borrow_mut();
                match timeout {
                    None => ring.submitter().submit_and_wait(1).map(|_| ()),
                    Some(t) if t.is_zero() => ring.submitter().submit().map(|_| ()),
                    Some(t) => {
                        let ts = types::Timespec::new()
                            .sec(t.as_secs())
                            .nsec(t.subsec_nanos());
                        let args = types::SubmitArgs::new().timespec(&ts);
                        ring.submitter().submit_with_args(1, &args).map(|_| ())
                    }
                }
            };
            if let Err(err) = wait {
                match err.raw_os_error() {
                    Some(libc::ETIME | libc::EINTR | libc::EBUSY) => {}
                    _ => tracing::warn!(error = %err, "ring wait failed"),
                }
            }
            self.harvest(None);

            // Deadlines: completed operations just lose their timer;
            // in-flight ones get a kernel cancel and resolve when their
            // CQE lands.
            let now = Instant::now();
            let mut cancels = Vec::new();
            {
                let state = &mut *self.state.borrow_mut();
                loop {
                    let Some((_key, id)) = state.timers.pop_due(now) else {
                        break;
                    };
                    let Some(completion) = state.completions.get_mut(id) else {
                        continue;
                    };
                    completion.timer = None;
                    if completion.signal.is_some() {
                        continue;
                    }
                    if completion.extra.inflight {
                        completion.extra.cancel_requested = true;
                        cancels.push(id.as_u64());
                    } else {
                        completion.signal = Some(if completion.expiry_completes {
                            Signal::Value(OpValue::Unit)
                        } else {
                            Signal::Expired
                        });
                        completion.waker.wake_by_ref();
                    }
                }
            }
            for token in cancels {
                let entry = opcode::AsyncCancel::new(token).build().user_data(CANCEL_TOKEN);
                if let Err(err) = self.push_sqe(entry) {
                    tracing::warn!(error = %err, "timeout cancel submission failed");
                }
            }
        }
    }

    impl Warden for UringWarden {}

    impl std::fmt::Debug for UringWarden {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let state = self.state.borrow();
            f.debug_struct("UringWarden")
                .field("pending_operations", &state.completions.len())
                .field("timers", &state.timers.len())
                .finish_non_exhaustive()
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "io-uring")))]
mod imp {
    use std::panic::Location;
    use std::rc::Rc;
    use std::task::{Poll, Waker};
    use std::time::Instant;

    use crate::completion::{CompletionId, OpValue};
    use crate::error::{Error, Result};
    use crate::exec::Executor;
    use crate::iop::OpState;
    use crate::warden::reactor::Reactor;
    use crate::warden::Warden;

    /// Stub completion warden for platforms or builds without io_uring.
    ///
    /// The constructor always fails; the type exists so callers can gate
    /// on the result instead of on cfg.
    pub struct UringWarden {
        executor: Rc<Executor>,
    }

    impl std::fmt::Debug for UringWarden {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("UringWarden").finish_non_exhaustive()
        }
    }

    impl UringWarden {
        /// Always fails: io_uring requires Linux and the `io-uring`
        /// feature.
        #[track_caller]
        pub fn new() -> Result<Self> {
            Err(Error::system_code(
                "io_uring",
                libc::ENOSYS,
                Location::caller(),
            ))
        }

        /// Always fails: io_uring requires Linux and the `io-uring`
        /// feature.
        #[track_caller]
        pub fn with_entries(_entries: u32) -> Result<Self> {
            Self::new()
        }

        /// Always zero on the stub.
        #[must_use]
        pub fn pending_operations(&self) -> usize {
            0
        }
    }

    impl Reactor for UringWarden {
        fn poll_op(
            &self,
            op: &mut OpState<'_>,
            _lease: &mut Option<CompletionId>,
            _deadline: Option<Instant>,
            _waker: &Waker,
            location: &'static Location<'static>,
        ) -> Poll<Result<OpValue>> {
            Poll::Ready(Err(Error::system_code(op.name(), libc::ENOSYS, location)))
        }

        fn cancel_op(&self, _lease: CompletionId) {}

        fn executor(&self) -> &Rc<Executor> {
            &self.executor
        }

        fn turn(&self) {}
    }

    impl Warden for UringWarden {}
}

pub use imp::UringWarden;
