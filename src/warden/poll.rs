//! Readiness-based reactor.
//!
//! Operations try their syscall eagerly. On would-block the waiter is
//! parked in a per-descriptor FIFO queue and the descriptor is armed in
//! the OS multiplexer (the `polling` crate: epoll on Linux, kqueue on
//! BSDs). When readiness arrives the driver drains the queue in FIFO
//! order and wakes each waiter to retry; a waiter that blocks again goes
//! back to the tail and the descriptor is re-armed. A descriptor leaves
//! the multiplexer as soon as its last waiter is gone.
//!
//! The multiplexer delivers in oneshot mode; interest is re-armed after
//! every delivery and whenever a retried syscall blocks again, which is
//! observationally equivalent to level triggering under the eager-retry
//! discipline.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::panic::Location;
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::Instant;

use polling::{Event, Poller};

use crate::completion::{Completion, CompletionId, CompletionTable, OpValue, Signal};
use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::iop::OpState;
use crate::ready::{Direction, ReadyMap};
use crate::sys;
use crate::timer::TimerQueue;
use crate::warden::reactor::Reactor;
use crate::warden::Warden;

const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Where a parked operation waits. `queued` records whether the
/// completion currently owns a live slot in the ReadyMap, so retiring
/// it on cancellation or expiry is a counter decrement, never a queue
/// scan.
#[derive(Debug, Clone, Copy)]
struct Waiter {
    fd: RawFd,
    direction: Direction,
    queued: bool,
}

struct PollState {
    completions: CompletionTable<Option<Waiter>>,
    ready: ReadyMap,
    timers: TimerQueue,
}

/// Outcome of one syscall attempt.
enum Attempt {
    Done(OpValue),
    Park(Direction),
    Fail(io::Error),
}

/// Readiness-based warden.
///
/// Single-threaded: one driver thread owns the warden and every
/// completion created through it. Tasks share it via `Rc`.
pub struct PollWarden {
    poller: Poller,
    state: RefCell<PollState>,
    events: RefCell<Vec<Event>>,
    executor: Rc<Executor>,
}

impl PollWarden {
    /// Creates a warden with the default event buffer capacity.
    #[track_caller]
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    /// Creates a warden with a custom event buffer capacity.
    #[track_caller]
    pub fn with_capacity(events: usize) -> Result<Self> {
        let location = Location::caller();
        let poller = Poller::new().map_err(|err| Error::system("poller", &err, location))?;
        Ok(Self {
            poller,
            state: RefCell::new(PollState {
                completions: CompletionTable::new(),
                ready: ReadyMap::new(),
                timers: TimerQueue::new(),
            }),
            events: RefCell::new(Vec::with_capacity(events)),
            executor: Executor::new(),
        })
    }

    /// Number of operations currently suspended on this warden.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.state.borrow().completions.len()
    }

    /// Number of descriptors with live waiters or multiplexer
    /// registrations.
    #[must_use]
    pub fn registered_fds(&self) -> usize {
        self.state.borrow().ready.len()
    }

    fn interest_event(fd: RawFd, read: bool, write: bool) -> Event {
        let key = fd as usize;
        match (read, write) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }

    /// Brings the multiplexer registration for `fd` in line with its
    /// queues: arm, re-arm, or deregister.
    fn sync_interest(&self, state: &mut PollState, fd: RawFd) -> io::Result<()> {
        match state.ready.wanted(fd) {
            None => Ok(()),
            Some((false, false, armed)) => {
                state.ready.forget(fd);
                if armed {
                    self.poller.delete(fd)
                } else {
                    Ok(())
                }
            }
            Some((read, write, armed)) => {
                let event = Self::interest_event(fd, read, write);
                if armed {
                    self.poller.modify(fd, event)
                } else {
                    self.poller.add(fd, event)?;
                    state.ready.mark_armed(fd);
                    Ok(())
                }
            }
        }
    }

    fn blocks(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }

    /// Eager syscall for an operation being started.
    fn attempt(op: &mut OpState<'_>) -> Attempt {
        match op {
            OpState::Sleep { .. } => unreachable!("sleeps never reach the syscall path"),
            OpState::Read { fd, buf } => match sys::read(*fd, buf) {
                Ok(bytes) => Attempt::Done(OpValue::Size(bytes)),
                Err(err) if Self::blocks(&err) => Attempt::Park(Direction::Read),
                Err(err) => Attempt::Fail(err),
            },
            OpState::Write { fd, buf } => match sys::write(*fd, buf) {
                Ok(bytes) => Attempt::Done(OpValue::Size(bytes)),
                Err(err) if Self::blocks(&err) => Attempt::Park(Direction::Write),
                Err(err) => Attempt::Fail(err),
            },
            OpState::Accept { fd } => match sys::accept(*fd) {
                Ok(conn) => Attempt::Done(OpValue::Fd(conn)),
                Err(err) if Self::blocks(&err) => Attempt::Park(Direction::Read),
                Err(err) => Attempt::Fail(err),
            },
            OpState::Connect { fd, addr } => match sys::connect(*fd, addr) {
                Ok(()) => Attempt::Done(OpValue::Unit),
                Err(err)
                    if err.raw_os_error() == Some(libc::EINPROGRESS) || Self::blocks(&err) =>
                {
                    Attempt::Park(Direction::Write)
                }
                Err(err) => Attempt::Fail(err),
            },
            OpState::ReadReady { .. } => Attempt::Park(Direction::Read),
            OpState::WriteReady { .. } => Attempt::Park(Direction::Write),
        }
    }

    /// Retry after a readiness signal. Differs from the first attempt for
    /// connect (pending error pickup) and the pure readiness waits.
    fn reattempt(op: &mut OpState<'_>) -> Attempt {
        match op {
            OpState::Connect { fd, .. } => match sys::take_socket_error(*fd) {
                Ok(()) => Attempt::Done(OpValue::Unit),
                Err(err) => Attempt::Fail(err),
            },
            OpState::ReadReady { .. } | OpState::WriteReady { .. } => {
                Attempt::Done(OpValue::Unit)
            }
            other => Self::attempt(other),
        }
    }

    fn park(
        &self,
        fd: RawFd,
        direction: Direction,
        deadline: Option<Instant>,
        waker: &Waker,
    ) -> io::Result<CompletionId> {
        let state = &mut *self.state.borrow_mut();
        let id = state.completions.insert(Completion::new(
            waker.clone(),
            Some(Waiter {
                fd,
                direction,
                queued: true,
            }),
        ));
        state.ready.push(fd, direction, id);
        if let Err(err) = self.sync_interest(state, fd) {
            state.ready.retire(fd, direction);
            state.completions.remove(id);
            let _ = self.sync_interest(state, fd);
            return Err(err);
        }
        if let Some(at) = deadline {
            let key = state.timers.insert(at, id);
            if let Some(completion) = state.completions.get_mut(id) {
                completion.timer = Some(key);
            }
        }
        tracing::trace!(fd, ?direction, "waiter parked");
        Ok(id)
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
            let mut completion = Completion::new(waker.clone(), None);
            completion.expiry_completes = true;
            let id = state.completions.insert(completion);
            let key = state.timers.insert(Instant::now() + *duration, id);
            if let Some(completion) = state.completions.get_mut(id) {
                completion.timer = Some(key);
            }
            *lease = Some(id);
            tracing::trace!(?duration, "sleep armed");
            return Poll::Pending;
        }
        match Self::attempt(op) {
            Attempt::Done(value) => Poll::Ready(Ok(value)),
            Attempt::Fail(err) => Poll::Ready(Err(Error::system(op.name(), &err, location))),
            Attempt::Park(direction) => {
                let Some(fd) = op.fd() else {
                    return Poll::Ready(Err(Error::logic(op.name(), location)));
                };
                match self.park(fd, direction, deadline, waker) {
                    Ok(id) => {
                        *lease = Some(id);
                        Poll::Pending
                    }
                    Err(err) => Poll::Ready(Err(Error::system(op.name(), &err, location))),
                }
            }
        }
    }

    fn release(state: &mut PollState, id: CompletionId) {
        if let Some(completion) = state.completions.remove(id) {
            if let Some(key) = completion.timer {
                state.timers.cancel(&key);
            }
        }
    }

    fn resume(
        &self,
        id: CompletionId,
        op: &mut OpState<'_>,
        lease: &mut Option<CompletionId>,
        deadline: Option<Instant>,
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
        match signal {
            Signal::Value(value) => {
                Self::release(&mut self.state.borrow_mut(), id);
                *lease = None;
                Poll::Ready(Ok(value))
            }
            Signal::Os(code) => {
                Self::release(&mut self.state.borrow_mut(), id);
                *lease = None;
                Poll::Ready(Err(Error::system_code(op.name(), code, location)))
            }
            Signal::Expired => {
                Self::release(&mut self.state.borrow_mut(), id);
                *lease = None;
                Poll::Ready(Err(Error::timed_out(op.name(), location)))
            }
            Signal::Retry => match Self::reattempt(op) {
                Attempt::Done(value) => {
                    Self::release(&mut self.state.borrow_mut(), id);
                    *lease = None;
                    Poll::Ready(Ok(value))
                }
                Attempt::Fail(err) => {
                    Self::release(&mut self.state.borrow_mut(), id);
                    *lease = None;
                    Poll::Ready(Err(Error::system(op.name(), &err, location)))
                }
                Attempt::Park(direction) => {
                    let Some(fd) = op.fd() else {
                        Self::release(&mut self.state.borrow_mut(), id);
                        *lease = None;
                        return Poll::Ready(Err(Error::logic(op.name(), location)));
                    };
                    let state = &mut *self.state.borrow_mut();
                    state.ready.push(fd, direction, id);
                    let mut rearm = None;
                    if let Some(completion) = state.completions.get_mut(id) {
                        if !completion.waker.will_wake(waker) {
                            completion.waker = waker.clone();
                        }
                        if let Some(waiter) = completion.extra.as_mut() {
                            waiter.queued = true;
                        }
                        // A parked operation with a deadline always holds
                        // a timer entry; re-arm if expiry consumed it
                        // before this retry blocked.
                        if completion.timer.is_none() {
                            rearm = deadline;
                        }
                    }
                    if let Some(at) = rearm {
                        let key = state.timers.insert(at, id);
                        if let Some(completion) = state.completions.get_mut(id) {
                            completion.timer = Some(key);
                        }
                    }
                    if let Err(err) = self.sync_interest(state, fd) {
                        state.ready.retire(fd, direction);
                        Self::release(state, id);
                        let _ = self.sync_interest(state, fd);
                        *lease = None;
                        return Poll::Ready(Err(Error::system(op.name(), &err, location)));
                    }
                    Poll::Pending
                }
            },
        }
    }

    /// Wakes every live waiter parked on `fd`/`direction`, in FIFO
    /// order. Stale and already-retired ids drained alongside them are
    /// discarded.
    fn dispatch(state: &mut PollState, fd: RawFd, direction: Direction) {
        for id in state.ready.drain(fd, direction) {
            match state.completions.get_mut(id) {
                Some(completion) => {
                    let Some(waiter) = completion.extra.as_mut() else {
                        continue;
                    };
                    if !waiter.queued {
                        tracing::trace!(fd, "retired waiter discarded");
                        continue;
                    }
                    waiter.queued = false;
                    completion.signal = Some(Signal::Retry);
                    completion.waker.wake_by_ref();
                }
                // Cancelled after the event was queued.
                None => tracing::trace!(fd, "stale waiter discarded"),
            }
        }
    }

    fn expire_timers(&self) {
        let now = Instant::now();
        let state = &mut *self.state.borrow_mut();
        loop {
            let Some((_key, id)) = state.timers.pop_due(now) else {
                break;
            };
            let mut retired = None;
            match state.completions.get_mut(id) {
                Some(completion) => {
                    completion.timer = None;
                    // Readiness was observed for this completion earlier
                    // in the same tick; the retry wins over the deadline.
                    if completion.signal.is_some() {
                        continue;
                    }
                    if completion.expiry_completes {
                        completion.signal = Some(Signal::Value(OpValue::Unit));
                    } else {
                        completion.signal = Some(Signal::Expired);
                        if let Some(waiter) = completion.extra.as_mut() {
                            if waiter.queued {
                                waiter.queued = false;
                                retired = Some((waiter.fd, waiter.direction));
                            }
                        }
                    }
                    completion.waker.wake_by_ref();
                }
                None => continue,
            }
            // A timed-out waiter gives up its queue slot immediately so
            // later readiness cannot reach it.
            if let Some((fd, direction)) = retired {
                state.ready.retire(fd, direction);
                if let Err(err) = self.sync_interest(state, fd) {
                    tracing::warn!(fd, error = %err, "re-arm after expiry failed");
                }
            }
        }
    }
}

impl Reactor for PollWarden {
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
            Some(id) => self.resume(id, op, lease, deadline, waker, location),
        }
    }

    fn cancel_op(&self, lease: CompletionId) {
        let state = &mut *self.state.borrow_mut();
        let Some(completion) = state.completions.remove(lease) else {
            return;
        };
        if let Some(key) = completion.timer {
            state.timers.cancel(&key);
        }
        if let Some(waiter) = completion.extra {
            if waiter.queued {
                state.ready.retire(waiter.fd, waiter.direction);
                if let Err(err) = self.sync_interest(state, waiter.fd) {
                    tracing::warn!(fd = waiter.fd, error = %err, "deregister after cancel failed");
                }
            }
            tracing::trace!(fd = waiter.fd, direction = ?waiter.direction, "operation cancelled");
        }
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
        {
            let mut events = self.events.borrow_mut();
            events.clear();
            match self.poller.wait(&mut events, timeout) {
                Ok(count) => tracing::trace!(count, "poller woke"),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => tracing::warn!(error = %err, "poller wait failed"),
            }
            let state = &mut *self.state.borrow_mut();
            for event in events.iter() {
                let fd = event.key as RawFd;
                if event.readable {
                    Self::dispatch(state, fd, Direction::Read);
                }
                if event.writable {
                    Self::dispatch(state, fd, Direction::Write);
                }
                if !event.readable && !event.writable {
                    // Error-only notification: force both sides to retry
                    // and observe the failure from the syscall itself.
                    Self::dispatch(state, fd, Direction::Read);
                    Self::dispatch(state, fd, Direction::Write);
                }
                if let Err(err) = self.sync_interest(state, fd) {
                    tracing::warn!(fd, error = %err, "re-arm after dispatch failed");
                }
            }
        }
        self.expire_timers();
    }
}

impl Warden for PollWarden {}

impl std::fmt::Debug for PollWarden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("PollWarden")
            .field("pending_operations", &state.completions.len())
            .field("registered_fds", &state.ready.len())
            .field("timers", &state.timers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_event_mapping() {
        let event = PollWarden::interest_event(3, true, false);
        assert_eq!(event.key, 3);
        assert!(event.readable);
        assert!(!event.writable);

        let event = PollWarden::interest_event(4, false, true);
        assert!(!event.readable);
        assert!(event.writable);

        let event = PollWarden::interest_event(5, true, true);
        assert!(event.readable);
        assert!(event.writable);
    }

    #[test]
    fn fresh_warden_is_idle() {
        let ward = PollWarden::new().expect("warden");
        assert_eq!(ward.pending_operations(), 0);
        assert_eq!(ward.registered_fds(), 0);
    }

    #[test]
    fn debug_reports_counters() {
        let ward = PollWarden::new().expect("warden");
        let debug = format!("{ward:?}");
        assert!(debug.contains("PollWarden"));
        assert!(debug.contains("pending_operations"));
    }
}
