//! Internal seam between operation handles and the two reactor
//! implementations.
//!
//! [`Iop`](crate::Iop) is one concrete future type; everything
//! backend-specific goes through this object-safe trait. Each warden
//! owns its completion representation and implements the trait over it.

use std::panic::Location;
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::Instant;

use crate::completion::{CompletionId, OpValue};
use crate::error::Result;
use crate::exec::Executor;
use crate::iop::OpState;

/// Backend surface the operation handles drive.
pub trait Reactor {
    /// Advances one operation.
    ///
    /// On first call `lease` is `None`: the reactor attempts or submits
    /// the operation and, if it suspends, stores a completion and leaves
    /// its id in `lease`. Subsequent calls consume the completion's
    /// signal. On `Poll::Ready` the completion slot has been freed and
    /// `lease` cleared.
    fn poll_op(
        &self,
        op: &mut OpState<'_>,
        lease: &mut Option<CompletionId>,
        deadline: Option<Instant>,
        waker: &Waker,
        location: &'static Location<'static>,
    ) -> Poll<Result<OpValue>>;

    /// Cancels a suspended operation, releasing every registration it
    /// holds. Safe to call with a stale id (no-op).
    fn cancel_op(&self, lease: CompletionId);

    /// The task executor this reactor resumes tasks on.
    fn executor(&self) -> &Rc<Executor>;

    /// Blocks until the next readiness event, completion, or timer
    /// deadline, then wakes the affected tasks. Internal failures are
    /// logged, never propagated.
    fn turn(&self);
}
