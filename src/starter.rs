//! Owner for detached background tasks.
//!
//! A [`Starter`] launches fire-and-forget tasks against a warden and
//! keeps their handles. Finished tasks are reaped with [`gc`](Starter::gc).
//! Dropping the starter aborts any task still running, which recursively
//! drops the task's in-flight operations and cancels their
//! registrations.

use std::future::Future;

use crate::exec::TaskHandle;
use crate::warden::Warden;

/// Container that owns detached tasks and reaps finished ones.
pub struct Starter<'w, W: Warden> {
    ward: &'w W,
    tasks: Vec<TaskHandle>,
}

impl<'w, W: Warden> Starter<'w, W> {
    /// Creates an empty starter bound to a warden.
    pub fn new(ward: &'w W) -> Self {
        Self {
            ward,
            tasks: Vec::new(),
        }
    }

    /// Launches a detached task.
    ///
    /// The task is polled to its first suspension point before `post`
    /// returns, so operations it issues are registered immediately.
    pub fn post<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.tasks.push(self.ward.spawn(Box::pin(future)));
    }

    /// Releases the handles of tasks that have finished. Idempotent on a
    /// stable task list.
    pub fn gc(&mut self) {
        self.tasks.retain(|task| !task.is_finished());
    }

    /// Number of handles currently held, finished or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no handles are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
