//! Single-threaded task plumbing shared by both wardens.
//!
//! Tasks are plain futures stored in a map owned by the [`Executor`].
//! Wakers carry a task id into a FIFO run queue; the driver loop pops
//! ids and polls the matching futures, so resume order equals wake
//! order. Between polls a task runs to its next suspension point
//! atomically with respect to every other task.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;

/// Run-queue id of the root task driven by `run`.
pub(crate) const ROOT_TASK: usize = usize::MAX;

/// FIFO queue of woken task ids, shared with wakers.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    ready: Mutex<VecDeque<usize>>,
}

impl RunQueue {
    fn push(&self, id: usize) {
        self.ready.lock().push_back(id);
    }

    fn pop(&self) -> Option<usize> {
        self.ready.lock().pop_front()
    }
}

struct TaskWaker {
    queue: Arc<RunQueue>,
    id: usize,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

struct TaskState {
    future: TaskFuture,
    finished: Rc<Cell<bool>>,
}

enum TaskSlot {
    /// Parked between polls.
    Idle(TaskState),
    /// Temporarily taken out while being polled.
    Polling,
    /// Handle dropped mid-poll; discard the future when the poll returns.
    Aborted,
}

/// Owner of detached task futures and the run queue.
pub(crate) struct Executor {
    tasks: RefCell<HashMap<usize, TaskSlot>>,
    next_id: Cell<usize>,
    queue: Arc<RunQueue>,
    weak: Weak<Executor>,
}

impl Executor {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            tasks: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            queue: Arc::new(RunQueue::default()),
            weak: weak.clone(),
        })
    }

    pub(crate) fn waker(&self, id: usize) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            queue: Arc::clone(&self.queue),
            id,
        }))
    }

    pub(crate) fn schedule(&self, id: usize) {
        self.queue.push(id);
    }

    pub(crate) fn dequeue(&self) -> Option<usize> {
        self.queue.pop()
    }

    /// Number of detached tasks currently alive.
    pub(crate) fn live_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Registers a detached task and polls it to its first suspension
    /// point.
    pub(crate) fn spawn(&self, future: TaskFuture) -> TaskHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let finished = Rc::new(Cell::new(false));
        self.tasks.borrow_mut().insert(
            id,
            TaskSlot::Idle(TaskState {
                future,
                finished: Rc::clone(&finished),
            }),
        );
        self.poll_task(id);
        TaskHandle {
            executor: self.weak.clone(),
            id,
            finished,
        }
    }

    /// Polls one detached task. Stale ids (finished or aborted tasks)
    /// are ignored.
    pub(crate) fn poll_task(&self, id: usize) {
        let mut task = {
            let mut tasks = self.tasks.borrow_mut();
            match tasks.get_mut(&id) {
                Some(slot @ TaskSlot::Idle(_)) => {
                    let TaskSlot::Idle(task) = std::mem::replace(slot, TaskSlot::Polling) else {
                        unreachable!();
                    };
                    task
                }
                _ => return,
            }
        };

        let waker = self.waker(id);
        let mut cx = Context::from_waker(&waker);
        let poll = task.future.as_mut().poll(&mut cx);

        let mut tasks = self.tasks.borrow_mut();
        match poll {
            Poll::Ready(()) => {
                task.finished.set(true);
                tasks.remove(&id);
                drop(tasks);
                // The future may own handles whose drops re-enter the
                // executor; release the borrow first.
                drop(task);
            }
            Poll::Pending => {
                let aborted = matches!(tasks.get(&id), Some(TaskSlot::Aborted) | None);
                if aborted {
                    tasks.remove(&id);
                    drop(tasks);
                    drop(task);
                } else {
                    tasks.insert(id, TaskSlot::Idle(task));
                }
            }
        }
    }

    /// Drops a detached task, cancelling whatever it was suspended on.
    fn abort(&self, id: usize) {
        let slot = {
            let mut tasks = self.tasks.borrow_mut();
            if matches!(tasks.get(&id), Some(TaskSlot::Polling)) {
                tasks.insert(id, TaskSlot::Aborted);
                None
            } else {
                tasks.remove(&id)
            }
        };
        // Dropped outside the borrow: the future's in-flight operations
        // cancel themselves against the warden on the way down.
        drop(slot);
    }
}

/// Handle to a detached task.
///
/// Dropping the handle before the task finishes aborts it: the task's
/// future is dropped, which cancels its in-flight operations.
pub struct TaskHandle {
    executor: Weak<Executor>,
    id: usize,
    finished: Rc<Cell<bool>>,
}

impl TaskHandle {
    /// Returns true once the task has run to completion.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.finished.get() {
            if let Some(executor) = self.executor.upgrade() {
                executor.abort(self.id);
            }
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.finished.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;

    /// Future that stays pending a fixed number of polls, waking itself.
    struct Yields(u32);

    impl Future for Yields {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 == 0 {
                Poll::Ready(())
            } else {
                self.0 -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn spawn_polls_to_first_suspension() {
        let executor = Executor::new();
        let handle = executor.spawn(Box::pin(Yields(2)));
        // First poll consumed one yield and re-queued itself.
        assert!(!handle.is_finished());
        assert_eq!(executor.dequeue(), Some(0));
    }

    #[test]
    fn immediate_completion_marks_finished() {
        let executor = Executor::new();
        let handle = executor.spawn(Box::pin(async {}));
        assert!(handle.is_finished());
        assert_eq!(executor.live_tasks(), 0);
    }

    #[test]
    fn wake_order_is_fifo() {
        let executor = Executor::new();
        let a = executor.waker(7);
        let b = executor.waker(8);
        a.wake_by_ref();
        b.wake();
        assert_eq!(executor.dequeue(), Some(7));
        assert_eq!(executor.dequeue(), Some(8));
        assert_eq!(executor.dequeue(), None);
    }

    #[test]
    fn dropping_handle_aborts_pending_task() {
        let executor = Executor::new();
        let handle = executor.spawn(Box::pin(Yields(10)));
        assert_eq!(executor.live_tasks(), 1);
        drop(handle);
        assert_eq!(executor.live_tasks(), 0);
    }

    #[test]
    fn stale_wakes_are_ignored() {
        let executor = Executor::new();
        let handle = executor.spawn(Box::pin(async {}));
        assert!(handle.is_finished());
        // The id may still sit in the queue; polling it must be harmless.
        executor.poll_task(0);
    }
}
