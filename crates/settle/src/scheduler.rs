//! Deferred task execution.
//!
//! Settlement never notifies subscribers inline. Completion capabilities hand
//! a task to a [`Scheduler`], which runs it after the caller's synchronous
//! code has unwound, in FIFO order relative to every other task it was given.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Deferred-execution collaborator.
///
/// Implementations must:
/// - never run `task` before `schedule` returns
/// - run tasks in the order they were scheduled
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, task: Task);
}

/// Manually driven FIFO scheduler.
///
/// `schedule` only enqueues. Tasks run when the owner calls
/// [`run_next`](Self::run_next) or [`run_until_idle`](Self::run_until_idle),
/// which makes the queue a deterministic stand-in for an event loop.
///
/// ```ignore
/// let queue = Arc::new(TaskQueue::new());
/// let value = DeferredValue::<i32>::fulfilled(queue.clone(), 3);
/// let doubled = value.map(|v| v * 2);
///
/// queue.run_until_idle();
/// ```
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run the oldest task, if any. Returns `false` when the queue was empty.
    pub fn run_next(&self) -> bool {
        // The guard is released before the task runs; tasks schedule more tasks.
        let task = self.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks scheduled by the
    /// tasks being run. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        trace!(ran, "task queue idle");
        ran
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, task: Task) {
        let mut tasks = self.lock();
        tasks.push_back(task);
        trace!(pending = tasks.len(), "task scheduled");
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}
