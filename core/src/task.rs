//! Thread-safe FIFO of deferred work for the owning thread.
//!
//! # Design
//! Producers on any thread push a `Task` under a mutex and then wake the
//! owner through `WakeOwner`. The owner pops one task at a time and runs it
//! with the lock released, so a running task may post more work.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// A unit of work executed once on the owning thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Wakes the owning thread's loop after work was queued.
///
/// Implementations may use a condition variable, a reserved window message
/// or an eventfd. `wake_owner` must not block.
pub trait WakeOwner: Send + Sync {
    fn wake_owner(&self);
}

pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    waker: Arc<dyn WakeOwner>,
}

impl TaskQueue {
    pub fn new(waker: Arc<dyn WakeOwner>) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    /// Append `task` and wake the owner. Callable from any thread.
    pub fn post(&self, task: Task) {
        lock(&self.tasks).push_back(task);
        self.waker.wake_owner();
    }

    /// Pop the front task. The lock is released before this returns.
    pub(crate) fn pop(&self) -> Option<Task> {
        lock(&self.tasks).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

/// Cloneable producer side of a `TaskQueue`.
#[derive(Clone, Debug)]
pub struct TaskSender {
    queue: Arc<TaskQueue>,
}

impl TaskSender {
    pub(crate) fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.post(Box::new(task));
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
