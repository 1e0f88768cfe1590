//! Small synchronization helpers shared by the services.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking task poisoned it.
///
/// Every structure guarded here stays consistent across a panic: the lock is
/// never held while user code runs.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot latch: `signal` once, `wait` from any number of threads.
///
/// Writes made before `signal` are visible to every thread that returns from
/// `wait`.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn signal(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_signaled(&self) -> bool {
        *lock(&self.done)
    }

    pub(crate) fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait at most `timeout`. Returns whether the latch was signalled.
    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let done = lock(&self.done);
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }
}
