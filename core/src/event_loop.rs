//! The owning thread's loop: wait for a wake-up, drain the task queue.
//!
//! # Design
//! `EventLoop` is created on the thread that will own it and is neither
//! `Send` nor `Sync`, so `drain`, `pump` and `run` can only ever execute on
//! that thread. Everything other threads need is reachable through the
//! cloneable `TaskSender` and `LoopControl` handles.

use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::sync::lock;
use crate::task::{TaskQueue, TaskSender, WakeOwner};

#[derive(Debug, Default)]
struct WakeState {
    pending: bool,
    quit: Option<i32>,
}

/// Condition-variable wake primitive for loops without a native message
/// queue. A wake-up sent while the owner is busy is remembered in `pending`
/// and consumed by the next wait.
#[derive(Debug, Default)]
pub struct WakeSignal {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn request_quit(&self, code: i32) {
        lock(&self.state).quit = Some(code);
        self.cond.notify_all();
    }

    fn take_quit(&self) -> Option<i32> {
        lock(&self.state).quit.take()
    }

    fn wait(&self, timeout: Option<Duration>, wake_on_quit: bool) {
        let not_ready = |s: &mut WakeState| !(s.pending || (wake_on_quit && s.quit.is_some()));
        let state = lock(&self.state);
        let mut state = match timeout {
            Some(timeout) => {
                self.cond
                    .wait_timeout_while(state, timeout, not_ready)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .cond
                .wait_while(state, not_ready)
                .unwrap_or_else(PoisonError::into_inner),
        };
        state.pending = false;
    }
}

impl WakeOwner for WakeSignal {
    fn wake_owner(&self) {
        lock(&self.state).pending = true;
        self.cond.notify_all();
    }
}

/// Asks a running loop to exit. Callable from any thread.
#[derive(Clone, Debug)]
pub struct LoopControl {
    signal: Arc<WakeSignal>,
}

impl LoopControl {
    pub fn quit(&self, code: i32) {
        tracing::debug!(code, "event loop quit requested");
        self.signal.request_quit(code);
    }
}

pub struct EventLoop {
    queue: Arc<TaskQueue>,
    signal: Arc<WakeSignal>,
    owner: ThreadId,
    _owner_only: PhantomData<*const ()>,
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    pub fn new() -> Self {
        let signal = Arc::new(WakeSignal::new());
        let queue = Arc::new(TaskQueue::new(signal.clone()));
        Self {
            queue,
            signal,
            owner: thread::current().id(),
            _owner_only: PhantomData,
        }
    }

    pub fn sender(&self) -> TaskSender {
        TaskSender::new(Arc::clone(&self.queue))
    }

    pub fn control(&self) -> LoopControl {
        LoopControl {
            signal: Arc::clone(&self.signal),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Run every queued task, in order, until the queue is empty.
    ///
    /// Tasks posted while draining run in this pass. Returns how many ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.queue.pop() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for a wake-up, then drain once.
    pub fn pump(&self, timeout: Duration) -> usize {
        if self.queue.is_empty() {
            self.signal.wait(Some(timeout), false);
        }
        self.drain()
    }

    /// Drive the loop until `LoopControl::quit` is called; returns its code.
    ///
    /// Tasks already queued when the quit request is observed still run.
    pub fn run(&self) -> i32 {
        tracing::debug!(thread = ?self.owner, "event loop running");
        loop {
            self.drain();
            if let Some(code) = self.signal.take_quit() {
                self.drain();
                tracing::debug!(code, "event loop exiting");
                return code;
            }
            self.signal.wait(None, true);
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
