//! One-shot and repeating timers whose callbacks run on the owning thread.
//!
//! # Design
//! A single scheduler thread keeps a min-heap of deadlines. When a deadline
//! passes it does not call the timer's callback; it posts a task to the
//! owning thread's queue that does. The registry maps handle ids to live
//! entries, so stopping a finished or unknown timer is a harmless no-op.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::TimerConfig;
use crate::error::PlatformError;
use crate::sync::lock;
use crate::task::TaskSender;

/// Identifies a scheduled timer. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(NonZeroU64);

impl TimerHandle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

/// Stale deadlines tolerated before `stop` compacts the heap.
const COMPACT_SLACK: usize = 16;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct TimerEntry {
    period: Duration,
    repeat: bool,
    callback: TimerCallback,
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct Schedule {
    entries: HashMap<u64, TimerEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
    shutdown: bool,
}

impl Schedule {
    /// Post the firing for `id` and reschedule or release it.
    fn fire(&mut self, id: u64, deadline: Instant, now: Instant, sender: &TaskSender) {
        let Some(entry) = self.entries.get(&id) else {
            // Stopped after this deadline was queued.
            return;
        };
        let (repeat, period) = (entry.repeat, entry.period);
        let callback = Arc::clone(&entry.callback);
        let live = Arc::clone(&entry.live);
        sender.post(move || {
            if live.load(Ordering::Acquire) {
                callback();
            }
        });

        // Past the clock's range a repeating timer is released like a
        // one-shot.
        let next = if repeat {
            deadline
                .checked_add(period)
                .and_then(|next| if next > now { Some(next) } else { now.checked_add(period) })
        } else {
            None
        };
        match next {
            Some(next) => self.deadlines.push(Reverse((next, id))),
            None => {
                self.entries.remove(&id);
                tracing::trace!(id, repeat, "timer released");
            }
        }
    }

    /// Drop deadlines of stopped timers once they outnumber live ones.
    fn compact(&mut self) {
        if self.deadlines.len() <= 2 * self.entries.len() + COMPACT_SLACK {
            return;
        }
        let entries = &self.entries;
        self.deadlines.retain(|Reverse((_, id))| entries.contains_key(id));
        tracing::trace!(remaining = self.deadlines.len(), "timer deadlines compacted");
    }
}

struct Shared {
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
    sender: TaskSender,
    max_timers: usize,
}

pub struct TimerService {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Start the scheduler thread. Firings are posted through `sender`.
    pub fn new(sender: TaskSender, config: &TimerConfig) -> Result<Self, PlatformError> {
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::default()),
            wakeup: Condvar::new(),
            sender,
            max_timers: config.max_timers,
        });
        let scheduler = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("lb-timer".to_string())
            .spawn(move || run_scheduler(&scheduler))
            .map_err(|e| PlatformError::Unknown(format!("spawning timer thread: {e}")))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedule `callback` to run on the owning thread after `period`, and
    /// every `period` afterwards when `repeat` is set. A zero period is
    /// always one-shot. A period too large to schedule is `BadArgument`.
    pub fn start(
        &self,
        period: Duration,
        repeat: bool,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<TimerHandle, PlatformError> {
        let deadline = Instant::now()
            .checked_add(period)
            .ok_or_else(|| PlatformError::bad_argument("timer period out of range"))?;
        let mut schedule = lock(&self.shared.schedule);
        if schedule.shutdown {
            return Err(PlatformError::Unknown("timer service has shut down".into()));
        }
        if schedule.entries.len() >= self.shared.max_timers {
            tracing::warn!(limit = self.shared.max_timers, "timer registration refused");
            return Err(PlatformError::OutOfMemory);
        }

        schedule.next_id += 1;
        let id = schedule.next_id;
        let Some(handle) = TimerHandle::from_raw(id) else {
            return Err(PlatformError::Unknown("timer ids exhausted".into()));
        };
        schedule.entries.insert(
            id,
            TimerEntry {
                period,
                repeat: repeat && !period.is_zero(),
                callback: Arc::new(callback),
                live: Arc::new(AtomicBool::new(true)),
            },
        );
        schedule.deadlines.push(Reverse((deadline, id)));
        drop(schedule);

        self.shared.wakeup.notify_all();
        tracing::debug!(id, period_ms = period.as_millis() as u64, repeat, "timer started");
        Ok(handle)
    }

    /// Prevent future firings. A firing that is already queued does not run
    /// either. Returns whether `handle` named a live timer.
    pub fn stop(&self, handle: TimerHandle) -> bool {
        let entry = {
            let mut schedule = lock(&self.shared.schedule);
            let entry = schedule.entries.remove(&handle.as_raw());
            schedule.compact();
            entry
        };
        match entry {
            Some(entry) => {
                entry.live.store(false, Ordering::Release);
                tracing::debug!(id = handle.as_raw(), "timer stopped");
                true
            }
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        lock(&self.shared.schedule).entries.len()
    }

    /// Stop the scheduler thread and wait for it. Live timers never fire
    /// again. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut schedule = lock(&self.shared.schedule);
            schedule.shutdown = true;
            for entry in schedule.entries.values() {
                entry.live.store(false, Ordering::Release);
            }
            schedule.entries.clear();
            schedule.deadlines.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(shared: &Shared) {
    let mut schedule = lock(&shared.schedule);
    loop {
        if schedule.shutdown {
            break;
        }
        let now = Instant::now();
        let next = schedule
            .deadlines
            .peek()
            .map(|Reverse((deadline, id))| (*deadline, *id));
        schedule = match next {
            None => shared
                .wakeup
                .wait(schedule)
                .unwrap_or_else(PoisonError::into_inner),
            Some((deadline, _)) if deadline > now => {
                shared
                    .wakeup
                    .wait_timeout(schedule, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            Some((deadline, id)) => {
                schedule.deadlines.pop();
                schedule.fire(id, deadline, now, &shared.sender);
                schedule
            }
        };
    }
    tracing::debug!("timer thread exiting");
}
