//! The platform context: one event loop plus the services that deliver onto
//! it.
//!
//! # Design
//! `Platform` lives on the owning thread and is the only way to run the
//! loop. `PlatformHandle` is the `Send + Sync` half that any thread may hold
//! to post tasks, start timers or submit requests. Dropping the `Platform`
//! shuts the services down; handles outliving it get `Unknown` errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::error::PlatformError;
use crate::event_loop::{EventLoop, LoopControl};
use crate::http::{HttpRequest, HttpResponse};
use crate::net::{EngineStats, NetworkEngine, RequestHandle, RequestPhase};
use crate::task::TaskSender;
use crate::timer::{TimerHandle, TimerService};

struct Services {
    owner: ThreadId,
    sender: TaskSender,
    control: LoopControl,
    timers: TimerService,
    net: NetworkEngine,
    closed: AtomicBool,
}

impl Services {
    fn ensure_open(&self) -> Result<(), PlatformError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PlatformError::Unknown("platform has shut down".into()));
        }
        Ok(())
    }
}

pub struct Platform {
    event_loop: EventLoop,
    services: Arc<Services>,
}

impl Platform {
    /// Create the platform with the calling thread as its owning thread.
    pub fn new(config: PlatformConfig) -> Result<Self, PlatformError> {
        config.validate()?;
        let event_loop = EventLoop::new();
        let timers = TimerService::new(event_loop.sender(), &config.timers)?;
        let net = NetworkEngine::new(event_loop.sender(), config.net);
        let services = Arc::new(Services {
            owner: event_loop.owner(),
            sender: event_loop.sender(),
            control: event_loop.control(),
            timers,
            net,
            closed: AtomicBool::new(false),
        });
        tracing::debug!(owner = ?services.owner, "platform initialized");
        Ok(Self {
            event_loop,
            services,
        })
    }

    pub fn handle(&self) -> PlatformHandle {
        PlatformHandle {
            services: Arc::clone(&self.services),
        }
    }

    /// Run the loop until `quit_event_loop`; returns the exit code.
    pub fn run_event_loop(&self) -> i32 {
        self.event_loop.run()
    }

    pub fn pump(&self, timeout: Duration) -> usize {
        self.event_loop.pump(timeout)
    }

    pub fn drain(&self) -> usize {
        self.event_loop.drain()
    }

    /// Cancel outstanding requests, stop every timer and run what is left
    /// in the queue. Callbacks of cancelled work do not run. A loop running
    /// further up the stack returns 0. Idempotent.
    pub fn shutdown(&self) {
        if self.services.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.services.control.quit(0);
        self.services.net.cancel_all();
        self.services.timers.shutdown();
        let leftover = self.event_loop.drain();
        tracing::debug!(leftover, "platform shut down");
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Thread-safe access to a `Platform`'s services.
#[derive(Clone)]
pub struct PlatformHandle {
    services: Arc<Services>,
}

impl PlatformHandle {
    pub fn owner(&self) -> ThreadId {
        self.services.owner
    }

    /// Queue `task` to run on the owning thread.
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) -> Result<(), PlatformError> {
        self.services.ensure_open()?;
        self.services.sender.post(task);
        Ok(())
    }

    pub fn timer_start(
        &self,
        period: Duration,
        repeat: bool,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<TimerHandle, PlatformError> {
        self.services.ensure_open()?;
        self.services.timers.start(period, repeat, callback)
    }

    pub fn timer_stop(&self, handle: TimerHandle) -> bool {
        self.services.timers.stop(handle)
    }

    pub fn live_timers(&self) -> usize {
        self.services.timers.live_count()
    }

    pub fn net_request(
        &self,
        request: HttpRequest,
        callback: impl FnOnce(HttpResponse) + Send + 'static,
    ) -> Result<RequestHandle, PlatformError> {
        self.services.ensure_open()?;
        self.services.net.submit(request, callback)
    }

    pub fn net_request_cancel(&self, handle: RequestHandle) {
        self.services.net.cancel(handle);
    }

    pub fn request_phase(&self, handle: RequestHandle) -> Option<RequestPhase> {
        self.services.net.phase(handle)
    }

    pub fn requests_in_flight(&self) -> usize {
        self.services.net.in_flight()
    }

    pub fn net_stats(&self) -> EngineStats {
        self.services.net.stats()
    }

    pub fn quit_event_loop(&self, code: i32) {
        self.services.control.quit(code);
    }
}
