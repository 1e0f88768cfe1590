//! Cancellable network requests, one worker thread each, results delivered
//! on the owning thread.
//!
//! # Design
//! Every submitted request gets a `RequestState` shared by three parties:
//! the worker thread executing the exchange, the delivery task queued on the
//! owning thread, and whoever calls `cancel`. The state's methods are the
//! only transitions:
//!
//! - the worker polls `cancelled` between blocking steps and, unless
//!   cancelled, marks `callback_scheduled` and posts the delivery task before
//!   signalling completion;
//! - `cancel` sets `cancelled`, waits for completion, and finalizes only if
//!   no delivery was scheduled;
//! - the delivery task runs the callback unless cancelled, then finalizes.
//!
//! `RequestState::finalize` is the single release path. It waits for
//! completion and is guarded by one compare-and-set, so whichever of the two
//! finalizers gets there first joins the worker and the other does nothing.
//! The callback is an `FnOnce` moved along this path, so it can run at most
//! once.
//!
//! Handles are plain ids looked up in a registry; finalization removes the
//! entry, so using a handle after its request finished is a no-op.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crate::buffer::Buffer;
use crate::config::NetConfig;
use crate::error::{ErrorCode, PlatformError, TransportError};
use crate::http::{HttpRequest, HttpResponse, PreparedRequest};
use crate::sync::{lock, Completion};
use crate::task::TaskSender;
use crate::transport::{HttpTransport, Transport};

/// Receives the response of one request on the owning thread.
pub type ResponseCallback = Box<dyn FnOnce(HttpResponse) + Send + 'static>;

/// Identifies a submitted request. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(NonZeroU64);

impl RequestHandle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

/// Lifecycle of a request.
///
/// `Created → Sending → AwaitingResponse → StreamingBody → Completed | Cancelled → Finalized`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestPhase {
    Created = 0,
    Sending = 1,
    AwaitingResponse = 2,
    StreamingBody = 3,
    Completed = 4,
    Cancelled = 5,
    Finalized = 6,
}

impl RequestPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestPhase::Created,
            1 => RequestPhase::Sending,
            2 => RequestPhase::AwaitingResponse,
            3 => RequestPhase::StreamingBody,
            4 => RequestPhase::Completed,
            5 => RequestPhase::Cancelled,
            _ => RequestPhase::Finalized,
        }
    }
}

/// Lifetime counters of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub delivered: u64,
    pub cancelled: u64,
    pub finalized: u64,
}

/// Points where the worker polls for cancellation.
#[derive(Debug, Clone, Copy)]
enum Checkpoint {
    BeforeConnect,
    Connected,
    Sent,
    HeadersReceived,
    BodyChunk,
}

struct RequestState {
    id: u64,
    phase: AtomicU8,
    cancelled: AtomicBool,
    callback_scheduled: AtomicBool,
    finalized: AtomicBool,
    completion: Completion,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestState {
    fn new(id: u64) -> Self {
        Self {
            id,
            phase: AtomicU8::new(RequestPhase::Created as u8),
            cancelled: AtomicBool::new(false),
            callback_scheduled: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            completion: Completion::new(),
            worker: Mutex::new(None),
        }
    }

    fn advance(&self, phase: RequestPhase) {
        self.phase.store(phase as u8, Ordering::Release);
        tracing::trace!(id = self.id, ?phase, "request phase");
    }

    fn phase(&self) -> RequestPhase {
        RequestPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Returns true for the first cancel only.
    fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn mark_scheduled(&self) {
        self.callback_scheduled.store(true, Ordering::Release);
    }

    fn is_scheduled(&self) -> bool {
        self.callback_scheduled.load(Ordering::Acquire)
    }

    fn checkpoint(&self, at: Checkpoint) -> Result<(), Abort> {
        if self.is_cancelled() {
            tracing::debug!(id = self.id, ?at, "cancellation observed");
            return Err(Abort::Cancelled);
        }
        Ok(())
    }

    /// Release the worker thread once it has finished. Returns true only for
    /// the caller that performed the release.
    ///
    /// On the delivery path the worker has already posted the task, so the
    /// wait here only covers the gap between its `post` and `signal`, never
    /// any I/O.
    fn finalize(&self) -> bool {
        self.completion.wait();
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let worker = lock(&self.worker).take();
        // The worker itself may drop the last delivery task when the queue
        // dies with it; it has already signalled, so it is left detached.
        if let Some(worker) = worker.filter(|w| w.thread().id() != thread::current().id()) {
            if worker.join().is_err() {
                tracing::error!(id = self.id, "network worker panicked");
            }
        }
        self.advance(RequestPhase::Finalized);
        true
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    cancelled: AtomicU64,
    finalized: AtomicU64,
}

struct Shared {
    sender: TaskSender,
    transport: Arc<dyn Transport>,
    config: NetConfig,
    requests: Mutex<HashMap<u64, Arc<RequestState>>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn lookup(&self, handle: RequestHandle) -> Option<Arc<RequestState>> {
        lock(&self.requests).get(&handle.as_raw()).cloned()
    }

    fn finalize(&self, state: &RequestState) {
        if state.finalize() {
            lock(&self.requests).remove(&state.id);
            self.counters.finalized.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = state.id, "request finalized");
        }
    }
}

/// Finalizes its request when dropped, so the delivery task releases the
/// request even if the callback panics.
struct FinalizeOnDrop {
    engine: Weak<Shared>,
    state: Arc<RequestState>,
}

impl Drop for FinalizeOnDrop {
    fn drop(&mut self) {
        match self.engine.upgrade() {
            Some(engine) => engine.finalize(&self.state),
            None => {
                self.state.finalize();
            }
        }
    }
}

pub struct NetworkEngine {
    shared: Arc<Shared>,
}

impl NetworkEngine {
    /// Engine using the default HTTP transport.
    pub fn new(sender: TaskSender, config: NetConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(&config));
        Self::with_transport(sender, config, transport)
    }

    pub fn with_transport(sender: TaskSender, config: NetConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sender,
                transport,
                config,
                requests: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Start `request` on a new worker thread.
    ///
    /// `callback` runs on the owning thread, after this returns, at most once,
    /// and never if the request is cancelled first. Malformed requests fail
    /// here with `BadArgument` without spawning anything; `callback` is then
    /// dropped uncalled.
    pub fn submit(
        &self,
        request: HttpRequest,
        callback: impl FnOnce(HttpResponse) + Send + 'static,
    ) -> Result<RequestHandle, PlatformError> {
        let prepared = request.prepare()?;
        let callback: ResponseCallback = Box::new(callback);

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = RequestHandle::from_raw(id)
            .ok_or_else(|| PlatformError::Unknown("request ids exhausted".into()))?;
        let state = Arc::new(RequestState::new(id));

        // Held until the join handle is stored, so a finalizer on another
        // thread cannot find the slot empty.
        let mut worker_slot = lock(&state.worker);
        lock(&self.shared.requests).insert(id, Arc::clone(&state));

        let worker = Worker {
            engine: Arc::downgrade(&self.shared),
            sender: self.shared.sender.clone(),
            transport: Arc::clone(&self.shared.transport),
            config: self.shared.config.clone(),
            state: Arc::clone(&state),
        };
        let spawned = thread::Builder::new()
            .name(format!("lb-net-{id}"))
            .spawn(move || worker.run(prepared, callback));

        match spawned {
            Ok(join) => *worker_slot = Some(join),
            Err(e) => {
                drop(worker_slot);
                lock(&self.shared.requests).remove(&id);
                state.completion.signal();
                tracing::error!(id, error = %e, "spawning network worker failed");
                return Err(PlatformError::Unknown(format!("spawning network worker: {e}")));
            }
        }
        drop(worker_slot);

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, "request submitted");
        Ok(handle)
    }

    /// Cancel a request and wait for its worker to reach the next checkpoint.
    ///
    /// After this returns the callback will not run. The wait is bounded by
    /// the transport timeout of the step in progress. Unknown or finished
    /// handles are ignored.
    pub fn cancel(&self, handle: RequestHandle) {
        let Some(state) = self.shared.lookup(handle) else {
            tracing::debug!(id = handle.as_raw(), "cancel of unknown or finished request");
            return;
        };
        self.flag_cancelled(&state);
        self.settle(&state);
    }

    /// Cancel every request still registered.
    ///
    /// All requests are flagged before waiting on any of them, so the total
    /// wait is bounded by the slowest step in progress, not their sum.
    pub fn cancel_all(&self) {
        let states: Vec<Arc<RequestState>> = lock(&self.shared.requests).values().cloned().collect();
        for state in &states {
            self.flag_cancelled(state);
        }
        for state in &states {
            self.settle(state);
        }
        tracing::debug!(count = states.len(), "all requests cancelled");
    }

    fn flag_cancelled(&self, state: &RequestState) {
        if state.cancel() {
            self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait for the worker and finalize unless a delivery task owns that.
    fn settle(&self, state: &RequestState) {
        state.completion.wait();
        if !state.is_scheduled() {
            self.shared.finalize(state);
        }
    }

    /// Current phase, or `None` once the request has been finalized.
    pub fn phase(&self, handle: RequestHandle) -> Option<RequestPhase> {
        self.shared.lookup(handle).map(|state| state.phase())
    }

    /// Requests submitted and not yet finalized.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.requests).len()
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            finalized: counters.finalized.load(Ordering::Relaxed),
        }
    }
}

enum Abort {
    Cancelled,
    Transport(TransportError),
    OutOfMemory,
}

impl From<TransportError> for Abort {
    fn from(err: TransportError) -> Self {
        Abort::Transport(err)
    }
}

/// Everything a worker thread needs; owns no reference that keeps the
/// engine alive after the worker returns.
struct Worker {
    engine: Weak<Shared>,
    sender: TaskSender,
    transport: Arc<dyn Transport>,
    config: NetConfig,
    state: Arc<RequestState>,
}

impl Worker {
    fn run(self, request: PreparedRequest, callback: ResponseCallback) {
        let id = self.state.id;
        let outcome = catch_unwind(AssertUnwindSafe(|| self.exchange(&request)));
        let response = match outcome {
            Ok(Ok(response)) => Some(response),
            Ok(Err(Abort::Cancelled)) => None,
            Ok(Err(Abort::Transport(err))) => {
                tracing::warn!(id, error = %err, uri = %request.uri, "request failed");
                Some(HttpResponse::failed(ErrorCode::Unknown))
            }
            Ok(Err(Abort::OutOfMemory)) => {
                tracing::warn!(id, uri = %request.uri, "response body allocation failed");
                Some(HttpResponse::failed(ErrorCode::OutOfMemory))
            }
            Err(_) => {
                tracing::error!(id, "transport panicked");
                Some(HttpResponse::failed(ErrorCode::Unknown))
            }
        };

        match response {
            Some(response) if !self.state.is_cancelled() => {
                self.state.mark_scheduled();
                self.state.advance(RequestPhase::Completed);
                let delivery = FinalizeOnDrop {
                    engine: self.engine.clone(),
                    state: Arc::clone(&self.state),
                };
                self.sender.post(move || deliver(delivery, callback, response));
            }
            _ => {
                // Cancelled before or after the last checkpoint: nothing is
                // delivered and the partial response is dropped here.
                self.state.advance(RequestPhase::Cancelled);
                tracing::debug!(id, "request cancelled before delivery");
            }
        }
        self.state.completion.signal();
    }

    fn exchange(&self, request: &PreparedRequest) -> Result<HttpResponse, Abort> {
        let state = &*self.state;

        state.checkpoint(Checkpoint::BeforeConnect)?;
        state.advance(RequestPhase::Sending);
        let mut exchange = self.transport.open(request)?;
        state.checkpoint(Checkpoint::Connected)?;
        exchange.send()?;
        state.checkpoint(Checkpoint::Sent)?;

        state.advance(RequestPhase::AwaitingResponse);
        let head = exchange.receive_head()?;
        state.checkpoint(Checkpoint::HeadersReceived)?;

        state.advance(RequestPhase::StreamingBody);
        let mut chunk = Buffer::allocate(self.config.chunk_size).map_err(|_| Abort::OutOfMemory)?;
        let mut body = Vec::new();
        loop {
            let read = exchange.read_chunk(chunk.as_mut_slice())?;
            state.checkpoint(Checkpoint::BodyChunk)?;
            if read == 0 {
                break;
            }
            if body.len() + read > self.config.max_body_bytes {
                return Err(Abort::OutOfMemory);
            }
            body.try_reserve(read).map_err(|_| Abort::OutOfMemory)?;
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse {
            error: ErrorCode::Ok,
            status: head.status,
            headers: head.headers,
            body: Buffer::from_vec(body),
        })
    }
}

/// Runs on the owning thread. `finalizer` is dropped last, after the
/// callback returned or unwound.
fn deliver(finalizer: FinalizeOnDrop, callback: ResponseCallback, response: HttpResponse) {
    if finalizer.state.is_cancelled() {
        tracing::debug!(id = finalizer.state.id, "delivery suppressed by cancel");
        return;
    }
    if let Some(engine) = finalizer.engine.upgrade() {
        engine.counters.delivered.fetch_add(1, Ordering::Relaxed);
    }
    callback(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::transport::{Exchange, ResponseHead};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Which transport step should stall.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Open,
        Send,
        Head,
        Chunk,
    }

    /// Serves a fixed response; the chosen step sleeps first.
    struct ScriptedTransport {
        stall_at: Option<Step>,
        stall: Duration,
        chunks: usize,
        fail_send: bool,
        entered: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn instant() -> Self {
            Self {
                stall_at: None,
                stall: Duration::ZERO,
                chunks: 3,
                fail_send: false,
                entered: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn stalling(step: Step, stall: Duration) -> Self {
            Self {
                stall_at: Some(step),
                stall,
                ..Self::instant()
            }
        }
    }

    struct ScriptedExchange {
        stall_at: Option<Step>,
        stall: Duration,
        chunks_left: usize,
        fail_send: bool,
        entered: Arc<AtomicUsize>,
    }

    impl ScriptedExchange {
        fn step(&self, step: Step) {
            if self.stall_at == Some(step) {
                self.entered.fetch_add(1, Ordering::SeqCst);
                thread::sleep(self.stall);
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn open(&self, _request: &PreparedRequest) -> Result<Box<dyn Exchange>, TransportError> {
            let exchange = ScriptedExchange {
                stall_at: self.stall_at,
                stall: self.stall,
                chunks_left: self.chunks,
                fail_send: self.fail_send,
                entered: Arc::clone(&self.entered),
            };
            exchange.step(Step::Open);
            Ok(Box::new(exchange))
        }
    }

    impl Exchange for ScriptedExchange {
        fn send(&mut self) -> Result<(), TransportError> {
            self.step(Step::Send);
            if self.fail_send {
                return Err(TransportError::Connect("refused".into()));
            }
            Ok(())
        }

        fn receive_head(&mut self) -> Result<ResponseHead, TransportError> {
            self.step(Step::Head);
            Ok(ResponseHead {
                status: 200,
                headers: vec![("x-step".into(), "head".into())],
            })
        }

        fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            if self.chunks_left == 0 {
                return Ok(0);
            }
            self.step(Step::Chunk);
            self.chunks_left -= 1;
            buf[..4].copy_from_slice(b"data");
            Ok(4)
        }
    }

    fn engine(event_loop: &EventLoop, transport: ScriptedTransport) -> NetworkEngine {
        NetworkEngine::with_transport(event_loop.sender(), NetConfig::default(), Arc::new(transport))
    }

    fn pump_until(event_loop: &EventLoop, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            event_loop.pump(Duration::from_millis(5));
        }
    }

    fn wait_entered(entered: &AtomicUsize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while entered.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn completed_request_is_delivered_once_on_owner() {
        let event_loop = EventLoop::new();
        let engine = engine(&event_loop, ScriptedTransport::instant());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&delivered);

        let handle = engine
            .submit(HttpRequest::get("http://example.test/"), move |response| {
                slot.lock().unwrap().push((thread::current().id(), response));
            })
            .unwrap();

        pump_until(&event_loop, || engine.in_flight() == 0);

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let (thread_id, response) = &delivered[0];
        assert_eq!(*thread_id, event_loop.owner());
        assert_eq!(response.error, ErrorCode::Ok);
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_slice(), b"datadatadata");
        assert_eq!(engine.phase(handle), None);
        assert_eq!(
            engine.stats(),
            EngineStats {
                submitted: 1,
                delivered: 1,
                cancelled: 0,
                finalized: 1
            }
        );
    }

    #[test]
    fn malformed_request_spawns_nothing() {
        let event_loop = EventLoop::new();
        let engine = engine(&event_loop, ScriptedTransport::instant());
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);
        let err = engine
            .submit(HttpRequest::get("no-scheme"), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();
        assert!(matches!(err, PlatformError::BadArgument(_)));
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.stats().submitted, 0);
        event_loop.pump(Duration::from_millis(20));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transport_failure_still_calls_back() {
        let event_loop = EventLoop::new();
        let transport = ScriptedTransport {
            fail_send: true,
            ..ScriptedTransport::instant()
        };
        let engine = engine(&event_loop, transport);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&errors);
        engine
            .submit(HttpRequest::get("http://example.test/"), move |response| {
                slot.lock().unwrap().push(response.error);
            })
            .unwrap();
        pump_until(&event_loop, || engine.in_flight() == 0);
        assert_eq!(*errors.lock().unwrap(), vec![ErrorCode::Unknown]);
    }

    #[test]
    fn oversized_body_reports_out_of_memory() {
        let event_loop = EventLoop::new();
        let config = NetConfig {
            max_body_bytes: 6,
            ..NetConfig::default()
        };
        let engine = NetworkEngine::with_transport(
            event_loop.sender(),
            config,
            Arc::new(ScriptedTransport::instant()),
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&errors);
        engine
            .submit(HttpRequest::get("http://example.test/"), move |response| {
                slot.lock().unwrap().push(response.error);
            })
            .unwrap();
        pump_until(&event_loop, || engine.in_flight() == 0);
        assert_eq!(*errors.lock().unwrap(), vec![ErrorCode::OutOfMemory]);
    }

    #[test]
    fn cancel_during_each_step_suppresses_callback() {
        for step in [Step::Open, Step::Send, Step::Head, Step::Chunk] {
            let event_loop = EventLoop::new();
            let transport = ScriptedTransport::stalling(step, Duration::from_millis(50));
            let entered = Arc::clone(&transport.entered);
            let engine = engine(&event_loop, transport);
            let called = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&called);

            let handle = engine
                .submit(HttpRequest::get("http://example.test/"), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            wait_entered(&entered);
            engine.cancel(handle);

            assert_eq!(engine.in_flight(), 0, "{step:?}: not finalized by cancel");
            assert_eq!(engine.phase(handle), None);
            event_loop.pump(Duration::from_millis(50));
            assert_eq!(called.load(Ordering::SeqCst), 0, "{step:?}: callback fired");
            assert_eq!(engine.stats().finalized, 1, "{step:?}");
            assert_eq!(engine.stats().cancelled, 1, "{step:?}");
        }
    }

    #[test]
    fn cancel_after_scheduling_leaves_finalize_to_delivery() {
        let event_loop = EventLoop::new();
        let engine = engine(&event_loop, ScriptedTransport::instant());
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);
        let handle = engine
            .submit(HttpRequest::get("http://example.test/"), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Without pumping, the delivery task stays queued.
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.phase(handle) != Some(RequestPhase::Completed) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        engine.cancel(handle);
        assert_eq!(engine.in_flight(), 1);

        pump_until(&event_loop, || engine.in_flight() == 0);
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(engine.stats().finalized, 1);
    }

    #[test]
    fn concurrent_cancels_finalize_once() {
        let event_loop = EventLoop::new();
        let transport = ScriptedTransport::stalling(Step::Head, Duration::from_millis(30));
        let engine = Arc::new(engine(&event_loop, transport));
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);
        let handle = engine
            .submit(HttpRequest::get("http://example.test/"), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let cancellers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.cancel(handle))
            })
            .collect();
        for canceller in cancellers {
            canceller.join().unwrap();
        }
        event_loop.pump(Duration::from_millis(20));

        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(engine.stats().finalized, 1);
        assert_eq!(engine.stats().cancelled, 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn racing_cancel_and_completion_never_double_deliver() {
        let event_loop = EventLoop::new();
        let engine = Arc::new(engine(&event_loop, ScriptedTransport::instant()));
        let called = Arc::new(AtomicUsize::new(0));
        let rounds = 50;

        for round in 0..rounds {
            let counter = Arc::clone(&called);
            let handle = engine
                .submit(HttpRequest::get("http://example.test/"), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            let canceller = {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    if round % 2 == 0 {
                        thread::yield_now();
                    }
                    engine.cancel(handle);
                })
            };
            event_loop.pump(Duration::from_millis(1));
            canceller.join().unwrap();
        }
        pump_until(&event_loop, || engine.in_flight() == 0);

        let stats = engine.stats();
        assert_eq!(stats.submitted, rounds);
        assert_eq!(stats.finalized, rounds);
        assert!(called.load(Ordering::SeqCst) as u64 <= rounds);
        assert_eq!(called.load(Ordering::SeqCst) as u64, stats.delivered);
    }

    #[test]
    fn cancel_of_finished_handle_is_ignored() {
        let event_loop = EventLoop::new();
        let engine = engine(&event_loop, ScriptedTransport::instant());
        let handle = engine.submit(HttpRequest::get("http://example.test/"), |_| {}).unwrap();
        pump_until(&event_loop, || engine.in_flight() == 0);
        engine.cancel(handle);
        engine.cancel(RequestHandle::from_raw(999).unwrap());
        assert_eq!(engine.stats().finalized, 1);
        assert_eq!(engine.stats().cancelled, 0);
    }

    #[test]
    fn panicking_callback_still_finalizes() {
        let event_loop = EventLoop::new();
        let engine = engine(&event_loop, ScriptedTransport::instant());
        engine
            .submit(HttpRequest::get("http://example.test/"), |_| panic!("callback failure"))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.in_flight() > 0 && Instant::now() < deadline {
            let _ = catch_unwind(AssertUnwindSafe(|| event_loop.pump(Duration::from_millis(5))));
        }
        assert_eq!(engine.stats().finalized, 1);
    }

    #[test]
    fn cancel_all_clears_registry() {
        let event_loop = EventLoop::new();
        let engine = engine(&event_loop, ScriptedTransport::stalling(Step::Send, Duration::from_millis(20)));
        for _ in 0..3 {
            engine.submit(HttpRequest::get("http://example.test/"), |_| {}).unwrap();
        }
        engine.cancel_all();
        // No pumping: every request must be finalized by cancel_all itself.
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.stats().finalized, 3);
        assert_eq!(engine.stats().cancelled, 3);
    }

    #[test]
    fn cancel_all_waits_for_stalls_in_parallel() {
        let event_loop = EventLoop::new();
        let stall = Duration::from_millis(200);
        let transport = ScriptedTransport::stalling(Step::Head, stall);
        let entered = Arc::clone(&transport.entered);
        let engine = engine(&event_loop, transport);
        let called = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&called);
            engine
                .submit(HttpRequest::get("http://example.test/"), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while entered.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        engine.cancel_all();
        assert!(started.elapsed() < stall * 3, "cancel_all took {:?}", started.elapsed());
        assert_eq!(engine.in_flight(), 0);

        event_loop.pump(Duration::from_millis(20));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}
