//! Task, timer and network services for a host platform layer.
//!
//! # Overview
//! A single owning thread runs an event loop. Timers and network requests
//! do their waiting on other threads and hand results back by posting tasks
//! to that loop, so every user callback runs on the owning thread.
//!
//! # Design
//! - `Platform` owns the `EventLoop` and cannot leave its thread;
//!   `PlatformHandle` is the cloneable, thread-safe way in.
//! - Handles (`TimerHandle`, `RequestHandle`) are ids looked up in
//!   registries, so a stale handle is ignored rather than dereferenced.
//! - Callbacks are `FnOnce` for requests: a response can be delivered at
//!   most once.
//! - Memory handed across a C boundary goes through `BufferLedger`, which
//!   refuses to free anything it did not hand out.

pub mod buffer;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod net;
pub mod platform;
mod sync;
pub mod task;
pub mod timer;
pub mod transport;

pub use buffer::{Buffer, BufferLedger, RawBuffer};
pub use config::{NetConfig, PlatformConfig, TimerConfig};
pub use error::{ErrorCode, PlatformError, TransportError};
pub use event_loop::{EventLoop, LoopControl, WakeSignal};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use net::{EngineStats, NetworkEngine, RequestHandle, RequestPhase};
pub use platform::{Platform, PlatformHandle};
pub use task::{Task, TaskQueue, TaskSender, WakeOwner};
pub use timer::{TimerHandle, TimerService};
pub use transport::{Exchange, HttpTransport, ResponseHead, Transport};
