//! C-ABI wrapper around `platform-core`.
//!
//! # Overview
//! Exposes the event loop, timers, tasks and network requests through the
//! versioned `LbPlatformV1` function table so any host with a C FFI can use
//! them. `lb_query_platform_v1` fills the table; every entry is also
//! exported as a plain `extern "C"` symbol.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - The C ABI carries no context argument, so the library keeps three
//!   process-wide slots: the `Platform` itself (thread-local to the thread
//!   that called `lb_init`), a `PlatformHandle` for every other thread, and
//!   the buffer ledger behind `lb_buffer_free`.
//! - Timer and request handles are the core's numeric ids cast to
//!   pointers; stale handles are ignored rather than dereferenced.
//! - Response headers and body are separate allocations owned by the
//!   receiver, each released with `lb_buffer_free`.

pub mod types;

use std::cell::RefCell;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{LazyLock, Once, PoisonError, RwLock};
use std::time::Duration;

use platform_core::{
    BufferLedger, HttpResponse, Platform, PlatformConfig, PlatformError, PlatformHandle,
    RequestHandle, TimerHandle,
};
use tracing_subscriber::EnvFilter;

use types::*;

/// Environment variable holding the `tracing` filter (default `warn`).
pub const LOG_ENV: &str = "LB_PLATFORM_LOG";

/// Environment variable naming a TOML configuration file.
pub const CONFIG_ENV: &str = "LB_PLATFORM_CONFIG";

static LEDGER: LazyLock<BufferLedger> = LazyLock::new(BufferLedger::new);

static HANDLE: RwLock<Option<PlatformHandle>> = RwLock::new(None);

static LOGGING: Once = Once::new();

thread_local! {
    static PLATFORM: RefCell<Option<Rc<Platform>>> = const { RefCell::new(None) };
}

/// A C context pointer moved to the owning thread. The caller guarantees
/// it may be used from there.
#[derive(Clone, Copy)]
struct Context(*mut c_void);

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    fn get(self) -> *mut c_void {
        self.0
    }
}

fn current_handle() -> Option<PlatformHandle> {
    HANDLE.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn current_platform() -> Option<Rc<Platform>> {
    PLATFORM.with(|slot| slot.borrow().clone())
}

fn init_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
        // A host that installed its own subscriber keeps it.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn load_config() -> Result<PlatformConfig, PlatformError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PlatformConfig::load(path),
        None => Ok(PlatformConfig::default()),
    }
}

fn handle_to_ptr(raw: u64) -> *mut c_void {
    usize::try_from(raw).map_or(std::ptr::null_mut(), |addr| addr as *mut c_void)
}

fn ptr_to_raw(ptr: *mut c_void) -> u64 {
    ptr as usize as u64
}

// ---------------------------------------------------------------------------
// Function table
// ---------------------------------------------------------------------------

/// Fill `out` with the version 1 function table.
///
/// Returns `BadArgument` if `out` is null.
#[unsafe(no_mangle)]
pub extern "C" fn lb_query_platform_v1(out: *mut LbPlatformV1) -> LbErrorCode {
    if out.is_null() {
        return LbErrorCode::BadArgument;
    }
    let table = LbPlatformV1 {
        abi_version: LB_PLATFORM_ABI_VERSION,
        init: Some(lb_init),
        shutdown: Some(lb_shutdown),
        run_event_loop: Some(lb_run_event_loop),
        quit_event_loop: Some(lb_quit_event_loop),
        post_task: Some(lb_post_task),
        timer_start: Some(lb_timer_start),
        timer_stop: Some(lb_timer_stop),
        buffer_free: Some(lb_buffer_free),
        net_request: Some(lb_net_request),
        net_request_cancel: Some(lb_net_request_cancel),
    };
    unsafe { out.write(table) };
    LbErrorCode::Ok
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the platform with the calling thread as its owning thread.
///
/// Calling it again from the owning thread is a no-op; from another thread
/// while initialized it returns `NotSupported`. Reads `LB_PLATFORM_CONFIG`
/// when set; a bad file gives `BadArgument`.
#[unsafe(no_mangle)]
pub extern "C" fn lb_init() -> LbErrorCode {
    catch_unwind(|| {
        init_logging();
        if current_platform().is_some() {
            return LbErrorCode::Ok;
        }
        if current_handle().is_some() {
            tracing::warn!("lb_init: already initialized on another thread");
            return LbErrorCode::NotSupported;
        }

        let platform = match load_config().and_then(Platform::new) {
            Ok(platform) => platform,
            Err(e) => {
                tracing::error!(error = %e, "lb_init failed");
                return LbErrorCode::from(&e);
            }
        };
        *HANDLE.write().unwrap_or_else(PoisonError::into_inner) = Some(platform.handle());
        PLATFORM.with(|slot| *slot.borrow_mut() = Some(Rc::new(platform)));
        tracing::debug!("platform initialized");
        LbErrorCode::Ok
    })
    .unwrap_or(LbErrorCode::Unknown)
}

/// Tear the platform down. Owning thread only; elsewhere it does nothing.
///
/// Outstanding requests are cancelled and timers stopped; their callbacks
/// do not run. Buffers already handed out stay valid until freed.
#[unsafe(no_mangle)]
pub extern "C" fn lb_shutdown() {
    let _ = catch_unwind(|| {
        let Some(platform) = PLATFORM.with(|slot| slot.borrow_mut().take()) else {
            tracing::warn!("lb_shutdown: not the owning thread or not initialized");
            return;
        };
        HANDLE.write().unwrap_or_else(PoisonError::into_inner).take();
        platform.shutdown();
        drop(platform);
        tracing::debug!("platform shut down");
    });
}

/// Run the event loop until `lb_quit_event_loop`; returns its code.
///
/// Returns -1 immediately when called off the owning thread or before
/// `lb_init`.
#[unsafe(no_mangle)]
pub extern "C" fn lb_run_event_loop() -> c_int {
    catch_unwind(|| match current_platform() {
        Some(platform) => platform.run_event_loop(),
        None => {
            tracing::warn!("lb_run_event_loop: not the owning thread or not initialized");
            -1
        }
    })
    .unwrap_or(-1)
}

/// Ask the running loop to return `code`. Any thread.
#[unsafe(no_mangle)]
pub extern "C" fn lb_quit_event_loop(code: c_int) {
    let _ = catch_unwind(|| match current_handle() {
        Some(handle) => handle.quit_event_loop(code),
        None => tracing::warn!("lb_quit_event_loop before lb_init"),
    });
}

// ---------------------------------------------------------------------------
// Tasks and timers
// ---------------------------------------------------------------------------

/// Run `task(ctx)` on the owning thread. Any thread. Ignored when `task`
/// is null or the platform is not initialized.
#[unsafe(no_mangle)]
pub extern "C" fn lb_post_task(task: LbTaskFn, ctx: *mut c_void) {
    let ctx = Context(ctx);
    let _ = catch_unwind(|| {
        let Some(task) = task else {
            tracing::warn!("lb_post_task: null task");
            return;
        };
        let Some(handle) = current_handle() else {
            tracing::warn!("lb_post_task before lb_init");
            return;
        };
        let posted = handle.post_task(move || {
            let _ = catch_unwind(|| unsafe { task(ctx.get()) });
        });
        if let Err(e) = posted {
            tracing::warn!(error = %e, "lb_post_task");
        }
    });
}

/// Call `cb(ctx)` on the owning thread after `ms` milliseconds, and every
/// `ms` afterwards when `repeat` is non-zero.
///
/// Returns an opaque handle for `lb_timer_stop`, or null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn lb_timer_start(ms: u32, repeat: c_int, cb: LbTaskFn, ctx: *mut c_void) -> *mut c_void {
    let ctx = Context(ctx);
    catch_unwind(|| {
        let Some(cb) = cb else {
            return std::ptr::null_mut();
        };
        let Some(handle) = current_handle() else {
            tracing::warn!("lb_timer_start before lb_init");
            return std::ptr::null_mut();
        };
        let period = Duration::from_millis(u64::from(ms));
        let started = handle.timer_start(period, repeat != 0, move || {
            let _ = catch_unwind(|| unsafe { cb(ctx.get()) });
        });
        match started {
            Ok(timer) => handle_to_ptr(timer.as_raw()),
            Err(e) => {
                tracing::warn!(error = %e, "lb_timer_start");
                std::ptr::null_mut()
            }
        }
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Stop a timer. Unknown, finished and null handles are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn lb_timer_stop(timer: *mut c_void) {
    let _ = catch_unwind(|| {
        let (Some(handle), Some(timer)) = (current_handle(), TimerHandle::from_raw(ptr_to_raw(timer)))
        else {
            return;
        };
        handle.timer_stop(timer);
    });
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Release a header array or body handed out by this library. Safe to call
/// with null. Unknown or already freed pointers are rejected and logged;
/// memory is not touched.
#[unsafe(no_mangle)]
pub extern "C" fn lb_buffer_free(ptr: *mut c_void) {
    let _ = catch_unwind(|| {
        let _ = LEDGER.release(ptr);
    });
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Start an HTTP request. `cb(response, ctx)` runs once on the owning
/// thread unless the request is cancelled first.
///
/// On success writes the request handle to `out_handle` (when non-null)
/// and returns `Ok`. Malformed descriptors return `BadArgument` and `cb` is
/// never called.
#[unsafe(no_mangle)]
pub extern "C" fn lb_net_request(
    desc: *const LbNetRequestDesc,
    cb: LbNetResponseCallback,
    ctx: *mut c_void,
    out_handle: *mut *mut c_void,
) -> LbErrorCode {
    let ctx = Context(ctx);
    catch_unwind(AssertUnwindSafe(|| {
        if !out_handle.is_null() {
            unsafe { out_handle.write(std::ptr::null_mut()) };
        }
        if desc.is_null() {
            return LbErrorCode::BadArgument;
        }
        let Some(cb) = cb else {
            return LbErrorCode::BadArgument;
        };
        let Some(handle) = current_handle() else {
            tracing::warn!("lb_net_request before lb_init");
            return LbErrorCode::NotSupported;
        };

        let request = match unsafe { (*desc).to_request() } {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "lb_net_request: rejected descriptor");
                return LbErrorCode::from(&e);
            }
        };
        let submitted = handle.net_request(request, move |response| deliver(response, cb, ctx));
        match submitted {
            Ok(request) => {
                if !out_handle.is_null() {
                    unsafe { out_handle.write(handle_to_ptr(request.as_raw())) };
                }
                LbErrorCode::Ok
            }
            Err(e) => {
                tracing::warn!(error = %e, "lb_net_request");
                LbErrorCode::from(&e)
            }
        }
    }))
    .unwrap_or(LbErrorCode::Unknown)
}

/// Cancel a request; blocks until its worker stops. After this returns the
/// callback will not run. Unknown, finished and null handles are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn lb_net_request_cancel(request: *mut c_void) {
    let _ = catch_unwind(|| {
        let (Some(handle), Some(request)) =
            (current_handle(), RequestHandle::from_raw(ptr_to_raw(request)))
        else {
            return;
        };
        handle.net_request_cancel(request);
    });
}

/// Export `response` through the ledger and hand it to the C callback.
fn deliver(
    response: HttpResponse,
    cb: unsafe extern "C" fn(*const LbNetResponse, *mut c_void),
    ctx: Context,
) {
    let HttpResponse {
        error,
        status,
        headers,
        body,
    } = response;

    let header_count = headers.len();
    let headers_ptr = if headers.is_empty() {
        std::ptr::null()
    } else {
        let block = HeaderBlock::new(headers);
        let ptr = block.entries.as_ptr();
        LEDGER.adopt(ptr.cast(), block);
        ptr
    };
    let body = LEDGER.export(body);

    let c_response = LbNetResponse {
        error: error.into(),
        http_status: u32::from(status),
        headers: headers_ptr,
        header_count,
        body: body.into(),
    };
    if catch_unwind(|| unsafe { cb(&c_response, ctx.get()) }).is_err() {
        tracing::error!("net response callback panicked");
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
