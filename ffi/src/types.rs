//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Each type mirrors a core type with C-compatible representations: C
//! strings instead of `String`, pointer/length pairs instead of `Vec`, and
//! enums with explicit discriminants. Conversions live here to keep
//! `lib.rs` focused on the `extern "C"` surface.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};

use platform_core::buffer::RawBuffer;
use platform_core::error::{ErrorCode, PlatformError};
use platform_core::http::{HttpMethod, HttpRequest};

/// Version of `LbPlatformV1` this library fills in.
pub const LB_PLATFORM_ABI_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbErrorCode {
    Ok = 0,
    Unknown = 1,
    BadArgument = 2,
    NotSupported = 3,
    OutOfMemory = 4,
}

impl From<ErrorCode> for LbErrorCode {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Ok => LbErrorCode::Ok,
            ErrorCode::Unknown => LbErrorCode::Unknown,
            ErrorCode::BadArgument => LbErrorCode::BadArgument,
            ErrorCode::NotSupported => LbErrorCode::NotSupported,
            ErrorCode::OutOfMemory => LbErrorCode::OutOfMemory,
        }
    }
}

impl From<&PlatformError> for LbErrorCode {
    fn from(err: &PlatformError) -> Self {
        err.code().into()
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Task or timer callback; receives the context pointer it was registered
/// with.
pub type LbTaskFn = Option<unsafe extern "C" fn(ctx: *mut c_void)>;

/// Receives a response. The pointer is valid only during the call; the
/// header array and body data it names belong to the receiver.
pub type LbNetResponseCallback =
    Option<unsafe extern "C" fn(response: *const LbNetResponse, ctx: *mut c_void)>;

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Bytes owned by the receiver until passed to `buffer_free`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LbBuffer {
    pub data: *mut u8,
    pub size: usize,
}

impl From<RawBuffer> for LbBuffer {
    fn from(raw: RawBuffer) -> Self {
        Self {
            data: raw.data,
            size: raw.size,
        }
    }
}

// ---------------------------------------------------------------------------
// Network request / response
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbNetMethod {
    Get = 0,
    Post = 1,
    Put = 2,
    Delete = 3,
    /// Uses `LbNetRequestDesc::custom_method`.
    Custom = 4,
}

/// One header as a pair of UTF-8 C strings.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LbNetHeader {
    pub name: *const c_char,
    pub value: *const c_char,
}

/// A request as described by the caller. Only read during `net_request`;
/// everything is copied before it returns.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LbNetRequestDesc {
    pub method: LbNetMethod,
    pub custom_method: *const c_char,
    pub url_utf8: *const c_char,
    pub headers: *const LbNetHeader,
    pub header_count: usize,
    pub body: *const u8,
    pub body_size: usize,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LbNetResponse {
    pub error: LbErrorCode,
    pub http_status: u32,
    pub headers: *const LbNetHeader,
    pub header_count: usize,
    pub body: LbBuffer,
}

/// Read a required UTF-8 C string.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn required_str(ptr: *const c_char, what: &str) -> Result<String, PlatformError> {
    if ptr.is_null() {
        return Err(PlatformError::bad_argument(format!("{what} is null")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(str::to_owned)
        .map_err(|_| PlatformError::bad_argument(format!("{what} is not valid UTF-8")))
}

impl LbNetRequestDesc {
    /// Copy the described request into an owned `HttpRequest`.
    ///
    /// # Safety
    /// Every non-null pointer must be valid for the length it is paired with
    /// (or NUL-terminated, for strings).
    pub(crate) unsafe fn to_request(&self) -> Result<HttpRequest, PlatformError> {
        let method = match self.method {
            LbNetMethod::Get => HttpMethod::Get,
            LbNetMethod::Post => HttpMethod::Post,
            LbNetMethod::Put => HttpMethod::Put,
            LbNetMethod::Delete => HttpMethod::Delete,
            LbNetMethod::Custom => {
                HttpMethod::Custom(unsafe { required_str(self.custom_method, "custom_method") }?)
            }
        };
        let url = unsafe { required_str(self.url_utf8, "url_utf8") }?;

        let mut request = HttpRequest::new(method, url);
        request.flags = self.flags;

        if self.header_count > 0 {
            if self.headers.is_null() {
                return Err(PlatformError::bad_argument("headers is null but header_count > 0"));
            }
            let headers = unsafe { std::slice::from_raw_parts(self.headers, self.header_count) };
            request.headers.try_reserve_exact(headers.len())?;
            for header in headers {
                let name = unsafe { required_str(header.name, "header name") }?;
                let value = unsafe { required_str(header.value, "header value") }?;
                request.headers.push((name, value));
            }
        }

        if self.body_size > 0 {
            if self.body.is_null() {
                return Err(PlatformError::bad_argument("body is null but body_size > 0"));
            }
            let body = unsafe { std::slice::from_raw_parts(self.body, self.body_size) };
            request.body.try_reserve_exact(body.len())?;
            request.body.extend_from_slice(body);
        }
        Ok(request)
    }
}

/// Header array handed to a response callback, kept alive by the buffer
/// ledger until the receiver frees `entries`.
pub(crate) struct HeaderBlock {
    pub(crate) entries: Box<[LbNetHeader]>,
    _strings: Vec<CString>,
}

// The entries only point into `_strings`, which the block owns.
unsafe impl Send for HeaderBlock {}

impl HeaderBlock {
    pub(crate) fn new(headers: Vec<(String, String)>) -> Self {
        let mut strings = Vec::with_capacity(headers.len() * 2);
        let mut entries = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            let name = CString::new(name).unwrap_or_default();
            let value = CString::new(value).unwrap_or_default();
            entries.push(LbNetHeader {
                name: name.as_ptr(),
                value: value.as_ptr(),
            });
            strings.push(name);
            strings.push(value);
        }
        Self {
            entries: entries.into_boxed_slice(),
            _strings: strings,
        }
    }
}

// ---------------------------------------------------------------------------
// Function table
// ---------------------------------------------------------------------------

/// Version 1 of the platform function table.
///
/// Filled by `lb_query_platform_v1`. Callers compare `abi_version` with
/// `LB_PLATFORM_ABI_VERSION` before calling anything else.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LbPlatformV1 {
    pub abi_version: u32,

    pub init: Option<extern "C" fn() -> LbErrorCode>,
    pub shutdown: Option<extern "C" fn()>,

    pub run_event_loop: Option<extern "C" fn() -> c_int>,
    pub quit_event_loop: Option<extern "C" fn(code: c_int)>,

    pub post_task: Option<extern "C" fn(task: LbTaskFn, ctx: *mut c_void)>,

    pub timer_start:
        Option<extern "C" fn(ms: u32, repeat: c_int, cb: LbTaskFn, ctx: *mut c_void) -> *mut c_void>,
    pub timer_stop: Option<extern "C" fn(handle: *mut c_void)>,

    pub buffer_free: Option<extern "C" fn(ptr: *mut c_void)>,

    pub net_request: Option<
        extern "C" fn(
            desc: *const LbNetRequestDesc,
            cb: LbNetResponseCallback,
            ctx: *mut c_void,
            out_handle: *mut *mut c_void,
        ) -> LbErrorCode,
    >,
    pub net_request_cancel: Option<extern "C" fn(handle: *mut c_void)>,
}

impl LbPlatformV1 {
    /// An all-null table, for callers to pass to `lb_query_platform_v1`.
    pub const fn empty() -> Self {
        Self {
            abi_version: 0,
            init: None,
            shutdown: None,
            run_event_loop: None,
            quit_event_loop: None,
            post_task: None,
            timer_start: None,
            timer_stop: None,
            buffer_free: None,
            net_request: None,
            net_request_cancel: None,
        }
    }

    /// Check that the table matches this library's ABI and is fully filled.
    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.abi_version != LB_PLATFORM_ABI_VERSION {
            return Err(PlatformError::NotSupported(format!(
                "abi version {} (expected {LB_PLATFORM_ABI_VERSION})",
                self.abi_version
            )));
        }
        let complete = self.init.is_some()
            && self.shutdown.is_some()
            && self.run_event_loop.is_some()
            && self.quit_event_loop.is_some()
            && self.post_task.is_some()
            && self.timer_start.is_some()
            && self.timer_stop.is_some()
            && self.buffer_free.is_some()
            && self.net_request.is_some()
            && self.net_request_cancel.is_some();
        if !complete {
            return Err(PlatformError::NotSupported("function table has null entries".into()));
        }
        Ok(())
    }
}
