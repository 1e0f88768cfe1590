//! Variable-length result payloads and the rules for releasing them.
//!
//! # Design
//! Inside Rust a payload is a `Buffer`: owned, not `Clone`, released by
//! dropping it. Moving it into a callback moves the only copy, so a payload
//! can never be both delivered and freed internally.
//!
//! Payloads that leave Rust through the C ABI are handed out by a
//! `BufferLedger`, which records every exported allocation under its address.
//! `release` is the single way back in: it frees a recorded allocation once
//! and rejects unknown or already-released pointers without touching memory.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::ops::Deref;
use std::sync::Mutex;

use crate::error::PlatformError;
use crate::sync::lock;

/// An owned byte payload produced by a platform service.
#[derive(Default, PartialEq, Eq)]
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    /// Allocate a zeroed buffer of `len` bytes.
    ///
    /// Returns `OutOfMemory` instead of aborting when the allocation fails.
    pub fn allocate(len: usize) -> Result<Self, PlatformError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        Ok(Self { bytes })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.bytes.len()).finish()
    }
}

/// Pointer/length pair describing a buffer handed across the boundary.
///
/// `data` is null when `size` is zero; nothing is recorded for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    pub data: *mut u8,
    pub size: usize,
}

impl RawBuffer {
    pub fn null() -> Self {
        Self {
            data: std::ptr::null_mut(),
            size: 0,
        }
    }
}

/// Registry of allocations currently owned by foreign code.
pub struct BufferLedger {
    live: Mutex<HashMap<usize, Box<dyn Send>>>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Hand `buffer` out as a raw pointer. The receiver must pass `data` to
    /// `release` exactly once (unless it is null).
    pub fn export(&self, buffer: Buffer) -> RawBuffer {
        if buffer.is_empty() {
            return RawBuffer::null();
        }
        let mut bytes = buffer.into_vec().into_boxed_slice();
        let data = bytes.as_mut_ptr();
        let size = bytes.len();
        self.adopt(data.cast::<c_void>(), bytes);
        RawBuffer { data, size }
    }

    /// Record `owner` as the allocation backing `ptr`.
    ///
    /// `ptr` must stay valid for as long as `owner` is alive, i.e. point into
    /// heap memory that `owner` owns.
    pub fn adopt<T: Send + 'static>(&self, ptr: *const c_void, owner: T) {
        let addr = ptr as usize;
        let previous = lock(&self.live).insert(addr, Box::new(owner));
        if previous.is_some() {
            tracing::error!(addr, "buffer ledger: address recorded twice");
        }
    }

    /// Free the allocation recorded for `ptr`. Null is a no-op.
    pub fn release(&self, ptr: *mut c_void) -> Result<(), PlatformError> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        let owner = lock(&self.live).remove(&addr);
        match owner {
            Some(owner) => {
                drop(owner);
                Ok(())
            }
            None => {
                tracing::error!(addr, "buffer_free: pointer is not a live platform buffer");
                Err(PlatformError::bad_argument(format!(
                    "pointer {addr:#x} was not allocated by the platform or was already released"
                )))
            }
        }
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }
}

impl Default for BufferLedger {
    fn default() -> Self {
        Self::new()
    }
}
