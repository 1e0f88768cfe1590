//! Error types shared by every platform service.
//!
//! # Design
//! `ErrorCode` is the flat, wire-stable classification that crosses the
//! function-table boundary (synchronously or inside a response). Rust callers
//! see `PlatformError`, which carries a message for logs and collapses to an
//! `ErrorCode` through `code()`. Transport failures get their own
//! `TransportError` so the worker can log the detail while the caller only
//! ever sees `ErrorCode::Unknown`.

use thiserror::Error;

/// Result classification surfaced to callers of the platform layer.
///
/// The discriminants are part of the ABI and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    Unknown = 1,
    BadArgument = 2,
    NotSupported = 3,
    OutOfMemory = 4,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

/// Errors returned synchronously by platform operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Malformed input. Detected before any resource is allocated.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The capability is unavailable (for example, used before `init`).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An allocation or a bounded resource could not be obtained.
    #[error("out of memory")]
    OutOfMemory,

    /// OS or runtime failure outside the caller's control.
    #[error("platform failure: {0}")]
    Unknown(String),

    /// Configuration could not be read or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PlatformError {
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        PlatformError::BadArgument(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            PlatformError::BadArgument(_) | PlatformError::Config(_) => ErrorCode::BadArgument,
            PlatformError::NotSupported(_) => ErrorCode::NotSupported,
            PlatformError::OutOfMemory => ErrorCode::OutOfMemory,
            PlatformError::Unknown(_) => ErrorCode::Unknown,
        }
    }
}

impl From<std::collections::TryReserveError> for PlatformError {
    fn from(_: std::collections::TryReserveError) -> Self {
        PlatformError::OutOfMemory
    }
}

/// Failure of one step of a transport exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}
