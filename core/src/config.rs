//! Tunables for the platform services, loadable from TOML.
//!
//! Every field has a default, so an empty document (or no file at all) gives
//! a working configuration:
//!
//! ```toml
//! [net]
//! connect_timeout_ms = 5000
//! user_agent = "MyHost/2.0"
//!
//! [timers]
//! max_timers = 256
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::PlatformError;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    pub net: NetConfig,
    pub timers: TimerConfig,
}

/// Transport settings. Timeouts bound how long `cancel` may wait, since a
/// worker only observes cancellation between blocking steps.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct NetConfig {
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub body_timeout_ms: u64,
    pub chunk_size: usize,
    pub user_agent: String,
    pub max_body_bytes: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            response_timeout_ms: 30_000,
            body_timeout_ms: 30_000,
            chunk_size: 16 * 1024,
            user_agent: "LbPlatform/1.0".to_string(),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl NetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_millis(self.body_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    /// Registrations beyond this many live timers fail with `OutOfMemory`.
    pub max_timers: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { max_timers: 4096 }
    }
}

impl PlatformConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, PlatformError> {
        let config: PlatformConfig =
            toml::from_str(source).map_err(|e| PlatformError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlatformError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| PlatformError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.net.chunk_size == 0 {
            return Err(PlatformError::Config("net.chunk_size must be non-zero".into()));
        }
        if self.net.user_agent.contains(['\r', '\n']) {
            return Err(PlatformError::Config("net.user_agent must be a single line".into()));
        }
        for (name, value) in [
            ("net.connect_timeout_ms", self.net.connect_timeout_ms),
            ("net.response_timeout_ms", self.net.response_timeout_ms),
            ("net.body_timeout_ms", self.net.body_timeout_ms),
        ] {
            if value == 0 {
                return Err(PlatformError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.timers.max_timers == 0 {
            return Err(PlatformError::Config("timers.max_timers must be non-zero".into()));
        }
        Ok(())
    }
}
