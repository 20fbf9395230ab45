//! Runtime configuration for reactors, socket adapters, and WebSocket
//! sessions.
//!
//! Each configuration struct follows the builder pattern: start from
//! [`Default`], override individual knobs with the consuming setters, and
//! pass the result to the owning component's constructor. Validation happens
//! at construction time; a zero batch size or buffer size is a configuration
//! error, not a runtime surprise.

use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The multiplex batch size must be at least 1.
    #[error("event batch size must be non-zero")]
    ZeroBatchSize,
    /// The per-cycle write cap must be at least 1 byte.
    #[error("per-cycle write cap must be non-zero")]
    ZeroWriteCap,
    /// The read scratch buffer must be at least 1 byte.
    #[error("read buffer size must be non-zero")]
    ZeroReadBuffer,
    /// The maximum frame payload must be at least 125 bytes (a control
    /// frame's worth).
    #[error("maximum payload must be at least 125 bytes")]
    PayloadCapTooSmall,
}

/// Per-reactor configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on the multiplex timeout.
    ///
    /// The reactor never blocks longer than this, even with no timer due,
    /// so that stop flags and clock skew are observed within a bounded
    /// interval.
    ///
    /// Default: 5 seconds.
    pub max_sleep: Duration,

    /// Maximum readiness events delivered per cycle by the epoll backend.
    ///
    /// Remaining ready descriptors are delivered in the next cycle.
    ///
    /// Default: 64.
    pub event_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_sleep: Duration::from_secs(5),
            event_batch: 64,
        }
    }
}

impl ReactorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the multiplex timeout cap.
    #[must_use]
    pub fn max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }

    /// Sets the per-cycle event batch size.
    #[must_use]
    pub fn event_batch(mut self, event_batch: usize) -> Self {
        self.event_batch = event_batch;
        self
    }

    /// Checks the configuration for nonsensical values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_batch == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// Per-adapter socket tuning.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// `TCP_NOTSENT_LOWAT` value applied at attach, where the platform
    /// supports it. Bounds the unsent bytes the kernel buffers before
    /// withholding writability, which is what makes application-level
    /// backpressure meaningful.
    ///
    /// Default: 4096 bytes.
    pub unsent_lowat: usize,

    /// Maximum bytes handed to the kernel per writability edge.
    ///
    /// Keeps one connection from monopolizing a cycle.
    ///
    /// Default: 2048 bytes.
    pub write_cap: usize,

    /// Size of the read scratch buffer; also the largest slice a receive
    /// callback will ever see.
    ///
    /// Default: 65536 bytes.
    pub read_buffer: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            unsent_lowat: 4096,
            write_cap: 2048,
            read_buffer: 65536,
        }
    }
}

impl AdapterConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `TCP_NOTSENT_LOWAT` hint.
    #[must_use]
    pub fn unsent_lowat(mut self, bytes: usize) -> Self {
        self.unsent_lowat = bytes;
        self
    }

    /// Sets the per-cycle write cap.
    #[must_use]
    pub fn write_cap(mut self, bytes: usize) -> Self {
        self.write_cap = bytes;
        self
    }

    /// Sets the read scratch buffer size.
    #[must_use]
    pub fn read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes;
        self
    }

    /// Checks the configuration for nonsensical values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_cap == 0 {
            return Err(ConfigError::ZeroWriteCap);
        }
        if self.read_buffer == 0 {
            return Err(ConfigError::ZeroReadBuffer);
        }
        Ok(())
    }
}

/// Per-session WebSocket limits.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Maximum frame payload accepted from a peer; larger frames are a
    /// protocol error. Also caps the reassembled size of a fragmented
    /// message.
    ///
    /// Default: 16 MiB.
    pub max_payload: usize,

    /// Maximum size of the HTTP header block during the handshake.
    ///
    /// Default: 65536 bytes.
    pub max_header_block: usize,

    /// How long a clean close waits for the peer's Close frame before
    /// closing the socket anyway.
    ///
    /// Default: 5 seconds.
    pub close_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_payload: 16 * 1024 * 1024,
            max_header_block: 65536,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl WsConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum frame payload.
    #[must_use]
    pub fn max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Sets the maximum handshake header-block size.
    #[must_use]
    pub fn max_header_block(mut self, bytes: usize) -> Self {
        self.max_header_block = bytes;
        self
    }

    /// Sets the clean-close timeout.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Checks the configuration for nonsensical values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload < 125 {
            return Err(ConfigError::PayloadCapTooSmall);
        }
        Ok(())
    }
}
