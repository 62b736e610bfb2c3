//! Consumer configuration
//!
//! All duration knobs are plain millisecond fields so the struct serializes
//! cleanly; `Duration` accessors are provided for call sites.

use crate::error::{Result, TapError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default capacity of the message/error output queues and intake queues
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 256;

/// Default minimum number of bytes a fetch should wait for
pub const DEFAULT_FETCH_MIN_BYTES: i32 = 1;

/// Default number of bytes requested per partition per fetch (1 MB)
pub const DEFAULT_FETCH_DEFAULT_BYTES: i32 = 1024 * 1024;

/// Default per-partition fetch ceiling; 0 means no ceiling
pub const DEFAULT_FETCH_MAX_BYTES: i32 = 0;

/// Default broker-side long-poll hint in milliseconds
pub const DEFAULT_MAX_WAIT_MS: u64 = 250;

/// Default delay between leader re-route attempts in milliseconds
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2_000;

/// Default upper bound on a blocking fetch in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;

/// Default number of retries the wire client performs inside a metadata refresh
pub const DEFAULT_METADATA_RETRY_MAX: u32 = 3;

/// Default backoff between metadata retries in milliseconds
pub const DEFAULT_METADATA_RETRY_BACKOFF_MS: u64 = 250;

/// Configuration for a [`Consumer`](crate::Consumer) and the partition
/// consumers it creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Capacity of the message and error output queues, and of the
    /// per-broker subscription intake queues
    pub channel_buffer_size: usize,

    /// Minimum number of bytes the broker should wait for before answering
    /// a fetch
    pub fetch_min_bytes: i32,

    /// Number of bytes requested per partition in each fetch; grows
    /// geometrically when a message does not fit
    pub fetch_default_bytes: i32,

    /// Ceiling for the per-partition fetch size; 0 disables the ceiling
    pub fetch_max_bytes: i32,

    /// How long the broker may hold a fetch open waiting for
    /// `fetch_min_bytes`, in milliseconds
    pub max_wait_ms: u64,

    /// Delay between leader re-route attempts, in milliseconds
    pub retry_backoff_ms: u64,

    /// Emit recoverable errors on the per-partition error queue; when false
    /// they are dropped after driving the internal state transition
    pub return_errors: bool,

    /// Upper bound on any blocking fetch, in milliseconds
    pub read_timeout_ms: u64,

    /// Number of retries the wire client performs inside a single metadata
    /// refresh
    pub metadata_retry_max: u32,

    /// Backoff between metadata retries inside the wire client, in
    /// milliseconds
    pub metadata_retry_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            fetch_min_bytes: DEFAULT_FETCH_MIN_BYTES,
            fetch_default_bytes: DEFAULT_FETCH_DEFAULT_BYTES,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            return_errors: false,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            metadata_retry_max: DEFAULT_METADATA_RETRY_MAX,
            metadata_retry_backoff_ms: DEFAULT_METADATA_RETRY_BACKOFF_MS,
        }
    }
}

impl ConsumerConfig {
    /// Validate the configuration, rejecting values the engine cannot run
    /// with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_buffer_size == 0 {
            return Err(TapError::config("channel_buffer_size must be at least 1"));
        }
        if self.fetch_min_bytes <= 0 {
            return Err(TapError::config("fetch_min_bytes must be positive"));
        }
        if self.fetch_default_bytes <= 0 {
            return Err(TapError::config("fetch_default_bytes must be positive"));
        }
        if self.fetch_default_bytes < self.fetch_min_bytes {
            return Err(TapError::config(
                "fetch_default_bytes must be at least fetch_min_bytes",
            ));
        }
        if self.fetch_max_bytes < 0 {
            return Err(TapError::config("fetch_max_bytes must not be negative"));
        }
        if self.fetch_max_bytes > 0 && self.fetch_max_bytes < self.fetch_default_bytes {
            return Err(TapError::config(
                "fetch_max_bytes must be at least fetch_default_bytes when set",
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(TapError::config("read_timeout_ms must be positive"));
        }
        if self.max_wait_ms > self.read_timeout_ms {
            return Err(TapError::config(
                "max_wait_ms must not exceed read_timeout_ms",
            ));
        }
        Ok(())
    }

    /// Broker-side long-poll hint
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Delay between leader re-route attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Upper bound on any blocking fetch
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Backoff between metadata retries inside the wire client
    pub fn metadata_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.metadata_retry_backoff_ms)
    }
}
