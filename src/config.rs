//! # Global runtime configuration.
//!
//! [`RuntimeConfig`] centralizes settings shared by the registry and every
//! connection worker. Per-connection overrides do not exist: one config is
//! chosen at startup and handed to the builder.
//!
//! ## Sentinel values
//! - `max_reconnecting = 0` → unlimited (no reconnect gate created)
//! - `connect_timeout = 0s` → no connect deadline

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policies::{ReconnectPolicy, RespawnPolicy};

/// Global configuration for the connectivity runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Deadline for one adapter connect attempt (`0s` = no deadline).
    pub connect_timeout: Duration,

    /// Deadline for a graceful close: in-flight publishes are flushed up
    /// to this long, then remaining work is dropped and logged.
    pub shutdown_grace: Duration,

    /// Bounded wait for a synchronous test-connection call.
    pub test_timeout: Duration,

    /// Process-wide cap on concurrently reconnecting connections
    /// (`0` = unlimited).
    pub max_reconnecting: usize,

    /// Reconnect backoff policy (base/max/jitter/stability window).
    pub reconnect: ReconnectPolicy,

    /// Bounded respawn policy for crashed workers.
    pub respawn: RespawnPolicy,

    /// Publish attempts per target before a delivery failure is reported.
    pub publish_attempts: u32,

    /// Mapping failures within [`Self::mapping_failure_window`] that raise
    /// the informational `MappingDegraded` health event.
    pub mapping_failure_threshold: u32,

    /// Sliding window for the mapping failure counter.
    pub mapping_failure_window: Duration,

    /// Capacity of the status-event broadcast ring buffer.
    pub bus_capacity: usize,

    /// Capacity of each worker's command channel.
    pub command_queue_capacity: usize,
}

impl RuntimeConfig {
    /// Connect deadline as an `Option` (`0s` = none).
    #[inline]
    pub fn connect_deadline(&self) -> Option<Duration> {
        if self.connect_timeout.is_zero() {
            None
        } else {
            Some(self.connect_timeout)
        }
    }

    /// Reconnect slot cap as an `Option` (`0` = unlimited).
    #[inline]
    pub fn reconnect_limit(&self) -> Option<usize> {
        if self.max_reconnecting == 0 {
            None
        } else {
            Some(self.max_reconnecting)
        }
    }
}

impl Default for RuntimeConfig {
    /// Defaults sized for a process supervising a few thousand
    /// connections:
    ///
    /// - `connect_timeout = 10s`, `shutdown_grace = 10s`, `test_timeout = 15s`
    /// - `max_reconnecting = 100` (reconnect-storm protection)
    /// - `publish_attempts = 3`
    /// - `mapping_failure_threshold = 10` per `60s` window
    /// - `bus_capacity = 1024`, `command_queue_capacity = 64`
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            test_timeout: Duration::from_secs(15),
            max_reconnecting: 100,
            reconnect: ReconnectPolicy::default(),
            respawn: RespawnPolicy::default(),
            publish_attempts: 3,
            mapping_failure_threshold: 10,
            mapping_failure_window: Duration::from_secs(60),
            bus_capacity: 1024,
            command_queue_capacity: 64,
        }
    }
}
