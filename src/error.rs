//! Error types used by the linkvisor runtime and connection workers.
//!
//! The taxonomy follows the failure classes of the bridging pipeline:
//!
//! - [`ConnectError`]: adapter connect/session faults, classified
//!   transient (auto-retried with backoff) or permanent (no auto-retry).
//! - [`MappingError`]: payload/transform faults, isolated per message.
//! - [`ValidationRejection`]: authorization/consistency failures returned
//!   to the command originator; the connection stays healthy.
//! - [`DeliveryError`]: publish to a target failed after bounded retries.
//! - [`RegistryError`]: management command rejections from the registry.
//!
//! All types provide `as_label()` for stable snake_case log/metric keys.

use std::time::Duration;
use thiserror::Error;

/// Adapter connect or session failure.
///
/// The transient/permanent split drives the state machine: transient errors
/// schedule a reconnect through the backoff policy, permanent errors move
/// the connection to `Failed` and wait for operator action.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    /// Reachable-but-failing adapter issue (broker restart, network blip).
    #[error("transient connect failure: {reason}")]
    Transient {
        /// Human-readable failure description.
        reason: String,
    },

    /// Misconfiguration that retrying cannot fix (bad credentials, bad URI).
    #[error("permanent connect failure: {reason}")]
    Permanent {
        /// Human-readable failure description.
        reason: String,
    },

    /// Connect attempt exceeded its configured deadline.
    #[error("connect timed out after {timeout:?}")]
    Timeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },
}

impl ConnectError {
    /// Shorthand for a transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        ConnectError::Transient {
            reason: reason.into(),
        }
    }

    /// Shorthand for a permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        ConnectError::Permanent {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the worker should schedule a reconnect.
    ///
    /// Timeouts count as transient: the broker may simply be slow to accept
    /// sessions while restarting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::Transient { .. } | ConnectError::Timeout { .. }
        )
    }

    /// Returns a short stable label (snake_case) for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConnectError::Transient { .. } => "connect_transient",
            ConnectError::Permanent { .. } => "connect_permanent",
            ConnectError::Timeout { .. } => "connect_timeout",
        }
    }
}

/// Per-message mapping failure.
///
/// Never aborts the connection: the inbound pipeline counts it, logs it and
/// optionally routes the offending payload to a dead-letter target.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum MappingError {
    /// Payload could not be decoded (bad encoding, truncated frame).
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// Decoder diagnostic.
        reason: String,
    },

    /// The transform itself failed on a decodable payload.
    #[error("transform '{mapping}' failed: {reason}")]
    TransformFailed {
        /// Mapping reference that was applied.
        mapping: String,
        /// Transform diagnostic.
        reason: String,
    },

    /// A source or target referenced a mapping absent from the context.
    #[error("unknown mapping reference '{mapping}'")]
    UnknownMapping {
        /// The unresolved mapping reference.
        mapping: String,
    },
}

impl MappingError {
    /// Returns a short stable label (snake_case) for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            MappingError::MalformedPayload { .. } => "mapping_malformed_payload",
            MappingError::TransformFailed { .. } => "mapping_transform_failed",
            MappingError::UnknownMapping { .. } => "mapping_unknown_reference",
        }
    }
}

/// Authorization or consistency failure raised by a validation interceptor.
///
/// Returned to the command originator as an error response; the worker and
/// its connection are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command rejected: {reason}")]
pub struct ValidationRejection {
    /// Human-readable rejection cause.
    pub reason: String,
}

impl ValidationRejection {
    /// Creates a rejection with the given cause.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Publish to one target failed after the bounded retry budget.
///
/// Reported per target; other targets and the connection state are
/// unaffected.
#[derive(Error, Debug, Clone)]
#[error("delivery to '{address}' failed after {attempts} attempts: {reason}")]
pub struct DeliveryError {
    /// Target address the publish was bound for.
    pub address: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last failure description.
    pub reason: String,
}

/// Management command rejection from the registry.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A connection with this id already exists.
    #[error("connection '{id}' already exists")]
    AlreadyExists {
        /// The duplicate id.
        id: String,
    },

    /// No connection with this id is known.
    #[error("connection '{id}' not found")]
    NotFound {
        /// The unknown id.
        id: String,
    },

    /// The descriptor failed structural validation.
    #[error("invalid connection descriptor: {reason}")]
    InvalidConnection {
        /// What was wrong with the descriptor.
        reason: String,
    },

    /// The worker's command channel is gone (worker exited or was removed).
    #[error("connection '{id}' is not accepting commands")]
    WorkerUnavailable {
        /// The affected id.
        id: String,
    },

    /// A factory refused to build a worker for this connection.
    #[error("worker factory rejected connection '{id}': {reason}")]
    FactoryRejected {
        /// The affected id.
        id: String,
        /// Factory diagnostic.
        reason: String,
    },

    /// Durable store operation failed.
    #[error("connection store failure: {reason}")]
    Store {
        /// Store diagnostic.
        reason: String,
    },

    /// The registry is shutting down and no longer accepts commands.
    #[error("registry is shut down")]
    ShutDown,

    /// A synchronous test-connection call did not finish within its timeout.
    #[error("test connection timed out after {timeout:?}")]
    TestTimeout {
        /// The bounded wait that elapsed.
        timeout: Duration,
    },

    /// A synchronous test-connection call finished with a failure.
    #[error("test connection failed: {0}")]
    TestFailed(#[from] ConnectError),
}

impl RegistryError {
    /// Returns a short stable label (snake_case) for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RegistryError::AlreadyExists { .. } => "registry_already_exists",
            RegistryError::NotFound { .. } => "registry_not_found",
            RegistryError::InvalidConnection { .. } => "registry_invalid_connection",
            RegistryError::WorkerUnavailable { .. } => "registry_worker_unavailable",
            RegistryError::FactoryRejected { .. } => "registry_factory_rejected",
            RegistryError::Store { .. } => "registry_store_failure",
            RegistryError::ShutDown => "registry_shut_down",
            RegistryError::TestTimeout { .. } => "registry_test_timeout",
            RegistryError::TestFailed(_) => "registry_test_failed",
        }
    }
}
