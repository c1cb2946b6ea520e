//! # Status events emitted by the registry and connection workers.
//!
//! [`EventKind`] classifies events across four categories:
//! - **State events**: every state-machine transition, carrying
//!   `{timestamp, prior_state, new_state, reason}`
//! - **Pipeline events**: mapping failures, mapping health, delivery
//!   failures, validation rejections
//! - **Management events**: connection created/modified/removed, worker
//!   respawns
//! - **Runtime events**: shutdown progress
//!
//! ## Ordering
//! Every event carries a globally unique, monotonically increasing `seq`;
//! use it to restore order when events are observed out of band.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::machine::ConnectionState;
use crate::model::ConnectionId;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of connectivity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === State machine ===
    /// A connection's actual state changed.
    ///
    /// Sets: `connection`, `prior_state`, `new_state`, `reason` (optional).
    StateChanged,

    /// A reconnect attempt was scheduled after a transient failure.
    ///
    /// Sets: `connection`, `delay`, `attempt`, `reason`.
    ReconnectScheduled,

    /// A connection ready to retry is waiting for a reconnect slot
    /// (process-wide cap reached).
    ///
    /// Sets: `connection`, `attempt`.
    ReconnectQueued,

    // === Mapping / delivery pipeline ===
    /// One inbound message failed mapping (isolated, counted).
    ///
    /// Sets: `connection`, `reason`.
    MappingFailed,

    /// The mapping failure rate crossed the configured threshold.
    /// Informational: it does not force a state transition.
    ///
    /// Sets: `connection`, `attempt` (= failure count in window).
    MappingDegraded,

    /// A payload that failed mapping was routed to a dead-letter target.
    ///
    /// Sets: `connection`, `reason` (= dead-letter address).
    DeadLettered,

    /// Publish to one target failed after bounded retries.
    ///
    /// Sets: `connection`, `reason`, `attempt` (= attempts made).
    DeliveryFailed,

    /// A mapped command was rejected by the validation interceptor.
    ///
    /// Sets: `connection`, `reason`.
    ValidationRejected,

    // === Management ===
    /// A connection descriptor was created and its worker spawned.
    ///
    /// Sets: `connection`.
    ConnectionCreated,

    /// A connection descriptor was replaced.
    ///
    /// Sets: `connection`.
    ConnectionModified,

    /// A connection was deleted and its worker removed.
    ///
    /// Sets: `connection`.
    ConnectionRemoved,

    /// A crashed worker was respawned.
    ///
    /// Sets: `connection`, `attempt` (= respawn count), `delay`.
    WorkerRespawned,

    /// A worker exhausted its respawn budget; the connection is `Failed`.
    ///
    /// Sets: `connection`, `reason`.
    WorkerExhausted,

    // === Runtime ===
    /// Registry shutdown requested.
    ShutdownRequested,

    /// All workers stopped within the grace window.
    AllStoppedWithin,

    /// Grace window exceeded; remaining workers were force-released.
    GraceExceeded,

    /// A subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `reason` (subscriber and cause).
    SubscriberOverflow,

    /// A subscriber panicked while processing an event.
    ///
    /// Sets: `reason` (subscriber and panic info).
    SubscriberPanicked,
}

/// Connectivity status event with optional metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Connection the event belongs to, if any.
    pub connection: Option<ConnectionId>,
    /// Prior state for `StateChanged`.
    pub prior_state: Option<ConnectionState>,
    /// New state for `StateChanged`.
    pub new_state: Option<ConnectionState>,
    /// Human-readable reason (errors, rejection causes, addresses).
    pub reason: Option<Arc<str>>,
    /// Backoff delay for reconnects/respawns.
    pub delay: Option<Duration>,
    /// Attempt or counter value, depending on the kind.
    pub attempt: Option<u32>,
}

impl Event {
    /// Creates an event of the given kind with the current timestamp and
    /// the next global sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            connection: None,
            prior_state: None,
            new_state: None,
            reason: None,
            delay: None,
            attempt: None,
        }
    }

    /// Attaches the connection id.
    #[inline]
    pub fn with_connection(mut self, id: &ConnectionId) -> Self {
        self.connection = Some(id.clone());
        self
    }

    /// Attaches a state transition.
    #[inline]
    pub fn with_transition(mut self, prior: ConnectionState, new: ConnectionState) -> Self {
        self.prior_state = Some(prior);
        self.new_state = Some(new);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a delay.
    #[inline]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Attaches an attempt/counter value.
    #[inline]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}
