//! # Protocol adapter seam.
//!
//! An adapter is the uniform capability the runtime drives for one broker
//! kind: open a transport session, yield inbound messages, accept
//! publishes, shut down. Wire parsing internals live behind this seam and
//! are never specified here.
//!
//! ## Contract
//! - [`ProtocolAdapter::connect`] classifies failures via
//!   [`ConnectError`](crate::error::ConnectError): transient errors are
//!   retried with backoff, permanent errors park the connection in
//!   `Failed`.
//! - A session reports loss of connectivity (keepalive/heartbeat timeout)
//!   as [`SessionEvent::Lost`]; the worker reacts, the adapter never
//!   reconnects on its own.
//! - `connect` with `dry_run = true` must not persist subscriptions; it is
//!   used by the one-shot test-connection path.

mod memory;

pub use memory::{MemoryAdapter, MemoryBroker};

use async_trait::async_trait;

use crate::error::ConnectError;
use crate::model::{Connection, ConnectionType, ExternalMessage};

/// One inbound occurrence on a live session.
#[derive(Debug)]
pub enum SessionEvent {
    /// A message arrived on the source with the given index (position in
    /// the connection's ordered source list).
    Inbound {
        source_index: usize,
        message: ExternalMessage,
    },
    /// The session died (heartbeat timeout, broker went away).
    Lost { reason: String },
}

/// A live transport session produced by [`ProtocolAdapter::connect`].
#[async_trait]
pub trait AdapterSession: Send {
    /// Yields the next session event, or `None` once the session is
    /// closed and drained.
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// Publishes one message to the given target address.
    async fn publish(
        &mut self,
        address: &str,
        message: ExternalMessage,
    ) -> Result<(), ConnectError>;

    /// Gracefully shuts the session down, flushing what it can.
    async fn close(&mut self) -> Result<(), ConnectError>;
}

/// Opens transport sessions for one broker kind.
///
/// Implementations must not block in their constructors; I/O starts in
/// `connect`.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + 'static {
    /// The broker kind this adapter serves.
    fn kind(&self) -> ConnectionType;

    /// Opens a session for the connection, subscribing its sources.
    ///
    /// With `dry_run` set, the adapter verifies reachability and
    /// credentials but must not create durable subscriptions.
    async fn connect(
        &self,
        connection: &Connection,
        dry_run: bool,
    ) -> Result<Box<dyn AdapterSession>, ConnectError>;
}
