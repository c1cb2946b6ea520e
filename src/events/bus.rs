//! # Event bus for broadcasting connectivity status events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that lets
//! many publishers (workers, pipelines, the registry) emit without
//! blocking.
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks or fails.
//! - **Bounded capacity**: one ring buffer shared by all receivers.
//! - **Lag handling**: slow receivers observe `RecvError::Lagged(n)` and
//!   skip the `n` oldest items.
//! - **No persistence**: events are dropped if nobody is subscribed.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for connectivity events.
///
/// Cheap to clone; every worker holds one.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus with the given ring-buffer capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all active subscribers.
    ///
    /// Dropped silently when there are no receivers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates an independent receiver observing subsequent events only.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
