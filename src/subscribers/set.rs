//! # Non-blocking event fan-out to multiple subscribers.
//!
//! ```text
//! emit(event)
//!     ├──► [queue 1] ──► worker 1 ──► subscriber1.on_event()
//!     ├──► [queue 2] ──► worker 2 ──► subscriber2.on_event()
//!     └──► [queue N] ──► worker N ──► subscriberN.on_event()
//! ```
//!
//! ## Rules
//! - No cross-subscriber ordering; per-subscriber delivery is FIFO.
//! - Overflow drops the event for that subscriber only and publishes
//!   `SubscriberOverflow`.
//! - `emit` never blocks (bounded queues, `try_send`).
//! - A panicking subscriber is caught (`catch_unwind`), reported via
//!   `SubscriberPanicked`, and its worker keeps running.

use std::sync::Arc;

use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

use crate::events::{Bus, Event, EventKind};

use super::Subscribe;

struct SubscriberChannel {
    name: &'static str,
    sender: mpsc::Sender<Arc<Event>>,
}

/// Fan-out coordinator for event subscribers.
pub struct SubscriberSet {
    channels: Vec<SubscriberChannel>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Creates the set and spawns one worker task per subscriber.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut channels = Vec::with_capacity(subs.len());
        let mut workers = Vec::with_capacity(subs.len());

        for sub in subs {
            let cap = sub.queue_capacity().max(1);
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<Arc<Event>>(cap);
            let bus_for_worker = bus.clone();

            let handle = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let fut = sub.on_event(ev.as_ref());
                    if let Err(panic_err) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        let info = panic_message(&panic_err);
                        warn!(subscriber = sub.name(), panic = %info, "subscriber panicked");
                        bus_for_worker.publish(
                            Event::now(EventKind::SubscriberPanicked)
                                .with_reason(format!("{}: {info}", sub.name())),
                        );
                    }
                }
            });
            channels.push(SubscriberChannel { name, sender: tx });
            workers.push(handle);
        }
        Self {
            channels,
            workers,
            bus,
        }
    }

    /// Emits an event to all subscribers without blocking.
    pub fn emit(&self, event: &Event) {
        self.emit_arc(Arc::new(event.clone()));
    }

    /// Emits a pre-allocated `Arc<Event>` to all subscribers.
    ///
    /// Overflow events are not re-published when they themselves overflow,
    /// which would otherwise loop.
    pub fn emit_arc(&self, event: Arc<Event>) {
        let is_overflow_evt = matches!(event.kind, EventKind::SubscriberOverflow);

        for channel in &self.channels {
            match channel.sender.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if !is_overflow_evt {
                        self.bus.publish(
                            Event::now(EventKind::SubscriberOverflow)
                                .with_reason(format!("{}: full", channel.name)),
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if !is_overflow_evt {
                        self.bus.publish(
                            Event::now(EventKind::SubscriberOverflow)
                                .with_reason(format!("{}: closed", channel.name)),
                        );
                    }
                }
            }
        }
    }

    /// Drops the queues and waits for every worker to drain.
    pub async fn shutdown(self) {
        drop(self.channels);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

fn panic_message(panic_err: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic_err.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic_err.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl Subscribe for Counter {
        async fn on_event(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &'static str {
            "counter"
        }
    }

    struct Panicker;

    #[async_trait]
    impl Subscribe for Panicker {
        async fn on_event(&self, _event: &Event) {
            panic!("boom");
        }
        fn name(&self) -> &'static str {
            "panicker"
        }
    }

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let bus = Bus::new(16);
        let seen = Arc::new(AtomicU32::new(0));
        let set = SubscriberSet::new(vec![Arc::new(Counter(Arc::clone(&seen)))], bus);

        for _ in 0..3 {
            set.emit(&Event::now(EventKind::ShutdownRequested));
        }
        set.shutdown().await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_stop_the_others() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let seen = Arc::new(AtomicU32::new(0));
        let set = SubscriberSet::new(
            vec![Arc::new(Panicker), Arc::new(Counter(Arc::clone(&seen)))],
            bus,
        );

        set.emit(&Event::now(EventKind::ShutdownRequested));
        set.shutdown().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let mut panicked = false;
        while let Ok(ev) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            if let Ok(ev) = ev {
                if ev.kind == EventKind::SubscriberPanicked {
                    panicked = true;
                    break;
                }
            } else {
                break;
            }
        }
        assert!(panicked);
    }
}
