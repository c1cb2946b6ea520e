//! Logging subscriber emitting one structured line per event.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::events::{Event, EventKind};

use super::Subscribe;

/// Structured-log subscriber.
///
/// Useful as a default observability sink; replace it with a custom
/// [`Subscribe`] implementation for metrics or alerting.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let connection = e.connection.as_ref().map(|c| c.to_string()).unwrap_or_default();
        match e.kind {
            EventKind::StateChanged => {
                info!(
                    seq = e.seq,
                    connection,
                    from = ?e.prior_state,
                    to = ?e.new_state,
                    reason = ?e.reason,
                    "state changed"
                );
            }
            EventKind::ReconnectScheduled => {
                info!(
                    seq = e.seq,
                    connection,
                    delay = ?e.delay,
                    attempt = ?e.attempt,
                    reason = ?e.reason,
                    "reconnect scheduled"
                );
            }
            EventKind::ReconnectQueued => {
                info!(seq = e.seq, connection, attempt = ?e.attempt, "reconnect queued");
            }
            EventKind::MappingFailed
            | EventKind::MappingDegraded
            | EventKind::DeadLettered
            | EventKind::DeliveryFailed
            | EventKind::ValidationRejected => {
                warn!(
                    seq = e.seq,
                    connection,
                    kind = ?e.kind,
                    reason = ?e.reason,
                    attempt = ?e.attempt,
                    "pipeline event"
                );
            }
            EventKind::ConnectionCreated
            | EventKind::ConnectionModified
            | EventKind::ConnectionRemoved => {
                info!(seq = e.seq, connection, kind = ?e.kind, "connection management");
            }
            EventKind::WorkerRespawned => {
                warn!(
                    seq = e.seq,
                    connection,
                    attempt = ?e.attempt,
                    delay = ?e.delay,
                    "worker respawned"
                );
            }
            EventKind::WorkerExhausted => {
                warn!(seq = e.seq, connection, reason = ?e.reason, "worker exhausted");
            }
            EventKind::ShutdownRequested => info!(seq = e.seq, "shutdown requested"),
            EventKind::AllStoppedWithin => info!(seq = e.seq, "all connections stopped in grace"),
            EventKind::GraceExceeded => warn!(seq = e.seq, "shutdown grace exceeded"),
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => {
                warn!(seq = e.seq, kind = ?e.kind, reason = ?e.reason, "subscriber issue");
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
