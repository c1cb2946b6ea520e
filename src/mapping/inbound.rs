//! # Inbound half of the mapping pipeline.
//!
//! Per message: source lookup → condition check → mapper (fan-out 0..n) →
//! correlation-id and subject stamping → header filter. Failures are
//! isolated per message: counted in a sliding window, published as
//! `MappingFailed`, optionally dead-lettered, and never abort the
//! connection. Crossing the failure-rate threshold raises the
//! informational `MappingDegraded` health event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{Bus, Event, EventKind};
use crate::model::{Connection, ExternalMessage, Signal};

use super::MapperRegistry;

/// Result of processing one inbound message.
#[derive(Debug)]
pub enum InboundOutcome {
    /// Signals ready for dispatch, in receipt order.
    Signals(Vec<Signal>),
    /// The message was skipped (condition not met, unknown source index).
    Skipped,
    /// Mapping failed; the payload may have been routed to a dead-letter
    /// address (returned so the caller can publish it on the session).
    Failed {
        dead_letter: Option<(String, ExternalMessage)>,
    },
}

/// Sliding-window failure counter.
struct FailureWindow {
    window: Duration,
    samples: VecDeque<Instant>,
}

impl FailureWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Records one failure and returns the count inside the window.
    fn record(&mut self) -> u32 {
        let now = Instant::now();
        self.samples.push_back(now);
        while let Some(first) = self.samples.front() {
            if now.duration_since(*first) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.len() as u32
    }
}

/// Inbound pipeline for one connection.
///
/// Owned by the connection worker; not shared.
pub struct InboundPipeline {
    connection: Arc<Connection>,
    mappers: Arc<MapperRegistry>,
    bus: Bus,
    failures: FailureWindow,
    failure_threshold: u32,
}

impl InboundPipeline {
    /// Builds the pipeline for a connection.
    pub fn new(
        connection: Arc<Connection>,
        mappers: Arc<MapperRegistry>,
        bus: Bus,
        failure_threshold: u32,
        failure_window: Duration,
    ) -> Self {
        Self {
            connection,
            mappers,
            bus,
            failures: FailureWindow::new(failure_window),
            failure_threshold,
        }
    }

    /// Processes one inbound message from the source at `source_index`.
    ///
    /// Signals are returned in receipt order; each carries a fresh
    /// correlation id and the source's authorization subjects.
    pub fn process(&mut self, source_index: usize, message: &ExternalMessage) -> InboundOutcome {
        let Some(source) = self.connection.sources.get(source_index) else {
            warn!(
                connection = %self.connection.id,
                source_index, "inbound message for unknown source index"
            );
            return InboundOutcome::Skipped;
        };

        if !source.condition_passes(&message.headers) {
            debug!(
                connection = %self.connection.id,
                source = %source.address, "condition not met, message skipped"
            );
            return InboundOutcome::Skipped;
        }

        let mapped = self
            .mappers
            .resolve(source.mapping.as_deref(), &self.connection.mapping_context)
            .and_then(|mapper| mapper.inbound(message));

        match mapped {
            Ok(signals) => {
                let stamped = signals
                    .into_iter()
                    .map(|mut signal| {
                        signal.correlation_id = Uuid::new_v4();
                        signal.authorization_subjects = source.authorization_subjects.clone();
                        signal.headers = source.header_filter.apply(&signal.headers);
                        signal
                    })
                    .collect();
                InboundOutcome::Signals(stamped)
            }
            Err(err) => {
                let count = self.failures.record();
                warn!(
                    connection = %self.connection.id,
                    source = %source.address,
                    error = %err, "inbound mapping failed"
                );
                self.bus.publish(
                    Event::now(EventKind::MappingFailed)
                        .with_connection(&self.connection.id)
                        .with_reason(err.to_string()),
                );
                if count >= self.failure_threshold && self.failure_threshold > 0 {
                    self.bus.publish(
                        Event::now(EventKind::MappingDegraded)
                            .with_connection(&self.connection.id)
                            .with_attempt(count),
                    );
                }

                let dead_letter = source.dead_letter.as_ref().map(|address| {
                    self.bus.publish(
                        Event::now(EventKind::DeadLettered)
                            .with_connection(&self.connection.id)
                            .with_reason(address.clone()),
                    );
                    (address.clone(), message.clone())
                });
                InboundOutcome::Failed { dead_letter }
            }
        }
    }
}
