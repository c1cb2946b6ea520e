//! # Outbound half of the mapping pipeline.
//!
//! A domain signal is matched against every configured target's subject
//! predicate (zero, one or many matches; zero is a silent drop), reverse
//! mapped, header mapped and published with a bounded per-target retry
//! budget. One target's failure never blocks another target.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapter::AdapterSession;
use crate::error::DeliveryError;
use crate::events::{Bus, Event, EventKind};
use crate::model::{Connection, Signal};

use super::MapperRegistry;

/// Outbound pipeline for one connection.
///
/// Owned by the connection worker; not shared.
pub struct OutboundPipeline {
    connection: Arc<Connection>,
    mappers: Arc<MapperRegistry>,
    bus: Bus,
    publish_attempts: u32,
}

impl OutboundPipeline {
    /// Builds the pipeline for a connection.
    pub fn new(
        connection: Arc<Connection>,
        mappers: Arc<MapperRegistry>,
        bus: Bus,
        publish_attempts: u32,
    ) -> Self {
        Self {
            connection,
            mappers,
            bus,
            publish_attempts: publish_attempts.max(1),
        }
    }

    /// Delivers one signal to every matching target over the session.
    ///
    /// Returns the number of targets that matched (delivered or not);
    /// zero matches is not an error.
    pub async fn deliver(&self, session: &mut dyn AdapterSession, signal: &Signal) -> usize {
        let mut matched = 0;

        for target in &self.connection.targets {
            if !target.matches(signal) {
                continue;
            }
            matched += 1;

            let mapped = self
                .mappers
                .resolve(target.mapping.as_deref(), &self.connection.mapping_context)
                .and_then(|mapper| mapper.outbound(signal));

            let mut message = match mapped {
                Ok(message) => message,
                Err(err) => {
                    warn!(
                        connection = %self.connection.id,
                        target = %target.address,
                        error = %err, "outbound mapping failed"
                    );
                    self.bus.publish(
                        Event::now(EventKind::MappingFailed)
                            .with_connection(&self.connection.id)
                            .with_reason(err.to_string()),
                    );
                    continue;
                }
            };
            message.headers.extend(target.map_headers(signal));

            if let Err(failure) = self.publish_with_retries(session, &target.address, message).await
            {
                warn!(
                    connection = %self.connection.id,
                    target = %failure.address,
                    attempts = failure.attempts,
                    reason = %failure.reason, "delivery failed"
                );
                self.bus.publish(
                    Event::now(EventKind::DeliveryFailed)
                        .with_connection(&self.connection.id)
                        .with_reason(failure.to_string())
                        .with_attempt(failure.attempts),
                );
            }
        }

        if matched == 0 {
            debug!(
                connection = %self.connection.id,
                signal = %signal.name, "no matching target, signal dropped"
            );
        }
        matched
    }

    async fn publish_with_retries(
        &self,
        session: &mut dyn AdapterSession,
        address: &str,
        message: crate::model::ExternalMessage,
    ) -> Result<(), DeliveryError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.publish_attempts {
            match session.publish(address, message.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_reason = err.to_string();
                    debug!(
                        connection = %self.connection.id,
                        address, attempt, "publish attempt failed"
                    );
                }
            }
        }
        Err(DeliveryError {
            address: address.to_owned(),
            attempts: self.publish_attempts,
            reason: last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryBroker;
    use crate::adapter::ProtocolAdapter;
    use crate::model::{ConnectionType, DesiredState, Endpoint, Target};

    fn outbound_fixture(
        targets: Vec<Target>,
    ) -> (OutboundPipeline, MemoryBroker, Arc<Connection>, Bus) {
        let mut builder = Connection::builder(
            "out-test",
            ConnectionType::Kafka,
            Endpoint::anonymous("mem://x"),
        )
        .mapping("reverse", "json")
        .desired(DesiredState::Open);
        for target in targets {
            builder = builder.target(target);
        }
        let connection = Arc::new(builder.build());
        let broker = MemoryBroker::new();
        let bus = Bus::new(64);
        let pipeline = OutboundPipeline::new(
            Arc::clone(&connection),
            Arc::new(MapperRegistry::new()),
            bus.clone(),
            3,
        );
        (pipeline, broker, connection, bus)
    }

    fn json_target(address: &str, subjects: &[&str]) -> Target {
        let mut target = Target::new(address, subjects.iter().map(|s| s.to_string()).collect());
        target.mapping = Some("reverse".into());
        target
    }

    fn twin_signal() -> Signal {
        Signal::event("things.twin.modified", serde_json::json!({"v": 1}))
            .with_subjects(vec!["svc:twin".into()])
    }

    #[tokio::test]
    async fn zero_matching_targets_drops_silently() {
        let (pipeline, broker, connection, bus) =
            outbound_fixture(vec![json_target("out/a", &["svc:other"])]);
        let mut events = bus.subscribe();
        let adapter = broker.adapter(ConnectionType::Kafka);
        let mut session = adapter.connect(&connection, false).await.unwrap();

        let matched = pipeline.deliver(session.as_mut(), &twin_signal()).await;
        assert_eq!(matched, 0);
        assert!(broker.published().is_empty());
        assert!(events.try_recv().is_err(), "no failure event for a drop");
    }

    #[tokio::test]
    async fn delivers_to_every_matching_target() {
        let (pipeline, broker, connection, _bus) = outbound_fixture(vec![
            json_target("out/a", &["svc:twin"]),
            json_target("out/b", &["svc:twin", "svc:audit"]),
            json_target("out/c", &["svc:none"]),
        ]);
        let adapter = broker.adapter(ConnectionType::Kafka);
        let mut session = adapter.connect(&connection, false).await.unwrap();

        let matched = pipeline.deliver(session.as_mut(), &twin_signal()).await;
        assert_eq!(matched, 2);

        let addresses: Vec<String> = broker.published().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addresses, vec!["out/a".to_string(), "out/b".to_string()]);
    }

    #[tokio::test]
    async fn one_failing_target_does_not_block_another() {
        let (pipeline, broker, connection, _bus) = outbound_fixture(vec![
            json_target("out/flaky", &["svc:twin"]),
            json_target("out/ok", &["svc:twin"]),
        ]);
        // More failures than the retry budget: delivery to out/flaky fails.
        broker.fail_publishes("out/flaky", 10);
        let adapter = broker.adapter(ConnectionType::Kafka);
        let mut session = adapter.connect(&connection, false).await.unwrap();

        pipeline.deliver(session.as_mut(), &twin_signal()).await;
        let addresses: Vec<String> = broker.published().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addresses, vec!["out/ok".to_string()]);
    }

    #[tokio::test]
    async fn retries_within_budget_succeed() {
        let (pipeline, broker, connection, _bus) =
            outbound_fixture(vec![json_target("out/retry", &["svc:twin"])]);
        broker.fail_publishes("out/retry", 2);
        let adapter = broker.adapter(ConnectionType::Kafka);
        let mut session = adapter.connect(&connection, false).await.unwrap();

        pipeline.deliver(session.as_mut(), &twin_signal()).await;
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn header_mapping_is_applied_to_published_message() {
        let mut target = json_target("out/headers", &["svc:twin"]);
        target
            .header_mapping
            .insert("origin".into(), "bridge".into());
        let (pipeline, broker, connection, _bus) = outbound_fixture(vec![target]);
        let adapter = broker.adapter(ConnectionType::Kafka);
        let mut session = adapter.connect(&connection, false).await.unwrap();

        pipeline.deliver(session.as_mut(), &twin_signal()).await;
        let (_, message) = broker.published().pop().unwrap();
        assert_eq!(message.headers.get("origin").map(String::as_str), Some("bridge"));
    }
}
