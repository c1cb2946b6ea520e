//! In-process adapter backed by a shared [`MemoryBroker`].
//!
//! Used by tests and demos: connect outcomes can be scripted, inbound
//! messages injected, publishes captured and sessions dropped on demand.
//! No wire protocol is involved.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectError;
use crate::model::{Connection, ConnectionId, ConnectionType, ExternalMessage};

use super::{AdapterSession, ProtocolAdapter, SessionEvent};

#[derive(Default)]
struct BrokerInner {
    /// Scripted connect outcomes per connection; empty queue = success.
    connect_script: HashMap<ConnectionId, VecDeque<Result<(), ConnectError>>>,
    /// Live session feeds, keyed by connection id.
    sessions: HashMap<ConnectionId, mpsc::UnboundedSender<SessionEvent>>,
    /// Captured publishes as (address, message).
    published: Vec<(String, ExternalMessage)>,
    /// Remaining scripted publish failures per address.
    publish_failures: HashMap<String, u32>,
    /// Connect attempts per connection (dry runs included).
    connect_attempts: HashMap<ConnectionId, u32>,
    /// Dry-run connects observed.
    dry_runs: u32,
}

/// Shared in-process broker hub.
///
/// Clone it freely; all clones observe the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an adapter for the given broker kind backed by this hub.
    pub fn adapter(&self, kind: ConnectionType) -> MemoryAdapter {
        MemoryAdapter {
            kind,
            broker: self.clone(),
        }
    }

    /// Scripts the outcome of the next connect attempt for `id`.
    ///
    /// Outcomes are consumed in order; once the queue is empty, connects
    /// succeed.
    pub fn script_connect(&self, id: &ConnectionId, outcome: Result<(), ConnectError>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .connect_script
            .entry(id.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Injects an inbound message into the live session of `id`.
    ///
    /// Returns `false` when no session is live.
    pub fn inject(&self, id: &ConnectionId, source_index: usize, message: ExternalMessage) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.sessions.get(id) {
            Some(tx) => tx
                .send(SessionEvent::Inbound {
                    source_index,
                    message,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Reports session loss to the live session of `id`.
    pub fn drop_session(&self, id: &ConnectionId, reason: impl Into<String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.remove(id) {
            Some(tx) => tx
                .send(SessionEvent::Lost {
                    reason: reason.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Fails the next `count` publishes to `address` with a transient
    /// error.
    pub fn fail_publishes(&self, address: impl Into<String>, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.publish_failures.insert(address.into(), count);
    }

    /// Snapshot of captured publishes as (address, message).
    pub fn published(&self) -> Vec<(String, ExternalMessage)> {
        self.inner.lock().unwrap().published.clone()
    }

    /// Connect attempts observed for `id` (dry runs included).
    pub fn connect_attempts(&self, id: &ConnectionId) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .connect_attempts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Dry-run connects observed across all connections.
    pub fn dry_run_count(&self) -> u32 {
        self.inner.lock().unwrap().dry_runs
    }

    /// Whether a session is currently live for `id`.
    pub fn has_session(&self, id: &ConnectionId) -> bool {
        self.inner.lock().unwrap().sessions.contains_key(id)
    }
}

/// Adapter handing out sessions on a [`MemoryBroker`].
pub struct MemoryAdapter {
    kind: ConnectionType,
    broker: MemoryBroker,
}

#[async_trait]
impl ProtocolAdapter for MemoryAdapter {
    fn kind(&self) -> ConnectionType {
        self.kind
    }

    async fn connect(
        &self,
        connection: &Connection,
        dry_run: bool,
    ) -> Result<Box<dyn AdapterSession>, ConnectError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.broker.inner.lock().unwrap();
            *inner
                .connect_attempts
                .entry(connection.id.clone())
                .or_default() += 1;
            if dry_run {
                inner.dry_runs += 1;
            }

            if let Some(script) = inner.connect_script.get_mut(&connection.id) {
                if let Some(outcome) = script.pop_front() {
                    outcome?;
                }
            }

            // Dry runs verify reachability without a durable feed.
            if !dry_run {
                inner.sessions.insert(connection.id.clone(), tx);
            }
        }

        Ok(Box::new(MemorySession {
            id: connection.id.clone(),
            broker: self.broker.clone(),
            rx,
        }))
    }
}

struct MemorySession {
    id: ConnectionId,
    broker: MemoryBroker,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
impl AdapterSession for MemorySession {
    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    async fn publish(
        &mut self,
        address: &str,
        message: ExternalMessage,
    ) -> Result<(), ConnectError> {
        let mut inner = self.broker.inner.lock().unwrap();
        if let Some(remaining) = inner.publish_failures.get_mut(address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConnectError::transient(format!(
                    "scripted publish failure on '{address}'"
                )));
            }
        }
        inner.published.push((address.to_owned(), message));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        let mut inner = self.broker.inner.lock().unwrap();
        inner.sessions.remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, DesiredState, Endpoint, Source};

    fn demo_connection(id: &str) -> Connection {
        Connection::builder(id, ConnectionType::Mqtt, Endpoint::anonymous("mem://local"))
            .source(Source::new("telemetry/#", vec!["device".into()]))
            .desired(DesiredState::Open)
            .build()
    }

    #[tokio::test]
    async fn scripted_failure_then_success() {
        let broker = MemoryBroker::new();
        let adapter = broker.adapter(ConnectionType::Mqtt);
        let conn = demo_connection("c1");

        broker.script_connect(&conn.id, Err(ConnectError::transient("boom")));
        assert!(adapter.connect(&conn, false).await.is_err());
        assert!(adapter.connect(&conn, false).await.is_ok());
        assert_eq!(broker.connect_attempts(&conn.id), 2);
    }

    #[tokio::test]
    async fn inject_and_receive_inbound() {
        let broker = MemoryBroker::new();
        let adapter = broker.adapter(ConnectionType::Mqtt);
        let conn = demo_connection("c2");

        let mut session = adapter.connect(&conn, false).await.unwrap();
        assert!(broker.inject(&conn.id, 0, ExternalMessage::new(b"hi".to_vec())));

        match session.next_event().await {
            Some(SessionEvent::Inbound {
                source_index,
                message,
            }) => {
                assert_eq!(source_index, 0);
                assert_eq!(message.payload, b"hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_leaves_no_session() {
        let broker = MemoryBroker::new();
        let adapter = broker.adapter(ConnectionType::Mqtt);
        let conn = demo_connection("c3");

        let _session = adapter.connect(&conn, true).await.unwrap();
        assert!(!broker.has_session(&conn.id));
        assert_eq!(broker.dry_run_count(), 1);
    }
}
