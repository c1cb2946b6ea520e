//! # ConnectionRegistry: supervising owner of every connection worker.
//!
//! The registry is the management surface of the runtime: descriptors come
//! in, workers come out. It owns the worker handles, persists descriptors
//! through the [`ConnectionStore`], respawns crashed workers within the
//! bounded [`RespawnPolicy`](crate::policies::RespawnPolicy), and drives
//! graceful shutdown.
//!
//! ## Architecture
//! ```text
//! create/modify/delete/open/close/test ──► ConnectionRegistry
//!        │                                       │ owns
//!        ▼                                       ▼
//!   ConnectionStore                   { id → Entry { commands, state } }
//!                                                │ per worker
//!                                                ▼
//!                             monitor task ──► exit channel ──► supervisor
//!                                                 (respawn or exhaust)
//! ```
//!
//! ## Rules
//! - Exactly one worker per connection id; duplicates are rejected.
//! - Worker exits are observed via per-worker monitor tasks; a stale
//!   generation (replaced worker) is ignored.
//! - Management operations fail with `ShutDown` once shutdown started.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::RegistryError;
use crate::events::{Event, EventKind};
use crate::factory::WorkerFactory;
use crate::machine::{ConnectionState, RoutingContext, WorkerCommand, WorkerHandle};
use crate::model::{Connection, ConnectionId, DesiredState, Signal};
use crate::persistence::ConnectionStore;

use super::builder::RegistryBuilder;
use super::shutdown;

/// Live worker bookkeeping.
struct Entry {
    connection: Arc<Connection>,
    commands: mpsc::Sender<WorkerCommand>,
    state: watch::Receiver<ConnectionState>,
    /// Distinguishes exits of replaced workers from the current one.
    generation: u64,
    respawns: u32,
    exhausted: bool,
}

/// Worker exit observed by a monitor task.
pub(super) struct Exit {
    id: ConnectionId,
    generation: u64,
    panicked: bool,
}

/// Supervising registry of connection workers.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Entry>>,
    factory: Arc<dyn WorkerFactory>,
    store: Arc<dyn ConnectionStore>,
    ctx: RoutingContext,
    config: RuntimeConfig,
    exits: mpsc::UnboundedSender<Exit>,
    generations: AtomicU64,
    shutting_down: AtomicBool,
}

impl ConnectionRegistry {
    /// Starts building a registry around the given worker factory.
    pub fn builder(factory: Arc<dyn WorkerFactory>) -> RegistryBuilder {
        RegistryBuilder::new(factory)
    }

    pub(super) fn new_internal(
        config: RuntimeConfig,
        factory: Arc<dyn WorkerFactory>,
        store: Arc<dyn ConnectionStore>,
        ctx: RoutingContext,
        exits: mpsc::UnboundedSender<Exit>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            factory,
            store,
            ctx,
            config,
            exits,
            generations: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Subscribes to the status-event stream.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.ctx.bus.subscribe()
    }

    /// Persists and activates a new connection.
    ///
    /// The worker starts immediately; whether it connects depends on the
    /// descriptor's desired state.
    pub async fn create(&self, connection: Connection) -> Result<(), RegistryError> {
        self.ensure_running()?;
        connection
            .validate()
            .map_err(|reason| RegistryError::InvalidConnection { reason })?;

        let id = connection.id.clone();
        {
            let map = self.connections.read().await;
            if map.contains_key(&id) {
                return Err(RegistryError::AlreadyExists { id: id.to_string() });
            }
        }

        self.store.upsert(&connection).await?;
        let connection = Arc::new(connection);
        let handle = match self.factory.create(
            Arc::clone(&connection),
            self.ctx.clone(),
            self.config.clone(),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                // Keep the store consistent with the worker table.
                let _ = self.store.remove(&id).await;
                return Err(err);
            }
        };

        self.register(Arc::clone(&connection), handle).await?;
        info!(connection = %id, kind = %connection.kind, "connection created");
        self.ctx
            .bus
            .publish(Event::now(EventKind::ConnectionCreated).with_connection(&id));
        Ok(())
    }

    /// Replaces an existing descriptor and restarts its worker.
    pub async fn modify(&self, connection: Connection) -> Result<(), RegistryError> {
        self.ensure_running()?;
        connection
            .validate()
            .map_err(|reason| RegistryError::InvalidConnection { reason })?;

        let id = connection.id.clone();
        {
            let map = self.connections.read().await;
            if !map.contains_key(&id) {
                return Err(RegistryError::NotFound { id: id.to_string() });
            }
        }

        self.store.upsert(&connection).await?;
        let connection = Arc::new(connection);
        let handle = self.factory.create(
            Arc::clone(&connection),
            self.ctx.clone(),
            self.config.clone(),
        )?;
        let generation = self.next_generation();

        let old_commands = {
            let mut map = self.connections.write().await;
            let Some(entry) = map.get_mut(&id) else {
                // Deleted concurrently; stop the fresh worker again.
                let _ = handle.commands.try_send(WorkerCommand::Delete);
                return Err(RegistryError::NotFound { id: id.to_string() });
            };
            let old = std::mem::replace(&mut entry.commands, handle.commands);
            entry.state = handle.state;
            entry.connection = Arc::clone(&connection);
            entry.generation = generation;
            entry.respawns = 0;
            entry.exhausted = false;
            old
        };
        self.monitor(id.clone(), generation, handle.join);
        let _ = old_commands.send(WorkerCommand::Delete).await;

        info!(connection = %id, "connection modified");
        self.ctx
            .bus
            .publish(Event::now(EventKind::ConnectionModified).with_connection(&id));
        Ok(())
    }

    /// Removes the descriptor and stops its worker for good.
    pub async fn delete(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let entry = {
            let mut map = self.connections.write().await;
            map.remove(id)
                .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?
        };
        self.store.remove(id).await?;
        let _ = entry.commands.send(WorkerCommand::Delete).await;

        info!(connection = %id, "connection removed");
        self.ctx
            .bus
            .publish(Event::now(EventKind::ConnectionRemoved).with_connection(id));
        Ok(())
    }

    /// Opens the connection and persists `DesiredState::Open`.
    pub async fn open(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let (commands, updated) = self.set_desired(id, DesiredState::Open).await?;
        commands
            .send(WorkerCommand::Open)
            .await
            .map_err(|_| RegistryError::WorkerUnavailable { id: id.to_string() })?;
        self.store.upsert(&updated).await
    }

    /// Gracefully closes the connection and persists `DesiredState::Closed`.
    ///
    /// Resolves once the worker reached `Closed`.
    pub async fn close(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let (commands, updated) = self.set_desired(id, DesiredState::Closed).await?;
        self.store.upsert(&updated).await?;

        let (tx, rx) = oneshot::channel();
        commands
            .send(WorkerCommand::Close { reply: tx })
            .await
            .map_err(|_| RegistryError::WorkerUnavailable { id: id.to_string() })?;
        rx.await
            .map_err(|_| RegistryError::WorkerUnavailable { id: id.to_string() })
    }

    /// Runs a dry-run connectivity probe, bounded by the test timeout.
    pub async fn test(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let commands = {
            let map = self.connections.read().await;
            let entry = map
                .get(id)
                .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
            entry.commands.clone()
        };

        let (tx, rx) = oneshot::channel();
        commands
            .send(WorkerCommand::Test { reply: tx })
            .await
            .map_err(|_| RegistryError::WorkerUnavailable { id: id.to_string() })?;

        match time::timeout(self.config.test_timeout, rx).await {
            Err(_) => Err(RegistryError::TestTimeout {
                timeout: self.config.test_timeout,
            }),
            Ok(Err(_)) => Err(RegistryError::WorkerUnavailable { id: id.to_string() }),
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(RegistryError::TestFailed(err)),
        }
    }

    /// Current lifecycle state of the connection.
    pub async fn status(&self, id: &ConnectionId) -> Result<ConnectionState, RegistryError> {
        let map = self.connections.read().await;
        let entry = map
            .get(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        if entry.exhausted {
            Ok(ConnectionState::Failed)
        } else {
            Ok(*entry.state.borrow())
        }
    }

    /// Sorted ids of all known connections.
    pub async fn list(&self) -> Vec<ConnectionId> {
        let map = self.connections.read().await;
        let mut ids: Vec<ConnectionId> = map.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Fans an outbound signal out to every worker; each worker's targets
    /// decide whether anything is published.
    ///
    /// Returns the number of workers the signal was queued for. A full
    /// worker queue drops the signal for that worker (warn).
    pub async fn dispatch(&self, signal: &Signal) -> usize {
        let senders: Vec<(ConnectionId, mpsc::Sender<WorkerCommand>)> = {
            let map = self.connections.read().await;
            map.iter()
                .map(|(id, entry)| (id.clone(), entry.commands.clone()))
                .collect()
        };

        let mut queued = 0;
        for (id, tx) in senders {
            match tx.try_send(WorkerCommand::Outbound(signal.clone())) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = %id, "worker queue full, outbound signal dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        queued
    }

    /// Restores workers for every stored descriptor.
    ///
    /// Connections with `DesiredState::Open` resume connecting on their
    /// own. Invalid or unbuildable descriptors are skipped with a warning.
    pub async fn rehydrate(&self) -> Result<usize, RegistryError> {
        self.ensure_running()?;
        let stored = self.store.load_all().await?;
        let mut restored = 0;

        for connection in stored {
            let id = connection.id.clone();
            if self.connections.read().await.contains_key(&id) {
                continue;
            }
            if let Err(reason) = connection.validate() {
                warn!(connection = %id, reason, "stored descriptor invalid, skipped");
                continue;
            }
            let connection = Arc::new(connection);
            match self.factory.create(
                Arc::clone(&connection),
                self.ctx.clone(),
                self.config.clone(),
            ) {
                Ok(handle) => {
                    self.register(connection, handle).await?;
                    restored += 1;
                }
                Err(err) => {
                    warn!(connection = %id, error = %err, "stored descriptor not restored");
                }
            }
        }

        info!(restored, "connections rehydrated");
        Ok(restored)
    }

    /// Graceful shutdown: close every connection within the grace window.
    ///
    /// Workers that miss the window are released by dropping their command
    /// channels; they exit at their next wait point.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.bus.publish(Event::now(EventKind::ShutdownRequested));

        let entries: Vec<(ConnectionId, Entry)> = {
            let mut map = self.connections.write().await;
            map.drain().collect()
        };
        info!(count = entries.len(), "shutting down connections");

        let mut acks = Vec::with_capacity(entries.len());
        for (_, entry) in &entries {
            let (tx, rx) = oneshot::channel();
            if entry
                .commands
                .try_send(WorkerCommand::Close { reply: tx })
                .is_ok()
            {
                acks.push(rx);
            }
        }

        let all_closed = futures::future::join_all(acks.into_iter().map(|rx| async move {
            let _ = rx.await;
        }));
        match time::timeout(self.config.shutdown_grace, all_closed).await {
            Ok(_) => {
                self.ctx.bus.publish(Event::now(EventKind::AllStoppedWithin));
            }
            Err(_) => {
                warn!(grace = ?self.config.shutdown_grace, "grace exceeded, releasing workers");
                self.ctx.bus.publish(Event::now(EventKind::GraceExceeded));
            }
        }
        // Dropping the entries closes every command channel.
    }

    /// Blocks until an OS termination signal, then shuts down.
    pub async fn run_until_signal(&self) -> std::io::Result<()> {
        shutdown::wait_for_shutdown_signal().await?;
        self.shutdown().await;
        Ok(())
    }

    // ---------------------------
    // Internals
    // ---------------------------

    fn ensure_running(&self) -> Result<(), RegistryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(RegistryError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts the entry and starts its exit monitor.
    async fn register(
        &self,
        connection: Arc<Connection>,
        handle: WorkerHandle,
    ) -> Result<(), RegistryError> {
        let id = connection.id.clone();
        let generation = self.next_generation();

        {
            let mut map = self.connections.write().await;
            if map.contains_key(&id) {
                // Lost a create race; stop the extra worker.
                let _ = handle.commands.try_send(WorkerCommand::Delete);
                return Err(RegistryError::AlreadyExists { id: id.to_string() });
            }
            map.insert(
                id.clone(),
                Entry {
                    connection,
                    commands: handle.commands,
                    state: handle.state,
                    generation,
                    respawns: 0,
                    exhausted: false,
                },
            );
        }
        self.monitor(id, generation, handle.join);
        Ok(())
    }

    /// Forwards the worker's exit to the supervision loop.
    fn monitor(&self, id: ConnectionId, generation: u64, join: JoinHandle<()>) {
        let exits = self.exits.clone();
        tokio::spawn(async move {
            let panicked = join.await.is_err();
            let _ = exits.send(Exit {
                id,
                generation,
                panicked,
            });
        });
    }

    /// Spawns the supervision loop consuming worker exits.
    pub(super) fn spawn_supervisor(self: &Arc<Self>, mut exits: mpsc::UnboundedReceiver<Exit>) {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                Arc::clone(&me).handle_exit(exit).await;
            }
        });
    }

    async fn handle_exit(self: Arc<Self>, exit: Exit) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let mut map = self.connections.write().await;
        let Some(entry) = map.get_mut(&exit.id) else {
            // Deleted; nothing to supervise.
            return;
        };
        if entry.generation != exit.generation {
            // A replaced worker finished; the current one is fine.
            return;
        }
        if !exit.panicked {
            // Clean exit with the entry still present: the worker's channel
            // was dropped out of band. Remove the stale entry.
            map.remove(&exit.id);
            return;
        }

        if !self.config.respawn.allows(entry.respawns) {
            entry.exhausted = true;
            warn!(connection = %exit.id, respawns = entry.respawns, "respawn budget exhausted");
            self.ctx.bus.publish(
                Event::now(EventKind::WorkerExhausted)
                    .with_connection(&exit.id)
                    .with_reason("respawn budget exhausted"),
            );
            return;
        }

        let delay = self.config.respawn.delay(entry.respawns);
        entry.respawns += 1;
        let attempt = entry.respawns;
        drop(map);

        warn!(connection = %exit.id, attempt, delay = ?delay, "worker crashed, respawning");
        self.ctx.bus.publish(
            Event::now(EventKind::WorkerRespawned)
                .with_connection(&exit.id)
                .with_attempt(attempt)
                .with_delay(delay),
        );

        let me = Arc::clone(&self);
        tokio::spawn(async move {
            time::sleep(delay).await;
            me.respawn(exit.id).await;
        });
    }

    async fn respawn(&self, id: ConnectionId) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let connection = {
            let map = self.connections.read().await;
            match map.get(&id) {
                Some(entry) => Arc::clone(&entry.connection),
                None => return,
            }
        };

        match self
            .factory
            .create(connection, self.ctx.clone(), self.config.clone())
        {
            Ok(handle) => {
                let generation = self.next_generation();
                let mut map = self.connections.write().await;
                let Some(entry) = map.get_mut(&id) else {
                    let _ = handle.commands.try_send(WorkerCommand::Delete);
                    return;
                };
                entry.commands = handle.commands;
                entry.state = handle.state;
                entry.generation = generation;
                drop(map);
                self.monitor(id, generation, handle.join);
            }
            Err(err) => {
                warn!(connection = %id, error = %err, "respawn failed");
                let mut map = self.connections.write().await;
                if let Some(entry) = map.get_mut(&id) {
                    entry.exhausted = true;
                }
                drop(map);
                self.ctx.bus.publish(
                    Event::now(EventKind::WorkerExhausted)
                        .with_connection(&id)
                        .with_reason(err.to_string()),
                );
            }
        }
    }

    /// Updates the desired state in memory and returns the command sender
    /// plus the updated descriptor for persisting.
    async fn set_desired(
        &self,
        id: &ConnectionId,
        desired: DesiredState,
    ) -> Result<(mpsc::Sender<WorkerCommand>, Connection), RegistryError> {
        let mut map = self.connections.write().await;
        let entry = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        if entry.exhausted {
            return Err(RegistryError::WorkerUnavailable { id: id.to_string() });
        }
        let updated = Arc::new((*entry.connection).clone().with_desired(desired));
        entry.connection = Arc::clone(&updated);
        Ok((entry.commands.clone(), (*updated).clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapter::MemoryBroker;
    use crate::error::ConnectError;
    use crate::factory::testing::RejectingFactory;
    use crate::factory::DefaultWorkerFactory;
    use crate::model::{ConnectionType, Endpoint, Source, Target};
    use crate::persistence::MemoryStore;
    use crate::policies::RespawnPolicy;

    fn memory_factory(broker: &MemoryBroker) -> Arc<DefaultWorkerFactory> {
        Arc::new(
            DefaultWorkerFactory::new()
                .with_adapter(Arc::new(broker.adapter(ConnectionType::Mqtt))),
        )
    }

    fn build_registry(
        broker: &MemoryBroker,
    ) -> (Arc<ConnectionRegistry>, mpsc::Receiver<Signal>) {
        ConnectionRegistry::builder(memory_factory(broker)).build()
    }

    fn open_conn(id: &str, target_address: &str) -> Connection {
        let mut source = Source::new("in/telemetry", vec!["svc:device".into()]);
        source.mapping = Some("batch".into());
        let mut target = Target::new(target_address, vec!["svc:twin".into()]);
        target.mapping = Some("batch".into());
        Connection::builder(id, ConnectionType::Mqtt, Endpoint::anonymous("mem://hub"))
            .source(source)
            .target(target)
            .mapping("batch", "json")
            .desired(DesiredState::Open)
            .build()
    }

    async fn wait_status(
        registry: &ConnectionRegistry,
        id: &ConnectionId,
        want: ConnectionState,
    ) {
        loop {
            if registry.status(id).await.unwrap() == want {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_spawns_a_connecting_worker() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);

        registry.create(open_conn("r1", "out/a")).await.unwrap();
        wait_status(&registry, &"r1".into(), ConnectionState::Connected).await;
        assert_eq!(registry.list().await, vec![ConnectionId::from("r1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_create_is_rejected() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);

        registry.create(open_conn("r2", "out/a")).await.unwrap();
        let err = registry.create(open_conn("r2", "out/b")).await.unwrap_err();
        assert_eq!(err.as_label(), "registry_already_exists");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_descriptor_is_rejected() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);

        let bad = Connection::builder("r3", ConnectionType::Mqtt, Endpoint::anonymous(""))
            .build();
        let err = registry.create(bad).await.unwrap_err();
        assert_eq!(err.as_label(), "registry_invalid_connection");
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_worker_and_descriptor() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);
        let id = ConnectionId::from("r4");

        registry.create(open_conn("r4", "out/a")).await.unwrap();
        wait_status(&registry, &id, ConnectionState::Connected).await;

        registry.delete(&id).await.unwrap();
        assert!(registry.list().await.is_empty());
        assert!(matches!(
            registry.status(&id).await,
            Err(RegistryError::NotFound { .. })
        ));

        // The id is free again, store included.
        registry.create(open_conn("r4", "out/a")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closing_one_connection_leaves_the_other_connected() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);

        registry.create(open_conn("r5a", "out/a")).await.unwrap();
        registry.create(open_conn("r5b", "out/b")).await.unwrap();
        wait_status(&registry, &"r5a".into(), ConnectionState::Connected).await;
        wait_status(&registry, &"r5b".into(), ConnectionState::Connected).await;

        registry.close(&"r5a".into()).await.unwrap();
        assert_eq!(
            registry.status(&"r5a".into()).await.unwrap(),
            ConnectionState::Closed
        );
        assert_eq!(
            registry.status(&"r5b".into()).await.unwrap(),
            ConnectionState::Connected
        );
        assert!(broker.has_session(&"r5b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_runs_without_a_durable_session() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);

        let conn = open_conn("r6", "out/a").with_desired(DesiredState::Closed);
        registry.create(conn).await.unwrap();
        registry.test(&"r6".into()).await.unwrap();

        assert_eq!(broker.dry_run_count(), 1);
        assert!(!broker.has_session(&"r6".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_surfaces_the_connect_error() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);

        let conn = open_conn("r7", "out/a").with_desired(DesiredState::Closed);
        broker.script_connect(&conn.id, Err(ConnectError::permanent("bad credentials")));
        registry.create(conn).await.unwrap();

        let err = registry.test(&"r7".into()).await.unwrap_err();
        assert_eq!(err.as_label(), "registry_test_failed");
    }

    #[tokio::test(start_paused = true)]
    async fn rehydrate_resumes_connections_with_desired_open() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        store.upsert(&open_conn("r8a", "out/a")).await.unwrap();
        store
            .upsert(&open_conn("r8b", "out/b").with_desired(DesiredState::Closed))
            .await
            .unwrap();

        let (registry, _signals) = ConnectionRegistry::builder(memory_factory(&broker))
            .with_store(store)
            .build();

        assert_eq!(registry.rehydrate().await.unwrap(), 2);
        wait_status(&registry, &"r8a".into(), ConnectionState::Connected).await;
        assert_eq!(
            registry.status(&"r8b".into()).await.unwrap(),
            ConnectionState::Uninitialized
        );
    }

    #[tokio::test(start_paused = true)]
    async fn factory_rejection_keeps_registry_and_store_consistent() {
        let broker = MemoryBroker::new();
        let factory = Arc::new(RejectingFactory {
            inner: DefaultWorkerFactory::new()
                .with_adapter(Arc::new(broker.adapter(ConnectionType::Mqtt))),
            denials: std::sync::atomic::AtomicU32::new(1),
        });
        let (registry, _signals) = ConnectionRegistry::builder(factory).build();

        let err = registry.create(open_conn("r9", "out/a")).await.unwrap_err();
        assert_eq!(err.as_label(), "registry_factory_rejected");
        assert!(registry.list().await.is_empty());

        // The store was rolled back, so the retry goes through.
        registry.create(open_conn("r9", "out/a")).await.unwrap();
    }

    struct CrashingFactory;

    impl WorkerFactory for CrashingFactory {
        fn create(
            &self,
            _connection: Arc<Connection>,
            _ctx: RoutingContext,
            _config: RuntimeConfig,
        ) -> Result<WorkerHandle, RegistryError> {
            let (tx, rx) = mpsc::channel(1);
            let (state_tx, state_rx) = watch::channel(ConnectionState::Uninitialized);
            let join = tokio::spawn(async move {
                let _keep = (rx, state_tx);
                panic!("worker crash");
            });
            Ok(WorkerHandle {
                commands: tx,
                state: state_rx,
                join,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_is_respawned_then_exhausted() {
        let config = RuntimeConfig {
            respawn: RespawnPolicy {
                max_respawns: 2,
                base: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
            ..RuntimeConfig::default()
        };
        let (registry, _signals) = ConnectionRegistry::builder(Arc::new(CrashingFactory))
            .with_config(config)
            .build();
        let mut events = registry.events();

        registry.create(open_conn("r10", "out/a")).await.unwrap();

        let mut respawns = 0;
        loop {
            let ev = events.recv().await.unwrap();
            match ev.kind {
                EventKind::WorkerRespawned => respawns += 1,
                EventKind::WorkerExhausted => break,
                _ => {}
            }
        }
        assert_eq!(respawns, 2);
        assert_eq!(
            registry.status(&"r10".into()).await.unwrap(),
            ConnectionState::Failed
        );
        // No further lifecycle commands reach the dead worker.
        let err = registry.open(&"r10".into()).await.unwrap_err();
        assert_eq!(err.as_label(), "registry_worker_unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_everything_and_rejects_new_work() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);
        let mut events = registry.events();

        registry.create(open_conn("r11a", "out/a")).await.unwrap();
        registry.create(open_conn("r11b", "out/b")).await.unwrap();
        wait_status(&registry, &"r11a".into(), ConnectionState::Connected).await;
        wait_status(&registry, &"r11b".into(), ConnectionState::Connected).await;

        registry.shutdown().await;

        let mut saw_requested = false;
        let mut saw_all_stopped = false;
        while let Ok(ev) = events.try_recv() {
            match ev.kind {
                EventKind::ShutdownRequested => saw_requested = true,
                EventKind::AllStoppedWithin => saw_all_stopped = true,
                _ => {}
            }
        }
        assert!(saw_requested);
        assert!(saw_all_stopped);

        let err = registry.create(open_conn("r11c", "out/c")).await.unwrap_err();
        assert_eq!(err.as_label(), "registry_shut_down");
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_fans_out_to_every_matching_connection() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);

        registry.create(open_conn("r12a", "out/a")).await.unwrap();
        registry.create(open_conn("r12b", "out/b")).await.unwrap();
        wait_status(&registry, &"r12a".into(), ConnectionState::Connected).await;
        wait_status(&registry, &"r12b".into(), ConnectionState::Connected).await;

        let signal = Signal::event("things.twin.modified", serde_json::json!({"v": 1}))
            .with_subjects(vec!["svc:twin".into()]);
        assert_eq!(registry.dispatch(&signal).await, 2);

        while broker.published().len() < 2 {
            time::sleep(Duration::from_millis(5)).await;
        }
        let mut addresses: Vec<String> =
            broker.published().into_iter().map(|(a, _)| a).collect();
        addresses.sort();
        assert_eq!(addresses, vec!["out/a".to_string(), "out/b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn modify_swaps_the_descriptor_and_restarts_the_worker() {
        let broker = MemoryBroker::new();
        let (registry, _signals) = build_registry(&broker);
        let id = ConnectionId::from("r13");

        registry.create(open_conn("r13", "out/old")).await.unwrap();
        wait_status(&registry, &id, ConnectionState::Connected).await;

        registry.modify(open_conn("r13", "out/new")).await.unwrap();
        while broker.connect_attempts(&id) < 2 {
            time::sleep(Duration::from_millis(5)).await;
        }
        wait_status(&registry, &id, ConnectionState::Connected).await;

        let signal = Signal::event("things.twin.modified", serde_json::json!({}))
            .with_subjects(vec!["svc:twin".into()]);
        registry.dispatch(&signal).await;
        while broker.published().is_empty() {
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.published()[0].0, "out/new");
    }
}
