//! Builder wiring the registry's runtime components.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::config::RuntimeConfig;
use crate::dispatch::{DefaultInterceptor, SignalInterceptor};
use crate::events::Bus;
use crate::factory::WorkerFactory;
use crate::machine::RoutingContext;
use crate::mapping::MapperRegistry;
use crate::model::Signal;
use crate::persistence::{ConnectionStore, MemoryStore};
use crate::subscribers::{Subscribe, SubscriberSet};

use super::core::ConnectionRegistry;

/// Builder for a [`ConnectionRegistry`] with optional components.
///
/// Defaults: in-memory store, built-in mappers, the baseline validation
/// interceptor, and no subscribers.
pub struct RegistryBuilder {
    config: RuntimeConfig,
    factory: Arc<dyn WorkerFactory>,
    store: Arc<dyn ConnectionStore>,
    interceptor: Arc<dyn SignalInterceptor>,
    mappers: Arc<MapperRegistry>,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl RegistryBuilder {
    /// Builder around the worker factory.
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            config: RuntimeConfig::default(),
            factory,
            store: Arc::new(MemoryStore::new()),
            interceptor: Arc::new(DefaultInterceptor),
            mappers: Arc::new(MapperRegistry::new()),
            subscribers: Vec::new(),
        }
    }

    /// Replaces the runtime configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the durable descriptor store.
    pub fn with_store(mut self, store: Arc<dyn ConnectionStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the validation interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn SignalInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Replaces the mapper registry (custom mappers included).
    pub fn with_mappers(mut self, mappers: Arc<MapperRegistry>) -> Self {
        self.mappers = mappers;
        self
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive events through dedicated workers with bounded
    /// queues; a slow subscriber never blocks the runtime.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the registry.
    ///
    /// Returns the registry plus the receiving end of the platform command
    /// channel: every validated inbound signal from every connection
    /// arrives there.
    pub fn build(self) -> (Arc<ConnectionRegistry>, mpsc::Receiver<Signal>) {
        let bus = Bus::new(self.config.bus_capacity);
        let (signal_tx, signal_rx) = mpsc::channel(self.config.bus_capacity.max(1));
        let gate = self
            .config
            .reconnect_limit()
            .map(|n| Arc::new(Semaphore::new(n)));

        let ctx = RoutingContext {
            bus: bus.clone(),
            mappers: self.mappers,
            interceptor: self.interceptor,
            commands: signal_tx,
            reconnect_gate: gate,
        };

        if !self.subscribers.is_empty() {
            spawn_subscriber_listener(&bus, self.subscribers);
        }

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new_internal(
            self.config,
            self.factory,
            self.store,
            ctx,
            exit_tx,
        ));
        registry.spawn_supervisor(exit_rx);
        (registry, signal_rx)
    }
}

/// Forwards bus events into the subscriber fan-out set.
fn spawn_subscriber_listener(bus: &Bus, subscribers: Vec<Arc<dyn Subscribe>>) {
    let set = SubscriberSet::new(subscribers, bus.clone());
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => set.emit_arc(Arc::new(ev)),
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber listener lagged behind the bus");
                }
            }
        }
        set.shutdown().await;
    });
}
