//! # linkvisor
//!
//! **Linkvisor** is a connection supervision and message-bridging runtime.
//!
//! It keeps a fleet of broker connections (MQTT, AMQP, Kafka, HTTP push)
//! alive on behalf of a platform: each connection gets a dedicated worker
//! driving an explicit lifecycle state machine, inbound broker messages
//! are mapped into domain signals, outbound signals are mapped back and
//! published, and a supervising registry persists descriptors and
//! respawns crashed workers within a bounded policy.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   create / modify / delete / open / close / test
//!                      │
//!                      ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  ConnectionRegistry (management surface)                          │
//! │  - ConnectionStore (durable descriptors, rehydrated on start)     │
//! │  - WorkerFactory (descriptor ──► running worker)                  │
//! │  - supervisor loop (respawns crashed workers, RespawnPolicy)      │
//! │  - Bus (broadcast status events)                                  │
//! └──────┬──────────────────────┬──────────────────────┬─────────────┘
//!        ▼                      ▼                      ▼
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//! │ConnectionWork│      │ConnectionWork│      │ConnectionWork│
//! │ (state loop) │      │ (state loop) │      │ (state loop) │
//! └──────┬───────┘      └──────┬───────┘      └──────┬───────┘
//!        │ ProtocolAdapter     │                     │
//!        ▼                     ▼                     ▼
//!    broker A              broker B              broker C
//!
//! per worker, per message:
//!   inbound:  ExternalMessage ─► InboundPipeline (MessageMapper)
//!             ─► Signal ─► SignalInterceptor ─► platform channel
//!   outbound: Signal ─► Target::matches ─► reverse mapper
//!             ─► ExternalMessage ─► session.publish (bounded retries)
//! ```
//!
//! ### Connection lifecycle
//! ```text
//! Uninitialized ──► Connecting ──► Connected
//!                      │  ▲            │ session lost
//!        permanent err │  │ slot +     ▼
//!                      │  │ delay   Reconnecting ──► (backoff, jittered,
//!                      ▼  └────────────┘             capped slot pool)
//!                    Failed
//!
//! Disconnecting ──► Closed      (graceful close, desired state persisted)
//! TestingConnection              (dry-run probe, returns to prior state)
//! ```
//!
//! Reconnect delays follow `min(max, base * 2^failures)` with ±20%
//! jitter; a process-wide slot pool caps how many connections reconnect
//! at once, so a broker outage does not turn into a reconnect storm.
//!
//! ## Features
//! | Area              | Description                                                        | Key types / traits                          |
//! |-------------------|--------------------------------------------------------------------|---------------------------------------------|
//! | **Registry**      | Create, modify, open, close, test and delete connections.          | [`ConnectionRegistry`], [`RegistryBuilder`] |
//! | **Lifecycle**     | Explicit per-connection state machine with guarded transitions.    | [`ConnectionState`], [`ConnectionWorker`]   |
//! | **Adapters**      | Pluggable broker protocols behind one async trait.                 | [`ProtocolAdapter`], [`AdapterSession`]     |
//! | **Mapping**       | Payload transformation in both directions, pluggable mappers.      | [`MessageMapper`], [`MapperRegistry`]       |
//! | **Validation**    | Inbound signals pass an interceptor before reaching the platform.  | [`SignalInterceptor`]                       |
//! | **Persistence**   | Durable descriptors, rehydrated on process start.                  | [`ConnectionStore`], [`JsonFileStore`]      |
//! | **Policies**      | Reconnect backoff and bounded worker respawn.                      | [`ReconnectPolicy`], [`RespawnPolicy`]      |
//! | **Observability** | Broadcast status events, bounded subscriber fan-out.               | [`Event`], [`Subscribe`], [`LogWriter`]     |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use linkvisor::{
//!     Connection, ConnectionRegistry, ConnectionType, DefaultWorkerFactory,
//!     DesiredState, Endpoint, MemoryBroker, Source, Target,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // In-process broker; real deployments register protocol adapters.
//!     let broker = MemoryBroker::new();
//!     let factory = Arc::new(
//!         DefaultWorkerFactory::new()
//!             .with_adapter(Arc::new(broker.adapter(ConnectionType::Mqtt))),
//!     );
//!
//!     let (registry, mut platform_rx) = ConnectionRegistry::builder(factory).build();
//!
//!     // Validated inbound signals from every connection arrive here.
//!     tokio::spawn(async move {
//!         while let Some(signal) = platform_rx.recv().await {
//!             println!("inbound: {}", signal.name);
//!         }
//!     });
//!
//!     let connection = Connection::builder(
//!         "factory-hub",
//!         ConnectionType::Mqtt,
//!         Endpoint::anonymous("mqtt://hub.example:1883"),
//!     )
//!     .source(Source::new("telemetry/#", vec!["svc:device".into()]))
//!     .target(Target::new("commands/down", vec!["svc:twin".into()]))
//!     .desired(DesiredState::Open)
//!     .build();
//!
//!     registry.create(connection).await?;
//!     registry.run_until_signal().await?;
//!     Ok(())
//! }
//! ```
mod adapter;
mod config;
mod dispatch;
mod error;
mod events;
mod factory;
mod machine;
mod mapping;
mod model;
mod persistence;
mod policies;
mod registry;
mod subscribers;

// ---- Public re-exports ----

pub use adapter::{AdapterSession, MemoryAdapter, MemoryBroker, ProtocolAdapter, SessionEvent};
pub use config::RuntimeConfig;
pub use dispatch::{CommandDispatcher, DefaultInterceptor, DispatchOutcome, SignalInterceptor};
pub use error::{ConnectError, DeliveryError, MappingError, RegistryError, ValidationRejection};
pub use events::{Bus, Event, EventKind};
pub use factory::{DefaultWorkerFactory, WorkerFactory};
pub use machine::{ConnectionState, ConnectionWorker, RoutingContext, WorkerCommand, WorkerHandle};
pub use mapping::{
    IdentityMapper, InboundOutcome, InboundPipeline, JsonMapper, MapperRegistry, MessageMapper,
    OutboundPipeline,
};
pub use model::{
    Connection, ConnectionBuilder, ConnectionId, ConnectionType, Credentials, DesiredState,
    Endpoint, ExternalMessage, HeaderFilter, MappingContext, Signal, Source, Target,
};
pub use persistence::{ConnectionStore, JsonFileStore, MemoryStore};
pub use policies::{ReconnectPolicy, RespawnPolicy};
pub use registry::{wait_for_shutdown_signal, ConnectionRegistry, RegistryBuilder};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
