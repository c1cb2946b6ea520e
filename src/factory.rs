//! # Worker factory: how connection descriptors become running workers.
//!
//! The registry never spawns workers directly; it asks a [`WorkerFactory`].
//! Swapping the factory is the injection seam for tests and for embedders
//! that wire their own adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::ProtocolAdapter;
use crate::config::RuntimeConfig;
use crate::error::RegistryError;
use crate::machine::{ConnectionWorker, RoutingContext, WorkerHandle};
use crate::model::{Connection, ConnectionType};

/// Builds a worker for a validated connection descriptor.
///
/// A factory may refuse; the registry surfaces the refusal as
/// [`RegistryError::FactoryRejected`] and keeps no worker entry.
pub trait WorkerFactory: Send + Sync + 'static {
    /// Creates and spawns the worker for `connection`.
    fn create(
        &self,
        connection: Arc<Connection>,
        ctx: RoutingContext,
        config: RuntimeConfig,
    ) -> Result<WorkerHandle, RegistryError>;
}

/// Factory resolving adapters by broker kind.
#[derive(Default)]
pub struct DefaultWorkerFactory {
    adapters: HashMap<ConnectionType, Arc<dyn ProtocolAdapter>>,
}

impl DefaultWorkerFactory {
    /// Factory with no adapters registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the adapter used for its broker kind.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }
}

impl WorkerFactory for DefaultWorkerFactory {
    fn create(
        &self,
        connection: Arc<Connection>,
        ctx: RoutingContext,
        config: RuntimeConfig,
    ) -> Result<WorkerHandle, RegistryError> {
        let adapter = self.adapters.get(&connection.kind).cloned().ok_or_else(|| {
            RegistryError::FactoryRejected {
                id: connection.id.to_string(),
                reason: format!("no adapter registered for '{}'", connection.kind),
            }
        })?;
        Ok(ConnectionWorker::launch(connection, adapter, ctx, config))
    }
}
