//! # Durable storage for connection descriptors.
//!
//! The registry persists descriptors so a restarted process can rehydrate
//! its workers and resume every connection whose desired state is open.
//! Two implementations ship: [`MemoryStore`] for tests and embedders with
//! their own persistence, and [`JsonFileStore`] writing one JSON document
//! with an atomic temp-file rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RegistryError;
use crate::model::{Connection, ConnectionId};

/// Durable descriptor store used by the registry.
#[async_trait]
pub trait ConnectionStore: Send + Sync + 'static {
    /// Loads every stored descriptor.
    async fn load_all(&self) -> Result<Vec<Connection>, RegistryError>;

    /// Inserts or replaces the descriptor with the same id.
    async fn upsert(&self, connection: &Connection) -> Result<(), RegistryError>;

    /// Removes the descriptor; removing an unknown id is a no-op.
    async fn remove(&self, id: &ConnectionId) -> Result<(), RegistryError>;
}

/// Volatile in-process store.
#[derive(Default)]
pub struct MemoryStore {
    entries: StdMutex<BTreeMap<ConnectionId, Connection>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<Connection>, RegistryError> {
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }

    async fn upsert(&self, connection: &Connection) -> Result<(), RegistryError> {
        self.entries
            .lock()
            .unwrap()
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn remove(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        self.entries.lock().unwrap().remove(id);
        Ok(())
    }
}

/// File-backed store: one pretty-printed JSON array of descriptors.
///
/// Writes go to a sibling `.tmp` file first and are renamed over the
/// target, so a crash mid-write never corrupts the document. Operations
/// are serialized by an internal lock.
pub struct JsonFileStore {
    path: PathBuf,
    io: Mutex<()>,
}

impl JsonFileStore {
    /// Store backed by `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    async fn read_entries(path: &Path) -> Result<BTreeMap<ConnectionId, Connection>, RegistryError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(RegistryError::Store {
                    reason: format!("read {}: {err}", path.display()),
                });
            }
        };
        let entries: Vec<Connection> =
            serde_json::from_slice(&raw).map_err(|err| RegistryError::Store {
                reason: format!("parse {}: {err}", path.display()),
            })?;
        Ok(entries
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect())
    }

    async fn write_entries(
        &self,
        entries: &BTreeMap<ConnectionId, Connection>,
    ) -> Result<(), RegistryError> {
        let descriptors: Vec<&Connection> = entries.values().collect();
        let raw = serde_json::to_vec_pretty(&descriptors).map_err(|err| RegistryError::Store {
            reason: format!("serialize: {err}"),
        })?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &raw)
            .await
            .map_err(|err| RegistryError::Store {
                reason: format!("write {}: {err}", tmp.display()),
            })?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| RegistryError::Store {
                reason: format!("rename {} -> {}: {err}", tmp.display(), self.path.display()),
            })?;
        debug!(path = %self.path.display(), count = descriptors.len(), "descriptors persisted");
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<Connection>, RegistryError> {
        let _guard = self.io.lock().await;
        Ok(Self::read_entries(&self.path).await?.into_values().collect())
    }

    async fn upsert(&self, connection: &Connection) -> Result<(), RegistryError> {
        let _guard = self.io.lock().await;
        let mut entries = Self::read_entries(&self.path).await?;
        entries.insert(connection.id.clone(), connection.clone());
        self.write_entries(&entries).await
    }

    async fn remove(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        let _guard = self.io.lock().await;
        let mut entries = Self::read_entries(&self.path).await?;
        if entries.remove(id).is_none() {
            return Ok(());
        }
        self.write_entries(&entries).await
    }
}
