//! Connection descriptor: the durable definition of one broker bridge.

use serde::{Deserialize, Serialize};

use super::{Credentials, MappingContext, Source, Target};

/// Globally unique, immutable connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Supported broker kinds.
///
/// The worker factory resolves this to a concrete protocol adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    Amqp,
    Mqtt,
    Kafka,
    /// Webhook-style HTTP push endpoint.
    HttpPush,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionType::Amqp => "amqp",
            ConnectionType::Mqtt => "mqtt",
            ConnectionType::Kafka => "kafka",
            ConnectionType::HttpPush => "http-push",
        };
        f.write_str(s)
    }
}

/// Externally writable side of the state pair.
///
/// The registry persists this; the worker owns the actual state and no
/// other component may set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DesiredState {
    /// The connection should be live; it is resumed on process start.
    Open,
    /// The connection should stay closed until explicitly opened.
    Closed,
}

/// Broker endpoint descriptor: address plus credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Broker address, e.g. `amqps://broker.example:5671`.
    pub uri: String,
    /// Credentials variant used to authenticate the session.
    #[serde(default)]
    pub credentials: Credentials,
}

impl Endpoint {
    /// Anonymous endpoint for the given address.
    pub fn anonymous(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            credentials: Credentials::None,
        }
    }
}

/// A configured bridge between the platform and one external endpoint.
///
/// Immutable after creation. Credential rotation or any modification
/// produces a new `Connection` value; the registry swaps it in by
/// restarting the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Globally unique identifier.
    pub id: ConnectionId,
    /// Broker kind, resolved by the worker factory.
    pub kind: ConnectionType,
    /// Broker address and credentials.
    pub endpoint: Endpoint,
    /// Ordered inbound subscriptions.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Ordered outbound publish routes.
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Mapping name → transformation spec, looked up by source/target
    /// mapping references.
    #[serde(default)]
    pub mapping_context: MappingContext,
    /// What the operator wants the connection to be.
    pub desired: DesiredState,
}

impl Connection {
    /// Structural validation applied by the registry before a descriptor is
    /// accepted: non-empty id, non-empty source/target addresses.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.as_str().is_empty() {
            return Err("connection id must not be empty".into());
        }
        if self.endpoint.uri.is_empty() {
            return Err("endpoint uri must not be empty".into());
        }
        for (i, source) in self.sources.iter().enumerate() {
            if source.address.is_empty() {
                return Err(format!("source #{i} has an empty address"));
            }
        }
        for (i, target) in self.targets.iter().enumerate() {
            if target.address.is_empty() {
                return Err(format!("target #{i} has an empty address"));
            }
        }
        Ok(())
    }

    /// Returns a copy with the desired state replaced.
    pub fn with_desired(mut self, desired: DesiredState) -> Self {
        self.desired = desired;
        self
    }
}

/// Builder-free construction helper used throughout tests and callers.
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    inner: Connection,
}

impl Connection {
    /// Starts building a descriptor.
    pub fn builder(
        id: impl Into<ConnectionId>,
        kind: ConnectionType,
        endpoint: Endpoint,
    ) -> ConnectionBuilder {
        ConnectionBuilder {
            inner: Connection {
                id: id.into(),
                kind,
                endpoint,
                sources: Vec::new(),
                targets: Vec::new(),
                mapping_context: MappingContext::new(),
                desired: DesiredState::Closed,
            },
        }
    }
}

impl ConnectionBuilder {
    /// Appends an inbound subscription.
    pub fn source(mut self, source: Source) -> Self {
        self.inner.sources.push(source);
        self
    }

    /// Appends an outbound publish route.
    pub fn target(mut self, target: Target) -> Self {
        self.inner.targets.push(target);
        self
    }

    /// Registers a named mapping spec.
    pub fn mapping(mut self, name: impl Into<String>, spec: impl Into<String>) -> Self {
        self.inner.mapping_context.insert(name.into(), spec.into());
        self
    }

    /// Sets the desired state (defaults to [`DesiredState::Closed`]).
    pub fn desired(mut self, desired: DesiredState) -> Self {
        self.inner.desired = desired;
        self
    }

    /// Finalizes the immutable descriptor.
    pub fn build(self) -> Connection {
        self.inner
    }
}
