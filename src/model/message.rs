//! Wire-side and domain-side message representations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw message as seen on the wire: bytes plus transport metadata.
///
/// Adapters produce these for inbound traffic and accept them for
/// publishes; the mapping pipeline is the only component that looks inside
/// the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMessage {
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// MIME content type, if the transport carries one.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Transport headers/properties.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ExternalMessage {
    /// Message with the given payload and no metadata.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            content_type: None,
            headers: HashMap::new(),
        }
    }

    /// Returns a copy with the content type set.
    pub fn with_content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }

    /// Returns a copy with one header added.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Internal domain signal: a command or event on the platform side.
///
/// Inbound mapping produces signals from wire payloads; outbound mapping
/// turns signals back into wire payloads per matching target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Correlation id stamped by the inbound pipeline (or by the domain for
    /// outbound signals).
    pub correlation_id: Uuid,
    /// Dotted signal name, e.g. `things.commands.modify`.
    pub name: String,
    /// Address of the entity the signal concerns (thing id, topic path).
    #[serde(default)]
    pub entity: Option<String>,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Domain headers (correlation metadata, reply routing).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Authorization subjects the signal acts under; stamped from the
    /// producing source on inbound traffic.
    #[serde(default)]
    pub authorization_subjects: Vec<String>,
}

impl Signal {
    /// Command signal with a fresh correlation id.
    pub fn command(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            name: name.into(),
            entity: None,
            payload,
            headers: HashMap::new(),
            authorization_subjects: Vec::new(),
        }
    }

    /// Event signal with a fresh correlation id.
    pub fn event(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::command(name, payload)
    }

    /// Returns a copy with the entity address set.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Returns a copy acting under the given subjects.
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.authorization_subjects = subjects;
        self
    }
}
