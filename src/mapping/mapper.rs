//! # Mapper trait and the built-in transformations.
//!
//! A [`MessageMapper`] is a pure bidirectional transform between
//! [`ExternalMessage`] and [`Signal`]. Mapping is injectable: sources and
//! targets carry a mapping *reference*, the connection's mapping context
//! resolves the reference to a transformation spec, and the
//! [`MapperRegistry`] resolves the spec to a mapper instance (identity
//! when the reference is unset).
//!
//! Built-ins:
//! - `identity`: lossless byte passthrough, inverse of itself.
//! - `json`: parses the payload as JSON; a top-level array fans out into
//!   one signal per element (batch splitting).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MappingError;
use crate::model::{ExternalMessage, MappingContext, Signal};

/// Header under which the identity mapping preserves the content type.
const CONTENT_TYPE_HEADER: &str = "content-type";

/// Bidirectional transform between wire payloads and domain signals.
///
/// Mappers are pure and synchronous: no I/O, no awaiting. A mapper may fan
/// one message out into several signals (batch splitting) or produce none
/// (filtering).
pub trait MessageMapper: Send + Sync + 'static {
    /// Stable spec name this mapper is registered under.
    fn name(&self) -> &str;

    /// Maps one wire message into zero, one or many domain signals.
    fn inbound(&self, message: &ExternalMessage) -> Result<Vec<Signal>, MappingError>;

    /// Maps one domain signal back into a wire message.
    fn outbound(&self, signal: &Signal) -> Result<ExternalMessage, MappingError>;
}

/// Lossless passthrough mapping; its inverse reproduces the original
/// payload bit-for-bit.
pub struct IdentityMapper;

impl MessageMapper for IdentityMapper {
    fn name(&self) -> &str {
        "identity"
    }

    fn inbound(&self, message: &ExternalMessage) -> Result<Vec<Signal>, MappingError> {
        let mut signal = Signal::command(
            "passthrough",
            serde_json::to_value(&message.payload).map_err(|e| {
                MappingError::MalformedPayload {
                    reason: e.to_string(),
                }
            })?,
        );
        signal.headers = message.headers.clone();
        if let Some(ct) = &message.content_type {
            signal
                .headers
                .insert(CONTENT_TYPE_HEADER.to_owned(), ct.clone());
        }
        Ok(vec![signal])
    }

    fn outbound(&self, signal: &Signal) -> Result<ExternalMessage, MappingError> {
        let payload: Vec<u8> = serde_json::from_value(signal.payload.clone()).map_err(|e| {
            MappingError::TransformFailed {
                mapping: "identity".into(),
                reason: format!("signal payload is not a byte array: {e}"),
            }
        })?;
        let mut headers = signal.headers.clone();
        let content_type = headers.remove(CONTENT_TYPE_HEADER);
        Ok(ExternalMessage {
            payload,
            content_type,
            headers,
        })
    }
}

/// JSON mapping with batch fan-out.
///
/// Inbound parses the payload as JSON; a top-level array produces one
/// signal per element in array order. Outbound serializes the signal
/// payload as compact JSON.
pub struct JsonMapper;

impl MessageMapper for JsonMapper {
    fn name(&self) -> &str {
        "json"
    }

    fn inbound(&self, message: &ExternalMessage) -> Result<Vec<Signal>, MappingError> {
        let value: serde_json::Value =
            serde_json::from_slice(&message.payload).map_err(|e| {
                MappingError::MalformedPayload {
                    reason: e.to_string(),
                }
            })?;

        let elements = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };

        Ok(elements
            .into_iter()
            .map(|payload| {
                let mut signal = Signal::command("json", payload);
                signal.headers = message.headers.clone();
                signal
            })
            .collect())
    }

    fn outbound(&self, signal: &Signal) -> Result<ExternalMessage, MappingError> {
        let payload = serde_json::to_vec(&signal.payload).map_err(|e| {
            MappingError::TransformFailed {
                mapping: "json".into(),
                reason: e.to_string(),
            }
        })?;
        Ok(ExternalMessage {
            payload,
            content_type: Some("application/json".into()),
            headers: signal.headers.clone(),
        })
    }
}

/// Resolves mapping references to mapper instances.
///
/// Holds the built-ins plus any custom mappers injected at startup; this
/// is the mapping extension point: no dynamic loading, just registration
/// before the registry is shared.
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn MessageMapper>>,
    identity: Arc<dyn MessageMapper>,
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MapperRegistry {
    /// Registry with the built-in `identity` and `json` mappers.
    pub fn new() -> Self {
        let identity: Arc<dyn MessageMapper> = Arc::new(IdentityMapper);
        let mut mappers: HashMap<String, Arc<dyn MessageMapper>> = HashMap::new();
        mappers.insert("identity".into(), Arc::clone(&identity));
        mappers.insert("json".into(), Arc::new(JsonMapper));
        Self { mappers, identity }
    }

    /// Registers a custom mapper under its own name.
    pub fn register(&mut self, mapper: Arc<dyn MessageMapper>) {
        self.mappers.insert(mapper.name().to_owned(), mapper);
    }

    /// Resolves a source/target mapping reference through the connection's
    /// mapping context.
    ///
    /// An unset reference resolves to identity. A reference missing from
    /// the context, or a context spec with no registered mapper, is an
    /// [`MappingError::UnknownMapping`].
    pub fn resolve(
        &self,
        reference: Option<&str>,
        context: &MappingContext,
    ) -> Result<Arc<dyn MessageMapper>, MappingError> {
        let Some(reference) = reference else {
            return Ok(Arc::clone(&self.identity));
        };
        let spec = context
            .get(reference)
            .ok_or_else(|| MappingError::UnknownMapping {
                mapping: reference.to_owned(),
            })?;
        self.mappers
            .get(spec)
            .cloned()
            .ok_or_else(|| MappingError::UnknownMapping {
                mapping: spec.clone(),
            })
    }
}
