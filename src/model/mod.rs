//! Immutable value objects describing connections and the messages that
//! flow through them.
//!
//! Everything in this module is data: no I/O, no channels, no locks.
//! A [`Connection`] is immutable after creation; credential rotation or
//! any other change produces a new value that replaces the stored one.

mod connection;
mod credentials;
mod message;
mod source;
mod target;

pub use connection::{
    Connection, ConnectionBuilder, ConnectionId, ConnectionType, DesiredState, Endpoint,
};
pub use credentials::Credentials;
pub use message::{ExternalMessage, Signal};
pub use source::{HeaderFilter, Source};
pub use target::Target;

use std::collections::HashMap;

/// Mapping context: mapping name → transformation spec.
///
/// Sources and targets carry a mapping *reference*; the context resolves it
/// to a transformation spec understood by the mapper registry. An unset
/// reference resolves to the identity mapping.
pub type MappingContext = HashMap<String, String>;
