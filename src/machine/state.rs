//! # Connection lifecycle states and the legal-transition table.
//!
//! Eight states, one owner: only the connection worker mutates its state,
//! so transitions never race. Observers read the worker's watch channel or
//! follow `StateChanged` events on the bus.
//!
//! ```text
//! Uninitialized ──► Connecting ──► Connected ──► Disconnecting ──► Closed
//!       │               │  ▲           │                             │
//!       │               ▼  │           ▼                             ▼
//!       │          Reconnecting ◄──────┘                        Connecting
//!       ▼               │
//! TestingConnection     ▼
//!                     Failed
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Actual lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Worker exists, no connect attempted yet.
    Uninitialized,
    /// A connect attempt is in flight.
    Connecting,
    /// A dry-run connectivity probe is in flight.
    TestingConnection,
    /// Session established; traffic flows.
    Connected,
    /// Waiting out a backoff delay (and possibly a reconnect slot) before
    /// the next attempt.
    Reconnecting,
    /// Graceful close in progress; in-flight work is flushed.
    Disconnecting,
    /// Deliberately closed; reopens only on an explicit open.
    Closed,
    /// Permanent failure; waits for operator action.
    Failed,
}

impl ConnectionState {
    /// Whether the state machine permits `from → to`.
    ///
    /// Self-transitions are not listed; the worker treats them as no-ops
    /// before consulting this table.
    pub fn transition_allowed(from: Self, to: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (from, to),
            (Uninitialized, Connecting | TestingConnection | Closed)
                | (Connecting, Connected | Reconnecting | Disconnecting | Closed | Failed)
                | (TestingConnection, Uninitialized | Closed | Failed)
                | (Connected, Reconnecting | Disconnecting | Failed)
                | (Reconnecting, Connecting | Disconnecting | Closed | Failed)
                | (Disconnecting, Closed)
                | (Closed, Connecting | TestingConnection)
                | (Failed, Connecting | TestingConnection | Closed)
        )
    }

    /// Returns a short stable label (snake_case) for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::TestingConnection => "testing_connection",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}
