//! # Per-connection lifecycle state machine and worker.

mod state;
mod worker;

pub use state::ConnectionState;
pub use worker::{ConnectionWorker, RoutingContext, WorkerCommand, WorkerHandle};
