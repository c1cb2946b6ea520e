//! Retry and respawn policies.

mod reconnect;
mod respawn;

pub use reconnect::ReconnectPolicy;
pub use respawn::RespawnPolicy;
