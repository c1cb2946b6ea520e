//! # Supervising registry: management surface and worker supervision.

mod builder;
mod core;
mod shutdown;

pub use builder::RegistryBuilder;
pub use core::ConnectionRegistry;
pub use shutdown::wait_for_shutdown_signal;
