//! # Bidirectional message-mapping pipeline.
//!
//! Inbound: wire payload → mapper (fan-out 0..n) → correlation/subject
//! stamping → header filter → dispatcher. Outbound: domain signal → target
//! matching → reverse mapping → header mapping → adapter publish.
//!
//! Mapping failures are isolated per message and never abort the
//! connection; delivery failures are isolated per target.

mod inbound;
mod mapper;
mod outbound;

pub use inbound::{InboundOutcome, InboundPipeline};
pub use mapper::{IdentityMapper, JsonMapper, MapperRegistry, MessageMapper};
pub use outbound::OutboundPipeline;
