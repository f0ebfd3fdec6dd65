//! Message bus mechanics for dispatching queue entries and consuming them later.
//!
//! The pipeline only needs two things from a bus: hand it an envelope and get an
//! acknowledgment back, and later drain whatever has been delivered without
//! blocking. Transport adapters (Redis Streams, ...) live in `claimflow-infra`.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{BusError, ConsumedMessage, DispatchReceipt, MessageBus};
pub use envelope::DispatchEnvelope;
pub use in_memory_bus::{DeliveryMode, InMemoryMessageBus};
