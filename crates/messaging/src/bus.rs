//! Dispatch/drain abstraction over an external message bus.
//!
//! ## Delivery model
//!
//! - `send` returns only once the transport has acknowledged the envelope. An
//!   error means the message must be treated as not sent.
//! - `drain` is a bounded, non-blocking read of whatever has been delivered so
//!   far. It returns an empty list when nothing is pending; it never long-polls.
//! - Ordering is the transport's delivery order. Nothing here deduplicates: a
//!   message drained twice is processed twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use claimflow_core::QueueEntryId;

use crate::envelope::DispatchEnvelope;

/// Acknowledgment returned by the transport for a sent envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub message_id: Uuid,
    /// Transport-assigned id (stream entry id, sequence number, ...).
    pub transport_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// A delivered message, as returned by `MessageBus::drain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedMessage {
    /// Transport-assigned id of this delivery.
    pub delivery_id: String,
    pub envelope: DispatchEnvelope,
    pub delivered_at: DateTime<Utc>,
}

impl ConsumedMessage {
    /// Correlation key back to the originating queue entry.
    pub fn correlation(&self) -> QueueEntryId {
        self.envelope.queue_entry_id()
    }

    pub fn message_id(&self) -> Uuid {
        self.envelope.message_id()
    }
}

/// Bus operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// The transport could not be reached.
    #[error("message bus unreachable: {0}")]
    Unreachable(String),
    /// The transport refused the message.
    #[error("message rejected by bus: {0}")]
    Rejected(String),
    /// The envelope could not be encoded or a delivery could not be decoded.
    #[error("message serialization failed: {0}")]
    Serialization(String),
    /// Internal lock poisoning (in-process transports).
    #[error("message bus state poisoned")]
    Poisoned,
}

/// External message bus used by the dispatcher and the consumption scheduler.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Send an envelope and wait for the transport's acknowledgment.
    async fn send(&self, envelope: DispatchEnvelope) -> Result<DispatchReceipt, BusError>;

    /// Drain up to `max` delivered messages without blocking.
    async fn drain(&self, max: usize) -> Result<Vec<ConsumedMessage>, BusError>;
}

#[async_trait::async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn send(&self, envelope: DispatchEnvelope) -> Result<DispatchReceipt, BusError> {
        (**self).send(envelope).await
    }

    async fn drain(&self, max: usize) -> Result<Vec<ConsumedMessage>, BusError> {
        (**self).drain(max).await
    }
}
