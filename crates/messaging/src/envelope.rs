use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use claimflow_core::{QueueEntryId, WorkItemId};

/// Envelope handed to the bus for one queue entry.
///
/// This is the unit that travels through the transport. It is not persisted by
/// the pipeline itself (the receipt is), and it carries enough to correlate a
/// consumed message back to its queue entry and claim:
/// - `queue_entry_id` is the correlation key used on consumption.
/// - `payload` is the entry payload (request narrowed to `ian`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    message_id: Uuid,
    queue_entry_id: QueueEntryId,
    ian: WorkItemId,
    payload: JsonValue,
    dispatched_at: DateTime<Utc>,
}

impl DispatchEnvelope {
    pub fn new(queue_entry_id: QueueEntryId, ian: WorkItemId, payload: JsonValue) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            queue_entry_id,
            ian,
            payload,
            dispatched_at: Utc::now(),
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn queue_entry_id(&self) -> QueueEntryId {
        self.queue_entry_id
    }

    pub fn ian(&self) -> &WorkItemId {
        &self.ian
    }

    pub fn dispatched_at(&self) -> DateTime<Utc> {
        self.dispatched_at
    }
}
