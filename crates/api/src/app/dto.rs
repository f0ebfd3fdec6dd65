use serde::{Deserialize, Serialize};
use uuid::Uuid;

use claimflow_core::{ClaimId, QueueEntryId, RequestBody, WorkItemId};
use claimflow_infra::pipeline::{BatchReceipt, SubmittedItem};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /lab-tests`: the work items plus any lab-test attributes.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct SubmitLabTestsRequest {
    pub body: RequestBody,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmittedItemResponse {
    pub ian: WorkItemId,
    pub entry_id: QueueEntryId,
    pub claim_id: ClaimId,
    pub message_id: Uuid,
    pub transport_id: String,
}

impl From<SubmittedItem> for SubmittedItemResponse {
    fn from(item: SubmittedItem) -> Self {
        Self {
            ian: item.ian,
            entry_id: item.entry_id,
            claim_id: item.claim_id,
            message_id: item.receipt.message_id,
            transport_id: item.receipt.transport_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitLabTestsResponse {
    pub items: Vec<SubmittedItemResponse>,
}

impl From<BatchReceipt> for SubmitLabTestsResponse {
    /// Consumption handles are dropped here; their tasks keep running.
    fn from(receipt: BatchReceipt) -> Self {
        Self {
            items: receipt.items.into_iter().map(Into::into).collect(),
        }
    }
}
