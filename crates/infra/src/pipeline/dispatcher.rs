use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use claimflow_core::RequestingUser;
use claimflow_messaging::{BusError, DispatchEnvelope, DispatchReceipt, MessageBus};

use crate::queue_store::{ClaimStore, EntryStatus, QueueEntry, QueueEntryStore};

use super::PipelineError;
use super::scheduler::{ConsumptionHandle, ConsumptionScheduler};

/// Body stored on a queue entry once the bus acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub receipt: DispatchReceipt,
    pub envelope: DispatchEnvelope,
}

/// Result of a successful dispatch.
#[derive(Debug)]
pub struct Dispatched {
    pub receipt: DispatchReceipt,
    pub consumption: ConsumptionHandle,
}

/// Sends queue entries to the bus and marks them `queued`.
pub struct MessageDispatcher<S> {
    store: Arc<S>,
    bus: Arc<dyn MessageBus>,
    scheduler: ConsumptionScheduler<S>,
}

impl<S> MessageDispatcher<S>
where
    S: QueueEntryStore + ClaimStore + 'static,
{
    pub fn new(store: Arc<S>, bus: Arc<dyn MessageBus>, scheduler: ConsumptionScheduler<S>) -> Self {
        Self { store, bus, scheduler }
    }

    pub fn scheduler(&self) -> &ConsumptionScheduler<S> {
        &self.scheduler
    }

    /// Send `entry` and record the acknowledgment inside `session`.
    ///
    /// On a bus failure the entry is left `pending` and the error propagates.
    /// After success one consumption task is scheduled for `user`.
    pub async fn dispatch(
        &self,
        session: &mut S::Session,
        entry: &QueueEntry,
        user: &RequestingUser,
    ) -> Result<Dispatched, PipelineError> {
        let envelope = DispatchEnvelope::new(entry.id, entry.ian.clone(), entry.payload.clone());
        let message_id = envelope.message_id();

        let receipt = match self.bus.send(envelope.clone()).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(ian = %entry.ian, entry_id = %entry.id, error = %e, "dispatch failed");
                return Err(PipelineError::Dispatch(e));
            }
        };

        let record = DispatchRecord {
            receipt: receipt.clone(),
            envelope,
        };
        let body = serde_json::to_value(&record)
            .map_err(|e| PipelineError::Dispatch(BusError::Serialization(e.to_string())))?;

        // The message is already on the bus; a failure here leaves it without
        // a committed claim.
        self.store
            .update_status(session, entry.id, EntryStatus::Queued, body)
            .await?;

        info!(
            ian = %entry.ian,
            entry_id = %entry.id,
            message_id = %message_id,
            transport_id = %receipt.transport_id,
            "queue entry dispatched"
        );

        let consumption = self.scheduler.schedule(user);
        Ok(Dispatched { receipt, consumption })
    }
}
