//! One database transaction per batch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use claimflow_core::{ClaimId, IncomingRequest, QueueEntryId, RequestingUser, WorkItemId};
use claimflow_messaging::{DispatchReceipt, MessageBus};

use crate::config::PipelineConfig;
use crate::evaluator::ClaimEvaluator;
use crate::queue_store::{
    ClaimStore, PersistenceError, QueueEntry, QueueEntryClaim, QueueEntryStore, Session, StatusView,
};
use crate::reference_cache::ReferenceCache;

use super::dispatcher::MessageDispatcher;
use super::scheduler::{ConsumptionHandle, ConsumptionScheduler};
use super::validator::ClaimValidator;
use super::{BatchStep, PipelineError, TransactionFailure};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedItem {
    pub ian: WorkItemId,
    pub entry_id: QueueEntryId,
    pub claim_id: ClaimId,
    pub receipt: DispatchReceipt,
}

/// Outcome of a committed batch.
#[derive(Debug)]
pub struct BatchReceipt {
    /// In submission order.
    pub items: Vec<SubmittedItem>,
    /// One per dispatched item. Dropping them leaves the tasks running.
    pub consumption: Vec<ConsumptionHandle>,
}

pub struct BatchOrchestrator<S> {
    store: Arc<S>,
    dispatcher: MessageDispatcher<S>,
}

impl<S> BatchOrchestrator<S>
where
    S: QueueEntryStore + ClaimStore + 'static,
{
    pub fn new(store: Arc<S>, dispatcher: MessageDispatcher<S>) -> Self {
        Self { store, dispatcher }
    }

    /// Wire the whole pipeline over one store.
    pub fn assemble(
        store: Arc<S>,
        bus: Arc<dyn MessageBus>,
        cache: Arc<dyn ReferenceCache>,
        evaluator: Arc<dyn ClaimEvaluator>,
        config: &PipelineConfig,
    ) -> Self {
        let validator = Arc::new(ClaimValidator::new(
            Arc::clone(&store),
            cache,
            evaluator,
            config.allowed_code_lists.clone(),
            config.validation_policy,
        ));
        let scheduler = ConsumptionScheduler::new(Arc::clone(&bus), validator, config.consumption);
        let dispatcher = MessageDispatcher::new(Arc::clone(&store), bus, scheduler);
        Self::new(store, dispatcher)
    }

    pub fn dispatcher(&self) -> &MessageDispatcher<S> {
        &self.dispatcher
    }

    pub fn validator(&self) -> &ClaimValidator<S> {
        self.dispatcher.scheduler().validator()
    }

    /// Persist, claim and dispatch every work item of `request` atomically.
    ///
    /// Items are processed strictly in submission order. The first failure
    /// stops the batch, the transaction is rolled back and the failure is
    /// returned as `PipelineError::Transaction`. The session is released
    /// exactly once whatever happens.
    #[instrument(skip(self, request, user), fields(user_id = %user.id, items = request.work_items().len()), err)]
    pub async fn submit_batch(
        &self,
        request: &IncomingRequest,
        user: &RequestingUser,
    ) -> Result<BatchReceipt, PipelineError> {
        request.validate()?;

        let mut session = self
            .store
            .open()
            .await
            .map_err(|e| TransactionFailure::new(BatchStep::OpenSession, None, e))?;

        let result = match self.process_items(&mut session, request, user).await {
            Ok(receipt) => match session.commit().await {
                Ok(()) => {
                    info!(items = receipt.items.len(), "batch committed");
                    Ok(receipt)
                }
                Err(e) => {
                    self.rollback(&mut session).await;
                    Err(TransactionFailure::new(BatchStep::Commit, None, e).into())
                }
            },
            Err(failure) => {
                warn!(
                    step = %failure.step,
                    ian = ?failure.work_item,
                    error = %failure.source,
                    "batch failed; rolling back"
                );
                self.rollback(&mut session).await;
                Err(failure.into())
            }
        };

        session.release().await;
        result
    }

    async fn process_items(
        &self,
        session: &mut S::Session,
        request: &IncomingRequest,
        user: &RequestingUser,
    ) -> Result<BatchReceipt, Box<TransactionFailure>> {
        let mut receipt = BatchReceipt {
            items: Vec::with_capacity(request.work_items().len()),
            consumption: Vec::with_capacity(request.work_items().len()),
        };

        for ian in request.work_items() {
            let entry = self
                .create_entry(session, request, ian)
                .await
                .map_err(|e| TransactionFailure::new(BatchStep::CreateEntry, Some(ian), e))?;
            info!(ian = %ian, entry_id = %entry.id, "queue entry created");

            let claim = match self.create_claim(session, request, &entry).await {
                Ok(claim) => claim,
                Err(e) => {
                    self.compensate(session, &entry).await;
                    return Err(TransactionFailure::new(BatchStep::CreateClaim, Some(ian), e));
                }
            };
            info!(ian = %ian, entry_id = %entry.id, claim_id = %claim.id, "claim created");

            let dispatched = self
                .dispatcher
                .dispatch(session, &entry, user)
                .await
                .map_err(|e| TransactionFailure::new(BatchStep::Dispatch, Some(ian), e))?;

            receipt.items.push(SubmittedItem {
                ian: ian.clone(),
                entry_id: entry.id,
                claim_id: claim.id,
                receipt: dispatched.receipt,
            });
            receipt.consumption.push(dispatched.consumption);
        }

        Ok(receipt)
    }

    async fn create_entry(
        &self,
        session: &mut S::Session,
        request: &IncomingRequest,
        ian: &WorkItemId,
    ) -> Result<QueueEntry, PipelineError> {
        let payload = request.narrowed_to(ian).to_value()?;
        Ok(self.store.create_entry(session, ian, payload).await?)
    }

    async fn create_claim(
        &self,
        session: &mut S::Session,
        request: &IncomingRequest,
        entry: &QueueEntry,
    ) -> Result<QueueEntryClaim, PipelineError> {
        let claim = request.request_body.narrowed_to(&entry.ian).to_value()?;
        Ok(self.store.create_claim(session, entry, claim).await?)
    }

    /// Delete the entry whose claim could not be created. A failure here is
    /// logged; the claim error stays the one reported.
    async fn compensate(&self, session: &mut S::Session, entry: &QueueEntry) {
        match self.store.delete_entry(session, entry.id).await {
            Ok(()) => info!(ian = %entry.ian, entry_id = %entry.id, "queue entry removed after claim failure"),
            Err(e) => error!(
                ian = %entry.ian,
                entry_id = %entry.id,
                error = %e,
                "compensating delete failed"
            ),
        }
    }

    async fn rollback(&self, session: &mut S::Session) {
        match session.rollback().await {
            Ok(()) => {}
            // Already closed by a failed commit.
            Err(PersistenceError::SessionClosed) => {}
            Err(e) => error!(error = %e, "batch rollback failed"),
        }
    }

    /// Status of the newest queue entry for `ian`.
    pub async fn get_status(&self, ian: &WorkItemId) -> Result<StatusView, PipelineError> {
        self.store
            .latest_for(ian)
            .await?
            .map(|entry| entry.status_view())
            .ok_or_else(|| PipelineError::UnknownWorkItem(ian.clone()))
    }
}
