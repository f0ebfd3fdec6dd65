//! Batch submission and deferred claim validation.
//!
//! ```text
//! submit_batch ──► open session ──► per work item: entry ─► claim ─► dispatch
//!                                                      (compensate on claim failure)
//!              ──► commit | rollback ──► release
//! dispatch ──► schedule ──(delay)──► drain bus ──► validate ──► evaluator
//! ```

pub mod codes;
pub mod dispatcher;
pub mod orchestrator;
pub mod scheduler;
pub mod validator;

use thiserror::Error;
use uuid::Uuid;

use claimflow_core::{ClaimId, DomainError, QueueEntryId, WorkItemId};
use claimflow_messaging::BusError;

use crate::evaluator::EvaluationError;
use crate::queue_store::PersistenceError;
use crate::reference_cache::CacheError;

pub use codes::{CodeValidation, extract_codes, validate_claim};
pub use dispatcher::{DispatchRecord, Dispatched, MessageDispatcher};
pub use orchestrator::{BatchOrchestrator, BatchReceipt, SubmittedItem};
pub use scheduler::{ConsumptionHandle, ConsumptionOutcome, ConsumptionScheduler};
pub use validator::{ClaimValidator, ConsumptionReport, ForwardedClaim};

/// Where in a batch a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStep {
    OpenSession,
    CreateEntry,
    CreateClaim,
    Dispatch,
    Commit,
}

impl std::fmt::Display for BatchStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStep::OpenSession => "open_session",
            BatchStep::CreateEntry => "create_entry",
            BatchStep::CreateClaim => "create_claim",
            BatchStep::Dispatch => "dispatch",
            BatchStep::Commit => "commit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] DomainError),

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("dispatch failure: {0}")]
    Dispatch(BusError),

    #[error("drain failure: {0}")]
    Drain(BusError),

    #[error("no claim found for message {message_id} (queue entry {entry_id})")]
    ClaimNotFound {
        message_id: Uuid,
        entry_id: QueueEntryId,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("claim {claim_id} failed code validation: {reason}")]
    InvalidClaim { claim_id: ClaimId, reason: String },

    #[error("no queue entry for work item {0}")]
    UnknownWorkItem(WorkItemId),

    #[error(transparent)]
    Transaction(#[from] Box<TransactionFailure>),
}

/// A batch that was rolled back, with the first error that caused it.
#[derive(Debug, Error)]
#[error("batch rolled back at {step}{}: {source}", describe_item(.work_item))]
pub struct TransactionFailure {
    pub step: BatchStep,
    pub work_item: Option<WorkItemId>,
    #[source]
    pub source: PipelineError,
}

impl TransactionFailure {
    pub fn new(step: BatchStep, work_item: Option<&WorkItemId>, source: impl Into<PipelineError>) -> Box<Self> {
        Box::new(Self {
            step,
            work_item: work_item.cloned(),
            source: source.into(),
        })
    }
}

fn describe_item(work_item: &Option<WorkItemId>) -> String {
    match work_item {
        Some(ian) => format!(" (work item {ian})"),
        None => String::new(),
    }
}

impl PipelineError {
    /// The innermost error, looking through a transaction failure.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::Transaction(failure) => failure.source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_failure_names_step_and_item() {
        let ian = WorkItemId::new("A2").unwrap();
        let err: PipelineError = TransactionFailure::new(
            BatchStep::CreateClaim,
            Some(&ian),
            PersistenceError::Unavailable("down".to_string()),
        )
        .into();

        let text = err.to_string();
        assert!(text.contains("create_claim"));
        assert!(text.contains("A2"));
        assert!(matches!(err.root(), PipelineError::Persistence(_)));
    }
}
