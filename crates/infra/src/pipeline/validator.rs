use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use claimflow_core::{ClaimId, QueueEntryId, RequestingUser};
use claimflow_messaging::ConsumedMessage;

use crate::config::ValidationPolicy;
use crate::evaluator::ClaimEvaluator;
use crate::queue_store::{ClaimStore, QueueEntryStore};
use crate::reference_cache::{ReferenceCache, cache_key};

use super::PipelineError;
use super::codes::{CodeValidation, validate_claim};

/// A claim handed to the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardedClaim {
    pub entry_id: QueueEntryId,
    pub claim_id: ClaimId,
    #[serde(serialize_with = "serialize_validation")]
    pub validation: CodeValidation,
}

fn serialize_validation<S: serde::Serializer>(v: &CodeValidation, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&v.describe())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumptionReport {
    /// In received order.
    pub forwarded: Vec<ForwardedClaim>,
}

/// Matches consumed messages to their claims, checks claim codes against the
/// cached allow-list and forwards to the evaluator.
pub struct ClaimValidator<S> {
    store: Arc<S>,
    cache: Arc<dyn ReferenceCache>,
    evaluator: Arc<dyn ClaimEvaluator>,
    code_lists: Vec<String>,
    policy: ValidationPolicy,
}

impl<S> ClaimValidator<S>
where
    S: QueueEntryStore + ClaimStore,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<dyn ReferenceCache>,
        evaluator: Arc<dyn ClaimEvaluator>,
        code_lists: Vec<String>,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            evaluator,
            code_lists,
            policy,
        }
    }

    /// Process drained messages in received order.
    ///
    /// The first message without a claim aborts the rest with `ClaimNotFound`.
    /// Claims already forwarded stay forwarded; nothing here touches the
    /// batches that produced the messages.
    pub async fn process_consumed(
        &self,
        messages: &[ConsumedMessage],
        user: &RequestingUser,
    ) -> Result<ConsumptionReport, PipelineError> {
        let mut report = ConsumptionReport::default();
        let key = cache_key(&self.code_lists, user);

        for message in messages {
            let entry_id = message.correlation();
            let Some(claim) = self.store.find_for_entry(entry_id).await? else {
                warn!(
                    message_id = %message.message_id(),
                    entry_id = %entry_id,
                    "no claim found for consumed message"
                );
                return Err(PipelineError::ClaimNotFound {
                    message_id: message.message_id(),
                    entry_id,
                });
            };

            let allow_list = self.cache.get(&key).await?;
            let validation = validate_claim(&claim.claim, allow_list.as_ref());
            info!(
                entry_id = %entry_id,
                claim_id = %claim.id,
                user_id = %user.id,
                validation = %validation.describe(),
                "claim validated"
            );

            if self.policy == ValidationPolicy::Enforce && !validation.is_valid() {
                let reason = validation.describe();
                self.mark_failed(entry_id, &reason).await;
                return Err(PipelineError::InvalidClaim {
                    claim_id: claim.id,
                    reason,
                });
            }

            if let Err(e) = self.evaluator.evaluate(&claim.claim, user).await {
                self.mark_failed(entry_id, &e.to_string()).await;
                return Err(e.into());
            }

            info!(entry_id = %entry_id, claim_id = %claim.id, "claim forwarded");
            report.forwarded.push(ForwardedClaim {
                entry_id,
                claim_id: claim.id,
                validation,
            });
        }

        Ok(report)
    }

    async fn mark_failed(&self, entry_id: QueueEntryId, message: &str) {
        if let Err(e) = self.store.mark_failed(entry_id, message).await {
            error!(entry_id = %entry_id, error = %e, "failed to mark queue entry failed");
        }
    }
}
