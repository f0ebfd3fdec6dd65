use serde_json::Value as JsonValue;
use tracing::info;

use claimflow_core::RequestingUser;

use super::{ClaimEvaluator, EvaluationError};

/// Evaluator that accepts every claim and only logs it. For dev setups
/// without a downstream evaluation service.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEvaluator;

#[async_trait::async_trait]
impl ClaimEvaluator for LoggingEvaluator {
    async fn evaluate(&self, claim: &JsonValue, user: &RequestingUser) -> Result<(), EvaluationError> {
        info!(user_id = %user.id, claim = %claim, "claim accepted for evaluation");
        Ok(())
    }
}
