//! Downstream claim evaluation boundary.
//!
//! The evaluator receives every forwarded claim payload together with the
//! requesting user. What it does with the claim is outside this crate.

pub mod credential;
pub mod http;
pub mod log;

use serde_json::Value as JsonValue;
use thiserror::Error;

use claimflow_core::RequestingUser;

pub use credential::{AdminCredential, AdminToken, CredentialSource, PasswordGrantSource, StaticCredentialSource};
pub use http::HttpClaimEvaluator;
pub use log::LoggingEvaluator;

#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    /// The evaluator answered and refused the claim.
    #[error("claim rejected by evaluator (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("evaluator unreachable: {0}")]
    Unreachable(String),

    #[error("admin credential unavailable: {0}")]
    Credential(String),
}

#[async_trait::async_trait]
pub trait ClaimEvaluator: Send + Sync {
    async fn evaluate(&self, claim: &JsonValue, user: &RequestingUser) -> Result<(), EvaluationError>;
}

#[async_trait::async_trait]
impl<E> ClaimEvaluator for std::sync::Arc<E>
where
    E: ClaimEvaluator + ?Sized,
{
    async fn evaluate(&self, claim: &JsonValue, user: &RequestingUser) -> Result<(), EvaluationError> {
        (**self).evaluate(claim, user).await
    }
}
