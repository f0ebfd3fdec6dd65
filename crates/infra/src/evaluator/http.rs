//! HTTP client for the downstream sample-evaluation service.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{instrument, warn};

use claimflow_core::RequestingUser;

use super::credential::AdminCredential;
use super::{ClaimEvaluator, EvaluationError};

const EVALUATE_PATH: &str = "sample-evaluations/claims";

#[derive(Debug, Serialize)]
struct EvaluationRequest<'a> {
    claim: &'a JsonValue,
    user: &'a RequestingUser,
}

/// Posts claims to `{base_url}/sample-evaluations/claims` with the admin
/// bearer token. A `401` triggers one credential refresh and one retry.
#[derive(Debug, Clone)]
pub struct HttpClaimEvaluator {
    client: Client,
    base_url: String,
    credential: AdminCredential,
}

impl HttpClaimEvaluator {
    pub fn new(
        mut base_url: String,
        credential: AdminCredential,
        request_timeout: Duration,
    ) -> Result<Self, EvaluationError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EvaluationError::Unreachable(e.to_string()))?;
        let trimmed_len = base_url.trim_end_matches('/').len();
        base_url.truncate(trimmed_len);
        Ok(Self {
            client,
            base_url,
            credential,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url, EVALUATE_PATH)
    }

    async fn post(&self, token: &str, body: &EvaluationRequest<'_>) -> Result<reqwest::Response, EvaluationError> {
        self.client
            .post(self.endpoint())
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| EvaluationError::Unreachable(e.to_string()))
    }
}

#[async_trait::async_trait]
impl ClaimEvaluator for HttpClaimEvaluator {
    #[instrument(skip(self, claim, user), fields(user_id = %user.id), err)]
    async fn evaluate(&self, claim: &JsonValue, user: &RequestingUser) -> Result<(), EvaluationError> {
        let body = EvaluationRequest { claim, user };

        let token = self.credential.token().await?;
        let mut response = self.post(&token, &body).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("evaluator rejected admin token; refreshing");
            let token = self.credential.refresh().await?;
            response = self.post(&token, &body).await?;
        }

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(EvaluationError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}
