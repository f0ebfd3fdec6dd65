//! Administrative credential used to call the evaluator.
//!
//! Resolved once at startup into an [`AdminCredential`]; callers ask it for a
//! token and it refreshes through its [`CredentialSource`] when the current
//! token is about to expire, or when asked to explicitly (e.g. after a 401).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use super::EvaluationError;

/// Tokens are considered expired this long before their actual expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminToken {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AdminToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => {
                let skew = chrono::Duration::from_std(EXPIRY_SKEW).unwrap_or_default();
                now + skew >= at
            }
            None => false,
        }
    }
}

/// Where admin tokens come from.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<AdminToken, EvaluationError>;
}

/// Fixed, non-expiring token (configuration or tests).
#[derive(Debug, Clone)]
pub struct StaticCredentialSource {
    token: String,
}

impl StaticCredentialSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn fetch(&self) -> Result<AdminToken, EvaluationError> {
        if self.token.trim().is_empty() {
            return Err(EvaluationError::Credential("empty static token".to_string()));
        }
        Ok(AdminToken {
            value: self.token.clone(),
            expires_at: None,
        })
    }
}

/// OAuth password-grant token endpoint.
#[derive(Debug, Clone)]
pub struct PasswordGrantSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

impl PasswordGrantSource {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialSource for PasswordGrantSource {
    async fn fetch(&self) -> Result<AdminToken, EvaluationError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .query(&[
                ("grant_type", "password"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| EvaluationError::Credential(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EvaluationError::Credential(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| EvaluationError::Credential(format!("invalid token response: {e}")))?;

        Ok(AdminToken {
            value: body.access_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}

/// Process-wide admin credential with an explicit refresh contract.
#[derive(Clone)]
pub struct AdminCredential {
    source: Arc<dyn CredentialSource>,
    current: Arc<RwLock<AdminToken>>,
}

impl std::fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredential").finish_non_exhaustive()
    }
}

impl AdminCredential {
    /// Fetch the first token. Fails startup when the source cannot deliver.
    pub async fn resolve(source: Arc<dyn CredentialSource>) -> Result<Self, EvaluationError> {
        let token = source.fetch().await?;
        Ok(Self {
            source,
            current: Arc::new(RwLock::new(token)),
        })
    }

    /// Current token, refreshed first if it is (about to be) expired.
    pub async fn token(&self) -> Result<String, EvaluationError> {
        {
            let current = self.current.read().await;
            if !current.is_expired(Utc::now()) {
                return Ok(current.value.clone());
            }
        }
        self.refresh().await
    }

    /// Unconditionally fetch a new token.
    pub async fn refresh(&self) -> Result<String, EvaluationError> {
        let token = self.source.fetch().await?;
        info!(expires_at = ?token.expires_at, "admin credential refreshed");
        let value = token.value.clone();
        *self.current.write().await = token;
        Ok(value)
    }
}
