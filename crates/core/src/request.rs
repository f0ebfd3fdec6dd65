//! Incoming lab-test submission request.
//!
//! The request is kept close to what the inbound gateway forwards: the HTTP
//! method and URL it was received on, plus a JSON body whose `ians` list drives
//! the batch. Every other body field (codes, sample attributes, ...) is carried
//! through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DomainError, DomainResult};
use crate::id::WorkItemId;

/// A batch submission as received from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_body: RequestBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Request body: the ordered work items plus arbitrary attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub ians: Vec<WorkItemId>,
    #[serde(flatten)]
    pub attributes: Map<String, JsonValue>,
}

impl RequestBody {
    /// Copy of this body with `ians` narrowed to a single work item.
    pub fn narrowed_to(&self, ian: &WorkItemId) -> RequestBody {
        RequestBody {
            ians: vec![ian.clone()],
            attributes: self.attributes.clone(),
        }
    }

    pub fn to_value(&self) -> DomainResult<JsonValue> {
        serde_json::to_value(self)
            .map_err(|e| DomainError::validation(format!("request body is not serializable: {e}")))
    }
}

impl IncomingRequest {
    /// Check the request can be processed as a batch.
    ///
    /// The batch must be non-empty and every work item non-blank; method and
    /// URL are required because they are persisted with every queue entry.
    pub fn validate(&self) -> DomainResult<()> {
        if self.method.trim().is_empty() {
            return Err(DomainError::validation("method must not be empty"));
        }
        if self.url.trim().is_empty() {
            return Err(DomainError::validation("url must not be empty"));
        }
        if self.request_body.ians.is_empty() {
            return Err(DomainError::validation("request_body.ians must contain at least one work item"));
        }
        for (idx, ian) in self.request_body.ians.iter().enumerate() {
            if ian.as_str().trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "request_body.ians[{idx}] must not be blank"
                )));
            }
        }
        Ok(())
    }

    /// Work items in submission order.
    pub fn work_items(&self) -> &[WorkItemId] {
        &self.request_body.ians
    }

    /// Copy of the whole request restricted to a single work item.
    pub fn narrowed_to(&self, ian: &WorkItemId) -> IncomingRequest {
        IncomingRequest {
            request_body: self.request_body.narrowed_to(ian),
            ..self.clone()
        }
    }

    pub fn to_value(&self) -> DomainResult<JsonValue> {
        serde_json::to_value(self)
            .map_err(|e| DomainError::validation(format!("request is not serializable: {e}")))
    }
}
