//! The identity a batch is submitted on behalf of.

use serde::{Deserialize, Serialize};

/// Requesting user, as resolved by the inbound authentication layer.
///
/// `id` feeds cache-key derivation. `username` and `lab_code` are carried as
/// forwarded by the gateway and reported back on `/whoami`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestingUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab_code: Option<String>,
}

impl RequestingUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            lab_code: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_lab_code(mut self, lab_code: impl Into<String>) -> Self {
        self.lab_code = Some(lab_code.into());
        self
    }
}
