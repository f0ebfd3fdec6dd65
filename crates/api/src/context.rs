use claimflow_core::RequestingUser;

/// Requesting user for a request, as forwarded by the gateway.
///
/// Present on every `/lab-tests` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    user: RequestingUser,
}

impl UserContext {
    pub fn new(user: RequestingUser) -> Self {
        Self { user }
    }

    pub fn user(&self) -> &RequestingUser {
        &self.user
    }
}
