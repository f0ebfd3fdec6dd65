use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use claimflow_core::RequestingUser;

use crate::context::UserContext;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USERNAME_HEADER: &str = "x-username";
pub const LAB_CODE_HEADER: &str = "x-lab-code";

/// Resolve the requesting user from gateway headers.
///
/// Authentication happens upstream; a request without `x-user-id` never got
/// through it and is refused.
pub async fn user_context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let user = extract_user(req.headers())?;
    req.extensions_mut().insert(UserContext::new(user));
    Ok(next.run(req).await)
}

fn extract_user(headers: &HeaderMap) -> Result<RequestingUser, StatusCode> {
    let id = header_value(headers, USER_ID_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;

    let mut user = RequestingUser::new(id);
    if let Some(username) = header_value(headers, USERNAME_HEADER) {
        user = user.with_username(username);
    }
    if let Some(lab_code) = header_value(headers, LAB_CODE_HEADER) {
        user = user.with_lab_code(lab_code);
    }
    Ok(user)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
