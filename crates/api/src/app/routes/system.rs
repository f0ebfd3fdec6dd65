use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::context::UserContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(ctx): Extension<UserContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "user_id": ctx.user().id,
        "username": ctx.user().username,
        "lab_code": ctx.user().lab_code,
    }))
}
