use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use claimflow_infra::pipeline::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    let message = err.to_string();
    match err.root() {
        PipelineError::InvalidRequest(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        PipelineError::UnknownWorkItem(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        PipelineError::Dispatch(_) => json_error(StatusCode::BAD_GATEWAY, "dispatch_error", message),
        PipelineError::Persistence(_) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", message),
        _ => json_error(StatusCode::INTERNAL_SERVER_ERROR, "pipeline_error", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
