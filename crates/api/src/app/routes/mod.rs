use axum::{
    Router,
    routing::{get, post},
};

pub mod system;

/// Router for all endpoints that act on behalf of a requesting user.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/lab-tests", post(lab_tests::submit))
        .route("/lab-tests/:ian/status", get(lab_tests::status))
}
