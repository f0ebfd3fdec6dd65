//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (stores, bus, cache, evaluator, pipeline)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router from the environment (entrypoint used by `main.rs`).
pub async fn build_app() -> anyhow::Result<Router> {
    let services = services::build_services().await?;
    Ok(build_app_with(services))
}

/// Build the router over already-wired services.
pub fn build_app_with(services: services::AppServices) -> Router {
    let services = Arc::new(services);

    // Lab-test routes: require a gateway-resolved user.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn(middleware::user_context_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
