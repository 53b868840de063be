//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (backend, job services, dispatch router)
//! - `routes.rs`: HTTP handlers
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

use jobgate_infra::jobs::SpawnError;
use jobgate_infra::store::InMemoryBackend;
use jobgate_infra::ServerConfig;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router over a fresh in-memory backend.
pub fn build_app(config: &ServerConfig) -> Result<Router, SpawnError> {
    build_app_with_backend(config, InMemoryBackend::new())
}

/// Build the full HTTP router over `backend`.
pub fn build_app_with_backend(config: &ServerConfig, backend: InMemoryBackend) -> Result<Router, SpawnError> {
    let dispatch = Arc::new(services::build_dispatch_router(config, backend)?);

    Ok(Router::new()
        .route("/health", get(routes::health))
        .route("/rpc/:service", post(routes::rpc))
        .layer(Extension(dispatch)))
}
