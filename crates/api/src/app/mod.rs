//! Axum application wiring.
//!
//! - `services.rs`: store, engine and runner wiring from `AppConfig`
//! - `routes/`: handlers, one file per resource
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: JSON error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices, ServicesError};

/// Full router over `services`.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
