//! Routes of the backend.
//!
//! - `/api/?<rest>` and `/?<rest>`: every action, any method; the handler
//!   answers unsupported methods with a JSON error
//! - `GET /healthz`, `GET /readyz`: probes

use crate::{
    handlers::{
        api_handlers::api,
        health_handlers::{healthz, readyz},
    },
    services::AppState,
};
use axum::{
    Router,
    routing::{any, get},
};

/// Build the router; the caller supplies the [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", any(api))
        .route("/api", any(api))
        .route("/api/", any(api))
}
