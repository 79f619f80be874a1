//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware; the device connect upgrade authenticates through the manager's
//! key function instead.

pub mod devices;
pub mod health;

use axum::{
    middleware,
    routing::get,
    Extension, Router,
};

use crate::auth::{self, ApiKey};
use crate::state::AppState;
use crate::ws;

/// Build the gateway router: health probe, device connect upgrade, and the
/// authenticated device control surface.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/v1/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/v1/devices", get(devices::list_devices))
        .route(
            "/api/v1/devices/{id}",
            get(devices::get_device).delete(devices::disconnect_device),
        )
        .route("/api/v1/devices/{id}/stat", get(devices::device_stat))
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_route = Router::new().route("/api/v1/device", get(ws::device_connect));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .with_state(state)
}
