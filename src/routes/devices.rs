//! REST endpoints for device inspection and operator disconnects.
//!
//! - `GET    /api/v1/devices`           — list connected devices
//! - `GET    /api/v1/devices/{id}`      — single device projection
//! - `GET    /api/v1/devices/{id}/stat` — statistics snapshot
//! - `DELETE /api/v1/devices/{id}`      — operator disconnect
//!
//! These are thin views over the manager; the device JSON shape is the
//! stable projection (`id`, `key`, `pending`, `statistics`, `connectedAt`,
//! `closed`, `closeReason`).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::CloseReason;
use crate::id::DeviceId;
use crate::AppState;

type RouteError = (StatusCode, Json<Value>);

fn parse_id(raw: &str) -> Result<DeviceId, RouteError> {
    DeviceId::parse(raw).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string(), "code": "INVALID_DEVICE_NAME"})),
        )
    })
}

fn not_found(id: &DeviceId) -> RouteError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Device {id} not connected"), "code": "DEVICE_NOT_FOUND"})),
    )
}

/// `GET /api/v1/devices` — list all connected devices.
pub async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    let registry = state.manager.registry();
    let mut devices: Vec<Value> = Vec::with_capacity(registry.len());
    registry.visit_all(|device| {
        devices.push(serde_json::to_value(&**device).unwrap_or(Value::Null));
    });

    Json(json!({
        "devices": devices,
        "count": devices.len(),
    }))
}

/// `GET /api/v1/devices/{id}` — one device's stable JSON projection.
pub async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, RouteError> {
    let id = parse_id(&id)?;
    let device = state.manager.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(serde_json::to_value(&*device).unwrap_or(Value::Null)))
}

/// `GET /api/v1/devices/{id}/stat` — statistics counters only.
pub async fn device_stat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, RouteError> {
    let id = parse_id(&id)?;
    let device = state.manager.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(json!({
        "id": device.id(),
        "connectedAt": device.connected_at_ms(),
        "pending": device.pending(),
        "statistics": device.statistics().snapshot(),
    })))
}

#[derive(Deserialize, Default)]
pub struct DisconnectRequest {
    /// Close reason in camelCase (e.g. `"goAway"`). Defaults to `"goAway"`.
    pub reason: Option<String>,
}

/// `DELETE /api/v1/devices/{id}` — disconnect a device.
pub async fn disconnect_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<DisconnectRequest>>,
) -> Result<Json<Value>, RouteError> {
    let id = parse_id(&id)?;
    let reason = payload
        .as_ref()
        .and_then(|p| p.reason.as_deref())
        .map_or(Ok(CloseReason::GoAway), |raw| {
            CloseReason::from_str_opt(raw).ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("Unknown close reason {raw:?}"), "code": "INVALID_CLOSE_REASON"})),
                )
            })
        })?;

    if state.manager.get(&id).is_none() {
        return Err(not_found(&id));
    }

    let closed = state.manager.disconnect(&id, reason);
    info!(id = %id, reason = %reason, closed, "operator disconnect");

    Ok(Json(json!({
        "ok": true,
        "id": id,
        "reason": reason.as_str(),
        "closed": closed,
    })))
}
