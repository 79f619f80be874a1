//! WebSocket connect handshake.
//!
//! ## Connection lifecycle
//!
//! 1. A device issues `GET /api/v1/device` with its name in the configured
//!    device-name header (`X-Webpa-Device-Name` by default) and, optionally,
//!    inventory attributes in `X-Webpa-Convey`.
//! 2. Identity, convey compliance, the connect filter, and the routing key
//!    are all resolved **before** the protocol upgrade completes, so policy
//!    failures surface as plain HTTP status codes.
//! 3. After the upgrade the connection is handed to
//!    [`DeviceManager::run_connection`], which owns it until disconnect.
//!
//! ## Rejection status codes
//!
//! | Failure                    | Status |
//! |----------------------------|--------|
//! | missing/invalid device name| 400    |
//! | connect filter rejection   | 403    |
//! | registry at capacity       | 503    |
//! | gateway shutting down      | 503    |

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::convey::Convey;
use crate::error::DeviceError;
use crate::id;
use crate::state::AppState;

/// `GET /api/v1/device` — device connect upgrade handler.
pub async fn device_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let manager = state.manager.clone();
    if manager.is_shutting_down() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "gateway is shutting down");
    }

    let device_id = match id::id_from_headers(&headers, &state.config.device.device_name_header) {
        Ok(device_id) => device_id,
        Err(err) => return reject(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let (convey, compliance) = Convey::from_headers(&headers);
    debug!(id = %device_id, compliance = ?compliance, "device connecting");

    if let Some(filter) = &manager.options().filter {
        if let Err(err) = filter(&device_id, convey.as_ref(), &headers) {
            let status = match err {
                DeviceError::TooManyDevices => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::FORBIDDEN,
            };
            return reject(status, &err.to_string());
        }
    }

    let key = match (manager.options().key_func)(&device_id, convey.as_ref(), &headers) {
        Ok(key) => key,
        Err(err) => return reject(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let max_frame = manager.options().max_frame_bytes;
    let ws = if max_frame > 0 {
        ws.max_message_size(max_frame)
    } else {
        ws
    };

    ws.on_upgrade(move |socket| async move {
        manager
            .run_connection(socket, device_id, key, convey, compliance)
            .await;
    })
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    #[test]
    fn test_rejection_body_shape() {
        let response = reject(StatusCode::BAD_REQUEST, &DeviceError::InvalidDeviceName.to_string());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
