//! Device REST endpoints
//!
//! Read-only: devices enter the fleet by registering over their own
//! socket, never through this surface. Each response pairs the stored
//! record with whether a live transport is currently bound, since
//! ONLINE status and an open socket can briefly disagree around the
//! liveness sweep.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::{Device, DeviceStatus};

use super::commands::ErrorBody;
use super::ApiState;

/// A device record plus its live-connection flag
#[derive(Serialize)]
pub struct DeviceResponse {
    #[serde(flatten)]
    pub device: Device,
    pub connected: bool,
}

#[derive(Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<DeviceStatus>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn err(code: StatusCode, message: impl Into<String>) -> ApiError {
    (
        code,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// Build device routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_devices))
        .route("/{id}", get(get_device))
        .with_state(state)
}

/// List devices, optionally filtered by status
async fn list_devices(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DeviceListResponse>, ApiError> {
    let all = state.device_repo.list_all().map_err(|e| {
        tracing::error!(error = %e, "device listing failed");
        err(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })?;

    let mut devices = Vec::with_capacity(all.len());
    for device in all {
        if query.status.is_some_and(|s| s != device.status) {
            continue;
        }
        let connected = state.registry.is_connected(&device.id).await;
        devices.push(DeviceResponse { device, connected });
    }

    Ok(Json(DeviceListResponse { devices }))
}

/// Get a single device
async fn get_device(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device = state
        .device_repo
        .find(&id)
        .map_err(|e| {
            tracing::error!(error = %e, "device lookup failed");
            err(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "device not found"))?;

    let connected = state.registry.is_connected(&device.id).await;
    Ok(Json(DeviceResponse { device, connected }))
}
