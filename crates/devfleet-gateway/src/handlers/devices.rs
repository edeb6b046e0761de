//! Device listing and cold reset endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use devfleet_agent::{ColdResetOutcome, DeviceSnapshot};
use devfleet_core::DeviceId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::GatewayState;

/// Response for the device list.
#[derive(Debug, Serialize)]
pub struct ListDevicesResponse {
    /// Attached devices, sorted by udid.
    pub devices: Vec<DeviceSnapshot>,
}

/// Query string of `POST /cold`.
#[derive(Debug, Deserialize)]
pub struct ColdQuery {
    /// Device to reset.
    pub udid: Option<String>,
}

/// `GET /devices`
pub async fn list_devices(State(state): State<GatewayState>) -> Json<ListDevicesResponse> {
    Json(ListDevicesResponse {
        devices: state.fleet.snapshots(),
    })
}

/// `GET /devices/:udid`
///
/// # Errors
///
/// Returns 400 for an unknown device.
pub async fn get_device(
    State(state): State<GatewayState>,
    Path(udid): Path<String>,
) -> Result<Json<DeviceSnapshot>, ApiError> {
    let udid = parse_udid(&udid)?;
    state
        .fleet
        .get(&udid)
        .map(|lifecycle| Json(lifecycle.snapshot()))
        .ok_or_else(|| not_found(udid.as_str()))
}

/// `POST /devices/:udid/cold`
///
/// # Errors
///
/// Returns 400 for an unknown device and 409 when the device is still
/// preparing. A reset that ran but failed is a 200 with `success: false`.
pub async fn cold_device(
    State(state): State<GatewayState>,
    Path(udid): Path<String>,
) -> Result<Json<ColdResetOutcome>, ApiError> {
    cold_reset(&state, &udid).await
}

/// `POST /cold?udid=...`
///
/// # Errors
///
/// As [`cold_device`], plus 400 when `udid` is missing.
pub async fn cold_by_query(
    State(state): State<GatewayState>,
    Query(query): Query<ColdQuery>,
) -> Result<Json<ColdResetOutcome>, ApiError> {
    let udid = query
        .udid
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("udid is required".to_string()))?;
    cold_reset(&state, &udid).await
}

async fn cold_reset(state: &GatewayState, raw: &str) -> Result<Json<ColdResetOutcome>, ApiError> {
    let udid = parse_udid(raw)?;
    info!(udid = %udid, "Cold reset via HTTP");
    let outcome = state.coordinator.reset(&udid).await?;
    Ok(Json(outcome))
}

fn parse_udid(raw: &str) -> Result<DeviceId, ApiError> {
    DeviceId::parse(raw.trim()).map_err(|_| not_found(raw))
}

fn not_found(udid: &str) -> ApiError {
    ApiError::BadRequest(format!("udid: {udid} not found"))
}
