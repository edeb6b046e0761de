//! Liveness endpoint.

use axum::extract::State;
use axum::Json;
use devfleet_core::DeviceState;
use serde::Serialize;

use crate::state::GatewayState;

/// Liveness body with a coarse fleet summary.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"` while the process serves requests.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Attached devices.
    pub devices: usize,
    /// Attached devices in `Ready`.
    pub ready: usize,
}

/// `GET /health`
pub async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    let snapshots = state.fleet.snapshots();
    let ready = snapshots
        .iter()
        .filter(|s| s.state == DeviceState::Ready)
        .count();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        devices: snapshots.len(),
        ready,
    })
}
